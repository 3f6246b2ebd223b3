//! Run reports and report sinks.

use std::io::Write;

use serde::Serialize;

use crate::clock::Tick;
use crate::error::SimError;
use crate::event::{EventId, Response};
use crate::stats::{StageStats, TimeStats};

/// What happened to one generated event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub id: EventId,
    pub key: String,
    pub response: Response,
    pub start_tick: Tick,
    pub end_tick: Tick,
    pub stages: Vec<TimeStats>,
}

impl EventRecord {
    pub fn latency(&self) -> Tick {
        self.end_tick - self.start_tick
    }
}

/// Aggregate over all events with one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OutcomeSummary {
    pub count: u64,
    pub percent: f64,
    pub mean_latency: f64,
    /// Population standard deviation.
    pub std_latency: f64,
}

impl OutcomeSummary {
    fn from_latencies(latencies: &[Tick], total: u64) -> Self {
        if latencies.is_empty() {
            return Self::default();
        }
        let count = latencies.len() as f64;
        let mean = latencies.iter().map(|l| *l as f64).sum::<f64>() / count;
        let variance = latencies
            .iter()
            .map(|l| (*l as f64 - mean).powi(2))
            .sum::<f64>()
            / count;
        Self {
            count: latencies.len() as u64,
            percent: 100.0 * count / total as f64,
            mean_latency: mean,
            std_latency: variance.sqrt(),
        }
    }
}

/// Result of a driver run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub total: u64,
    pub success: OutcomeSummary,
    pub fail: OutcomeSummary,
    pub start_tick: Tick,
    pub end_tick: Tick,
    pub events: Vec<EventRecord>,
}

impl Report {
    pub fn from_records(mut events: Vec<EventRecord>, start_tick: Tick, end_tick: Tick) -> Self {
        events.sort_by_key(|e| e.id);
        let total = events.len() as u64;

        let latencies = |response: Response| -> Vec<Tick> {
            events
                .iter()
                .filter(|e| e.response == response)
                .map(EventRecord::latency)
                .collect()
        };
        let success = OutcomeSummary::from_latencies(&latencies(Response::Success), total);
        let fail = OutcomeSummary::from_latencies(&latencies(Response::Fail), total);

        Self {
            total,
            success,
            fail,
            start_tick,
            end_tick,
            events,
        }
    }

    pub fn summary(&self, response: Response) -> &OutcomeSummary {
        match response {
            Response::Success => &self.success,
            Response::Fail => &self.fail,
        }
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Destination for run results. Presentation lives behind this trait.
pub trait ReportSink {
    fn write_report(&mut self, report: &Report) -> Result<(), SimError>;

    fn write_stage_stats(&mut self, stats: &[StageStats]) -> Result<(), SimError>;
}

/// Writes results as JSON documents, one per call.
pub struct JsonSink<W: Write> {
    writer: W,
    pretty: bool,
    include_events: bool,
}

#[derive(Serialize)]
struct ReportView<'a> {
    total: u64,
    success: &'a OutcomeSummary,
    fail: &'a OutcomeSummary,
    start_tick: Tick,
    end_tick: Tick,
    #[serde(skip_serializing_if = "Option::is_none")]
    events: Option<&'a [EventRecord]>,
}

impl<W: Write> JsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            pretty: false,
            include_events: false,
        }
    }

    pub fn pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    /// Include per-event records in the report document.
    pub fn include_events(mut self, include: bool) -> Self {
        self.include_events = include;
        self
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn emit<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), SimError> {
        if self.pretty {
            serde_json::to_writer_pretty(&mut self.writer, value)?;
        } else {
            serde_json::to_writer(&mut self.writer, value)?;
        }
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write> ReportSink for JsonSink<W> {
    fn write_report(&mut self, report: &Report) -> Result<(), SimError> {
        let view = ReportView {
            total: report.total,
            success: &report.success,
            fail: &report.fail,
            start_tick: report.start_tick,
            end_tick: report.end_tick,
            events: self.include_events.then_some(report.events.as_slice()),
        };
        self.emit(&view)
    }

    fn write_stage_stats(&mut self, stats: &[StageStats]) -> Result<(), SimError> {
        self.emit(stats)
    }
}

/// Emits results as `info` events.
#[derive(Debug, Default)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn write_report(&mut self, report: &Report) -> Result<(), SimError> {
        for (response, summary) in [
            (Response::Success, &report.success),
            (Response::Fail, &report.fail),
        ] {
            tracing::info!(
                %response,
                count = summary.count,
                percent = format_args!("{:.2}", summary.percent),
                mean_latency = format_args!("{:.2}", summary.mean_latency),
                std_latency = format_args!("{:.2}", summary.std_latency),
                "outcome"
            );
        }
        tracing::info!(
            total = report.total,
            ticks = report.end_tick - report.start_tick,
            "run complete"
        );
        Ok(())
    }

    fn write_stage_stats(&mut self, stats: &[StageStats]) -> Result<(), SimError> {
        for stage in stats {
            tracing::info!(
                stage = %stage.name,
                kind = stage.kind,
                arrived = stage.traffic.arrived,
                admitted = stage.traffic.admitted_to_work,
                succeeded = stage.traffic.succeeded,
                failed = stage.traffic.failed,
                rejected = stage.traffic.rejected,
                queue_wait_ticks = stage.time.queue_wait_ticks,
                work_ticks = stage.time.work_ticks,
                "stage"
            );
            if let Some(cache) = &stage.cache {
                tracing::info!(
                    stage = %stage.name,
                    hits = cache.hits,
                    misses = cache.misses,
                    evictions = cache.evictions,
                    expirations = cache.expirations,
                    hit_ratio = format_args!("{:.3}", cache.hit_ratio()),
                    "cache"
                );
            }
        }
        Ok(())
    }
}
