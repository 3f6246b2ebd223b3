//! Per-stage statistics.

use serde::Serialize;

use crate::clock::Tick;

/// Ticks spent waiting for a worker and working, for one stage.
///
/// Used both as a per-event timing record and as a stage's aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeStats {
    pub stage: String,
    pub queue_wait_ticks: Tick,
    pub work_ticks: Tick,
}

impl TimeStats {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..Self::default()
        }
    }
}

/// Event counters for one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficStats {
    pub arrived: u64,
    pub admitted_to_work: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Turned away at admission because the queue was full.
    pub rejected: u64,
}

impl TrafficStats {
    /// Events that arrived but have not finished yet.
    pub fn in_flight(&self) -> u64 {
        self.arrived - self.rejected - self.succeeded - self.failed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Snapshot of everything a stage exposes for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStats {
    pub name: String,
    pub kind: &'static str,
    pub time: TimeStats,
    pub traffic: TrafficStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
}
