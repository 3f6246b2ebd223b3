//! Events and responses.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::Serialize;

use crate::clock::Tick;
use crate::stats::TimeStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ev-{}", self.0)
    }
}

/// One simulated request traversing the pipeline.
///
/// Clones are handles to the same occurrence: timing records appended
/// through any clone are visible through all of them. Retries and
/// downstream forwarding pass clones.
#[derive(Debug, Clone)]
pub struct Event {
    id: EventId,
    key: Rc<str>,
    timings: Rc<RefCell<Vec<TimeStats>>>,
}

impl Event {
    pub fn new(id: EventId, key: impl Into<Rc<str>>) -> Self {
        Self {
            id,
            key: key.into(),
            timings: Rc::default(),
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Appends an empty timing record for `stage` and returns its index.
    pub(crate) fn begin_stage(&self, stage: &str) -> usize {
        let mut timings = self.timings.borrow_mut();
        timings.push(TimeStats::new(stage));
        timings.len() - 1
    }

    pub(crate) fn record_queue_wait(&self, record: usize, ticks: Tick) {
        if let Some(t) = self.timings.borrow_mut().get_mut(record) {
            t.queue_wait_ticks += ticks;
        }
    }

    pub(crate) fn record_work(&self, record: usize, ticks: Tick) {
        if let Some(t) = self.timings.borrow_mut().get_mut(record) {
            t.work_ticks += ticks;
        }
    }

    /// Timing records in the order stages were entered.
    pub fn timings(&self) -> Vec<TimeStats> {
        self.timings.borrow().clone()
    }
}

/// Terminal outcome of an event at a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    Success,
    Fail,
}

impl Response {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Fail => f.write_str("fail"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_timings() {
        let event = Event::new(EventId(1), "a");
        let copy = event.clone();

        let record = copy.begin_stage("cache");
        copy.record_queue_wait(record, 3);
        copy.record_work(record, 150);

        let timings = event.timings();
        assert_eq!(timings.len(), 1);
        assert_eq!(timings[0].stage, "cache");
        assert_eq!(timings[0].queue_wait_ticks, 3);
        assert_eq!(timings[0].work_ticks, 150);
    }

    #[test]
    fn response_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Response::Fail).unwrap(), "\"fail\"");
        assert!(Response::Success.is_success());
    }
}
