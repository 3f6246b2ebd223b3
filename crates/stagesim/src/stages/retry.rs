//! Retry stage.

use std::rc::Rc;

use crate::error::WorkError;
use crate::event::Event;
use crate::stage::Stage;

/// Re-sends an event to the inner stage up to `count` extra times.
#[derive(Debug)]
pub struct Retry {
    inner: Rc<Stage>,
    count: u32,
}

impl Retry {
    pub fn new(inner: Rc<Stage>, count: u32) -> Self {
        Self { inner, count }
    }

    pub fn inner(&self) -> &Rc<Stage> {
        &self.inner
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub(crate) async fn work(&self, event: &Event) -> Result<(), WorkError> {
        let attempts = self.count.saturating_add(1);
        for attempt in 1..=attempts {
            let response = self.inner.accept(event.clone()).await;
            tracing::trace!(event = %event.id(), attempt, %response, "retry attempt");
            if response.is_success() {
                return Ok(());
            }
        }
        Err(WorkError::RetriesExhausted { attempts })
    }
}
