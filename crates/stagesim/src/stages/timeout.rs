//! Timeout stage.
//!
//! Races the inner stage against a deadline. When the deadline wins, the
//! inner call is not cancelled: it keeps its worker and runs to completion
//! in the background, and its result is discarded.

use std::rc::Rc;

use futures::future::{Either, select};

use crate::clock::{Clock, Tick};
use crate::error::WorkError;
use crate::event::{Event, Response};
use crate::stage::Stage;

#[derive(Debug)]
pub struct Timeout {
    inner: Rc<Stage>,
    ticks: Tick,
}

impl Timeout {
    pub fn new(inner: Rc<Stage>, ticks: Tick) -> Self {
        Self { inner, ticks }
    }

    pub fn inner(&self) -> &Rc<Stage> {
        &self.inner
    }

    pub fn ticks(&self) -> Tick {
        self.ticks
    }

    pub(crate) async fn work(&self, clock: &Clock, event: &Event) -> Result<(), WorkError> {
        let call = clock.spawn(self.inner.accept(event.clone()));
        let deadline = clock.wait(self.ticks);

        match select(call, deadline).await {
            Either::Left((Some(Response::Success), _)) => Ok(()),
            Either::Left(_) => Err(WorkError::Upstream),
            Either::Right(((), _orphan)) => {
                tracing::debug!(event = %event.id(), ticks = self.ticks, "timed out");
                Err(WorkError::TimedOut)
            }
        }
    }
}
