//! Stage policies: what a stage does once an event reaches a worker.
//!
//! A [`Policy`] is selected when the stage is built and supplies three
//! behaviors to the lifecycle in [`crate::stage`]:
//! - `work`: the stage-specific behavior, possibly delegating to an inner stage
//! - `on_success`: bookkeeping after work succeeded
//! - `on_fail`: bookkeeping after work failed; decides the final response

use std::rc::Rc;

use crate::clock::Clock;
use crate::error::WorkError;
use crate::event::{Event, Response};
use crate::stage::Stage;

mod cache;
mod circuit_breaker;
mod dependency;
mod key_counter;
mod retry;
mod timeout;

pub use cache::{Cache, CacheMode, CacheSnapshot, CacheStore};
pub use circuit_breaker::{Breaker, BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use dependency::{AvailabilityModel, Dependency};
pub use key_counter::KeyCounter;
pub use retry::Retry;
pub use timeout::Timeout;

/// Behavior plugged into a [`Stage`].
#[derive(Debug)]
pub enum Policy {
    Cache(Cache),
    CircuitBreaker(CircuitBreaker),
    Retry(Retry),
    Timeout(Timeout),
    Dependency(Dependency),
    KeyCounter(KeyCounter),
}

impl Policy {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cache(cache) => cache.kind(),
            Self::CircuitBreaker(_) => "circuit-breaker",
            Self::Retry(_) => "retry",
            Self::Timeout(_) => "timeout",
            Self::Dependency(_) => "dependency",
            Self::KeyCounter(_) => "key-counter",
        }
    }

    /// The wrapped stage, for decorating policies.
    pub fn inner(&self) -> Option<&Rc<Stage>> {
        match self {
            Self::Cache(p) => Some(p.inner()),
            Self::CircuitBreaker(p) => Some(p.inner()),
            Self::Retry(p) => Some(p.inner()),
            Self::Timeout(p) => Some(p.inner()),
            Self::KeyCounter(p) => Some(p.inner()),
            Self::Dependency(_) => None,
        }
    }

    pub(crate) async fn work(&self, clock: &Clock, event: &Event) -> Result<(), WorkError> {
        match self {
            Self::Cache(p) => p.work(clock, event).await,
            Self::CircuitBreaker(p) => p.work(clock, event).await,
            Self::Retry(p) => p.work(event).await,
            Self::Timeout(p) => p.work(clock, event).await,
            Self::Dependency(p) => p.work(clock).await,
            Self::KeyCounter(p) => p.work(event).await,
        }
    }

    pub(crate) fn on_success(&self, clock: &Clock, _event: &Event) {
        if let Self::CircuitBreaker(p) = self {
            p.on_success(clock);
        }
    }

    pub(crate) fn on_fail(&self, clock: &Clock, _event: &Event, err: WorkError) -> Response {
        match self {
            Self::CircuitBreaker(p) => p.on_fail(clock, err),
            _ => Response::Fail,
        }
    }
}

/// Maps an inner stage's response to a work outcome.
fn upstream(response: Response) -> Result<(), WorkError> {
    match response {
        Response::Success => Ok(()),
        Response::Fail => Err(WorkError::Upstream),
    }
}

macro_rules! impl_from_policy {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Policy {
                fn from(policy: $variant) -> Self {
                    Self::$variant(policy)
                }
            }
        )*
    };
}

impl_from_policy!(Cache, CircuitBreaker, Retry, Timeout, Dependency, KeyCounter);
