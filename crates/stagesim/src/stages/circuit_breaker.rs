//! Circuit breaker stage.
//!
//! Tracks the outcomes of recent calls to the inner stage in a ring of
//! `capacity` bits (1 = failure). Transitions:
//!
//! ```text
//!            ring full, error rate > threshold
//!   Closed ───────────────────────────────────> Open
//!     ^                                          │ open_ticks elapsed
//!     │ ring full, rate <= threshold             v (on next call)
//!     └───────────────────────────────────── HalfOpen
//!                  rate > threshold ──> Open
//! ```
//!
//! While open every call fails immediately without reaching the inner stage.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde::Serialize;
pub use stagesim_config::CircuitBreakerConfig;
use stagesim_config::ConfigError;

use super::upstream;
use crate::clock::{Clock, Tick};
use crate::error::WorkError;
use crate::event::{Event, Response};
use crate::stage::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker state machine, independent of any stage.
#[derive(Debug, Clone)]
pub struct Breaker {
    state: BreakerState,
    ring: VecDeque<u8>,
    opened_at: Tick,
    config: CircuitBreakerConfig,
}

impl Breaker {
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            state: BreakerState::Closed,
            ring: VecDeque::with_capacity(config.capacity),
            opened_at: 0,
            config,
        })
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Number of outcomes currently in the ring.
    pub fn recorded(&self) -> usize {
        self.ring.len()
    }

    pub fn opened_at(&self) -> Option<Tick> {
        (self.state == BreakerState::Open).then_some(self.opened_at)
    }

    /// Whether a call may reach the inner stage at `now`.
    ///
    /// An open breaker whose open period has elapsed moves to half-open and
    /// lets the call through.
    pub fn allow(&mut self, now: Tick) -> bool {
        if self.state != BreakerState::Open {
            return true;
        }
        if now.saturating_sub(self.opened_at) < self.config.open_ticks {
            return false;
        }
        self.ring.clear();
        self.transition(BreakerState::HalfOpen, now);
        true
    }

    /// Records one call outcome and evaluates the ring once it is full.
    ///
    /// Outcomes that arrive while open belong to calls started before the
    /// breaker opened and are ignored.
    pub fn record(&mut self, failed: bool, now: Tick) {
        if self.state == BreakerState::Open {
            return;
        }

        self.ring.push_back(u8::from(failed));
        while self.ring.len() > self.config.capacity {
            self.ring.pop_front();
        }
        if self.ring.len() < self.config.capacity {
            return;
        }

        let failures: u32 = self.ring.iter().map(|bit| u32::from(*bit)).sum();
        let error_rate = f64::from(failures) / self.config.capacity as f64;
        let tripped = error_rate > self.config.threshold;

        match (self.state, tripped) {
            (_, true) => {
                self.ring.clear();
                self.opened_at = now;
                self.transition(BreakerState::Open, now);
            }
            (BreakerState::HalfOpen, false) => self.transition(BreakerState::Closed, now),
            _ => {}
        }
    }

    fn transition(&mut self, to: BreakerState, now: Tick) {
        if self.state != to {
            tracing::debug!(from = ?self.state, to = ?to, tick = now, "circuit breaker transition");
            self.state = to;
        }
    }
}

/// Circuit breaker policy in front of an inner stage.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Rc<Stage>,
    breaker: RefCell<Breaker>,
}

impl CircuitBreaker {
    pub fn new(inner: Rc<Stage>, config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            inner,
            breaker: RefCell::new(Breaker::new(config)?),
        })
    }

    pub fn inner(&self) -> &Rc<Stage> {
        &self.inner
    }

    pub fn state(&self) -> BreakerState {
        self.breaker.borrow().state()
    }

    pub fn breaker(&self) -> std::cell::Ref<'_, Breaker> {
        self.breaker.borrow()
    }

    pub(crate) async fn work(&self, clock: &Clock, event: &Event) -> Result<(), WorkError> {
        if !self.breaker.borrow_mut().allow(clock.now()) {
            return Err(WorkError::CircuitOpen);
        }
        upstream(self.inner.accept(event.clone()).await)
    }

    pub(crate) fn on_success(&self, clock: &Clock) {
        self.breaker.borrow_mut().record(false, clock.now());
    }

    pub(crate) fn on_fail(&self, clock: &Clock, err: WorkError) -> Response {
        if err == WorkError::CircuitOpen {
            return Response::Fail;
        }
        let mut breaker = self.breaker.borrow_mut();
        breaker.record(true, clock.now());
        if breaker.config().report_failures_as_success {
            Response::Success
        } else {
            Response::Fail
        }
    }
}
