//! Pipeline stage lifecycle.
//!
//! A [`Stage`] wraps admission control, queueing and work execution around
//! a [`Policy`]. Every event accepted by a stage goes through:
//!
//! ```text
//! arrived ─> admitted? ──no──> rejected (fail)
//!               │yes
//!            queued ─> working ─> succeeded | failed
//! ```
//!
//! The worker is held for the whole working phase and released on every
//! exit path.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures::FutureExt;
use futures::future::LocalBoxFuture;

use crate::clock::Clock;
use crate::event::{Event, Response};
use crate::queue::{Queue, QueueConfig};
use crate::stages::{Cache, CircuitBreaker, Dependency, KeyCounter, Policy};
use crate::stats::{StageStats, TimeStats, TrafficStats};

/// One hop in a pipeline.
pub struct Stage {
    name: String,
    clock: Clock,
    queue: Rc<Queue>,
    policy: Policy,
    downstream: Vec<Rc<Stage>>,
    time: RefCell<TimeStats>,
    traffic: Cell<TrafficStats>,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("kind", &self.policy.kind())
            .field("queue", &self.queue)
            .field("traffic", &self.traffic.get())
            .finish_non_exhaustive()
    }
}

impl Stage {
    pub fn builder() -> StageBuilder {
        StageBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.policy.kind()
    }

    pub fn queue(&self) -> &Rc<Queue> {
        &self.queue
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The stage this one decorates, if any.
    pub fn inner(&self) -> Option<&Rc<Stage>> {
        self.policy.inner()
    }

    pub fn downstream(&self) -> &[Rc<Stage>] {
        &self.downstream
    }

    pub fn traffic(&self) -> TrafficStats {
        self.traffic.get()
    }

    pub fn time(&self) -> TimeStats {
        self.time.borrow().clone()
    }

    pub fn stats(&self) -> StageStats {
        StageStats {
            name: self.name.clone(),
            kind: self.kind(),
            time: self.time(),
            traffic: self.traffic(),
            cache: self.cache().map(Cache::stats),
        }
    }

    pub fn cache(&self) -> Option<&Cache> {
        match &self.policy {
            Policy::Cache(cache) => Some(cache),
            _ => None,
        }
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        match &self.policy {
            Policy::CircuitBreaker(breaker) => Some(breaker),
            _ => None,
        }
    }

    pub fn dependency(&self) -> Option<&Dependency> {
        match &self.policy {
            Policy::Dependency(dependency) => Some(dependency),
            _ => None,
        }
    }

    pub fn key_counter(&self) -> Option<&KeyCounter> {
        match &self.policy {
            Policy::KeyCounter(counter) => Some(counter),
            _ => None,
        }
    }

    /// Runs `event` through this stage. The only entry point into a pipeline.
    pub fn accept(self: &Rc<Self>, event: Event) -> LocalBoxFuture<'static, Response> {
        Rc::clone(self).lifecycle(event).boxed_local()
    }

    async fn lifecycle(self: Rc<Self>, event: Event) -> Response {
        self.count(|t| t.arrived += 1);
        let record = event.begin_stage(&self.name);

        let acquire = match self.queue.try_enqueue(event.id()) {
            Ok(acquire) => acquire,
            Err(full) => {
                self.count(|t| t.rejected += 1);
                tracing::debug!(
                    stage = %self.name,
                    event = %event.id(),
                    capacity = full.capacity,
                    "admission rejected"
                );
                return Response::Fail;
            }
        };

        let queued_at = self.clock.now();
        let lease = acquire.await;
        let waited = self.clock.now() - queued_at;
        event.record_queue_wait(record, waited);
        self.time.borrow_mut().queue_wait_ticks += waited;
        self.count(|t| t.admitted_to_work += 1);

        let started = self.clock.now();
        let outcome = self.policy.work(&self.clock, &event).await;
        let worked = self.clock.now() - started;
        event.record_work(record, worked);
        self.time.borrow_mut().work_ticks += worked;

        let response = match outcome {
            Ok(()) => {
                self.count(|t| t.succeeded += 1);
                self.policy.on_success(&self.clock, &event);
                Response::Success
            }
            Err(err) => {
                self.count(|t| t.failed += 1);
                tracing::trace!(stage = %self.name, event = %event.id(), error = %err, "work failed");
                self.policy.on_fail(&self.clock, &event, err)
            }
        };
        if response.is_success() {
            self.forward(&event);
        }

        drop(lease);
        response
    }

    /// Hands `event` to every downstream stage without waiting for them.
    fn forward(&self, event: &Event) {
        for next in &self.downstream {
            drop(self.clock.spawn(next.accept(event.clone())));
        }
    }

    fn count(&self, update: impl FnOnce(&mut TrafficStats)) {
        let mut traffic = self.traffic.get();
        update(&mut traffic);
        self.traffic.set(traffic);
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Stage`].
#[derive(Default)]
pub struct StageBuilder {
    name: Option<String>,
    queue: QueueConfig,
    downstream: Vec<Rc<Stage>>,
}

impl StageBuilder {
    /// Stage name; defaults to the policy kind.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Adds a stage that receives every event this one succeeds on.
    pub fn downstream(mut self, stage: Rc<Stage>) -> Self {
        self.downstream.push(stage);
        self
    }

    pub fn build(self, clock: &Clock, policy: impl Into<Policy>) -> Rc<Stage> {
        let policy = policy.into();
        let name = self.name.unwrap_or_else(|| policy.kind().to_string());
        Rc::new(Stage {
            time: RefCell::new(TimeStats::new(name.clone())),
            traffic: Cell::new(TrafficStats::default()),
            name,
            clock: clock.clone(),
            queue: Queue::new(&self.queue),
            policy,
            downstream: self.downstream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::event::EventId;
    use crate::rng::SimRng;
    use crate::sampler::Sampler;
    use crate::stages::AvailabilityModel;

    fn dependency(vclock: &VirtualClock, queue: QueueConfig, available: bool) -> Rc<Stage> {
        let probability = if available { 1.0 } else { 0.0 };
        Stage::builder().queue(queue).build(
            &vclock.clock(),
            Dependency::new(
                AvailabilityModel::Constant(probability),
                Some(Sampler::constant(10.0)),
                SimRng::new(1),
            ),
        )
    }

    #[test]
    fn success_updates_counters_and_timings() {
        let mut vclock = VirtualClock::new();
        let stage = dependency(&vclock, QueueConfig::default(), true);
        let event = Event::new(EventId(1), "a");

        let response = vclock.run_until(stage.accept(event.clone())).unwrap();

        assert_eq!(response, Response::Success);
        let traffic = stage.traffic();
        assert_eq!(traffic.arrived, 1);
        assert_eq!(traffic.admitted_to_work, 1);
        assert_eq!(traffic.succeeded, 1);
        assert_eq!(traffic.in_flight(), 0);
        assert_eq!(stage.time().work_ticks, 10);
        assert_eq!(event.timings()[0].stage, "dependency");
        assert_eq!(event.timings()[0].work_ticks, 10);
        assert_eq!(stage.queue().busy_workers(), 0);
    }

    #[test]
    fn failure_still_accumulates_work_and_releases_worker() {
        let mut vclock = VirtualClock::new();
        let stage = dependency(&vclock, QueueConfig::bounded(1, 1), false);

        let response = vclock
            .run_until(stage.accept(Event::new(EventId(1), "a")))
            .unwrap();

        assert_eq!(response, Response::Fail);
        assert_eq!(stage.traffic().failed, 1);
        assert_eq!(stage.time().work_ticks, 10);
        assert_eq!(stage.queue().busy_workers(), 0);
    }

    #[test]
    fn rejection_when_queue_full() {
        let mut vclock = VirtualClock::new();
        let stage = dependency(&vclock, QueueConfig::bounded(1, 1), true);

        let accepts: Vec<_> = (0..3)
            .map(|id| stage.accept(Event::new(EventId(id), "k")))
            .collect();
        let responses = vclock
            .run_until(futures::future::join_all(accepts))
            .unwrap();

        assert_eq!(
            responses,
            vec![Response::Success, Response::Success, Response::Fail]
        );
        let traffic = stage.traffic();
        assert_eq!(traffic.arrived, 3);
        assert_eq!(traffic.rejected, 1);
        assert_eq!(traffic.admitted_to_work, 2);
        assert_eq!(traffic.failed, 0);
        assert_eq!(stage.time().queue_wait_ticks, 10);
    }

    #[test]
    fn downstream_receives_successes() {
        let mut vclock = VirtualClock::new();
        let sink = dependency(&vclock, QueueConfig::unbounded(), true);
        let head = Stage::builder().downstream(Rc::clone(&sink)).build(
            &vclock.clock(),
            Dependency::new(AvailabilityModel::Constant(1.0), None, SimRng::new(2)),
        );

        let response = vclock
            .run_until(head.accept(Event::new(EventId(1), "a")))
            .unwrap();
        assert_eq!(response, Response::Success);

        vclock.start(None);
        assert_eq!(sink.traffic().succeeded, 1);
    }
}
