//! # stagesim: Discrete-event simulation of resilience patterns
//!
//! This crate simulates request pipelines built from caches, circuit
//! breakers, retries and timeouts in front of an unreliable dependency, on a
//! virtual clock. It is meant for comparing quality of service, staleness
//! and availability of different compositions before building the real
//! thing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Simulation Run                         │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐   │
//! │  │ VirtualClock │   │ LocalPool    │   │ SimRng           │   │
//! │  │ (callbacks)  │   │ (tasks)      │   │ (deterministic)  │   │
//! │  └──────────────┘   └──────────────┘   └──────────────────┘   │
//! │                                                               │
//! │  Driver ─> Retry ─> Timeout ─> CircuitBreaker ─> Cache ─> Dep │
//! │            (each stage: admission ─> queue ─> worker ─> work) │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Components
//!
//! - **[`VirtualClock`]** / **[`Clock`]**: tick counter, callback scheduler and
//!   single-threaded executor. All concurrency is interleaving of tasks at
//!   explicit suspension points.
//! - **[`Queue`]**: bounded FIFO admission queue and worker pool per stage.
//! - **[`Stage`]**: the accept lifecycle, parameterized by a [`Policy`].
//! - **[`stages`]**: cache (unbounded, LRU/TTL, cache-aside), circuit
//!   breaker, retry, timeout, key counter and the simulated dependency.
//! - **[`Pipeline`]**: composes stages from a layer list.
//! - **[`Driver`]**: generates arrivals and produces a [`Report`].
//!
//! ## Example
//!
//! ```
//! use stagesim::{
//!     AvailabilityModel, Cache, Dependency, Event, EventId, Response, Sampler, SimRng, Stage,
//!     VirtualClock,
//! };
//!
//! let mut vclock = VirtualClock::new();
//! let clock = vclock.clock();
//!
//! let dependency = Stage::builder().build(
//!     &clock,
//!     Dependency::new(
//!         AvailabilityModel::Constant(1.0),
//!         Some(Sampler::constant(150.0)),
//!         SimRng::new(0),
//!     ),
//! );
//! let cache = Stage::builder().build(&clock, Cache::new(dependency));
//!
//! let response = vclock
//!     .run_until(cache.accept(Event::new(EventId(0), "a")))
//!     .unwrap();
//! assert_eq!(response, Response::Success);
//! assert_eq!(vclock.now(), 150);
//! ```

pub mod clock;
pub mod driver;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod queue;
pub mod report;
pub mod rng;
pub mod sampler;
pub mod stage;
pub mod stages;
pub mod stats;

pub use clock::{Clock, JoinHandle, Sleep, StopReason, Tick, VirtualClock};
pub use driver::{Driver, DriverConfig};
pub use error::{QueueFull, SamplerError, SimError, WorkError};
pub use event::{Event, EventId, Response};
pub use pipeline::{CacheSample, Pipeline, PipelineBuilder};
pub use queue::{Acquire, Queue, QueueConfig, WorkerLease};
pub use report::{EventRecord, JsonSink, OutcomeSummary, Report, ReportSink, TracingSink};
pub use rng::SimRng;
pub use sampler::Sampler;
pub use stage::{Stage, StageBuilder};
pub use stages::{
    AvailabilityModel, Breaker, BreakerState, Cache, CacheMode, CacheSnapshot, CacheStore,
    CircuitBreaker, CircuitBreakerConfig, Dependency, KeyCounter, Policy, Retry, Timeout,
};
pub use stats::{CacheStats, StageStats, TimeStats, TrafficStats};

pub use stagesim_config as config;
