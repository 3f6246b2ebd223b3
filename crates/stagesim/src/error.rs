//! Error types for the simulator.

use thiserror::Error;

use crate::clock::Tick;

/// Errors that abort a simulation run.
#[derive(Debug, Error)]
pub enum SimError {
    /// The awaited future can never complete: nothing is scheduled and no
    /// task can make progress.
    #[error("simulation stalled at tick {tick} with work still outstanding")]
    Stalled { tick: Tick },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Config(#[from] stagesim_config::ConfigError),

    #[error("failed to spawn simulation task: {0}")]
    Spawn(#[from] futures::task::SpawnError),

    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons a stage's work fails.
///
/// These never leave the stage: the lifecycle counts them and turns them
/// into a `fail` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WorkError {
    #[error("wrapped stage answered fail")]
    Upstream,

    #[error("dependency unavailable")]
    Unavailable,

    #[error("circuit open")]
    CircuitOpen,

    #[error("timed out")]
    TimedOut,

    #[error("all {attempts} attempts failed")]
    RetriesExhausted { attempts: u32 },

    #[error("cache miss")]
    CacheMiss,
}

/// Invalid parameters for a value distribution.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid {distribution} parameters: {reason}")]
pub struct SamplerError {
    pub distribution: &'static str,
    pub reason: String,
}

/// Admission refused because the stage's wait queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue full ({capacity} waiting)")]
pub struct QueueFull {
    pub capacity: usize,
}
