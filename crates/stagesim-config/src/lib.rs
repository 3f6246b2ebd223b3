//! Scenario configuration for stagesim
//!
//! A scenario describes one simulation run: the arrival process, the
//! simulated dependency at the bottom of the pipeline, and the ordered list
//! of resilience layers wrapped around it (innermost first).
//!
//! Configuration is loaded from multiple sources:
//! 1. CLI arguments (highest precedence, applied by the binary)
//! 2. Environment variables (STAGESIM_* prefix, `__` between nested keys)
//! 3. A scenario TOML file
//! 4. Built-in defaults (lowest precedence)

use serde::{Deserialize, Serialize};
use std::path::Path;

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;

/// Complete scenario configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StagesimConfig {
    pub simulation: SimulationConfig,
    pub dependency: DependencyConfig,
    pub layers: Vec<LayerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    pub seed: u64,
    pub events_per_1000_ticks: f64,
    pub total_events: u64,
    pub keyspace: DistributionConfig,
    pub arrivals: ArrivalPattern,
    /// Period (in ticks) for cache snapshots; disabled when absent.
    pub cache_sample_period: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            events_per_1000_ticks: 30.0,
            total_events: 1000,
            keyspace: DistributionConfig::Normal {
                mean: 1000.0,
                std: 50.0,
            },
            arrivals: ArrivalPattern::Uniform,
            cache_sample_period: None,
        }
    }
}

/// How arrivals are spaced over virtual time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ArrivalPattern {
    /// Fixed spacing of `1000 / rate` ticks.
    #[default]
    Uniform,
    /// Exponentially distributed gaps with the same mean (a Poisson process).
    Exponential,
}

/// A value distribution, sampled by the dependency and the keyspace model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DistributionConfig {
    Constant { value: f64 },
    Normal { mean: f64, std: f64 },
    Gamma { shape: f64, scale: f64 },
    Poisson { lambda: f64 },
    Exponential { rate: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of events waiting for a worker.
    pub capacity: usize,
    /// Size of the worker pool.
    pub workers: usize,
    /// Disables admission limits and grows the pool on demand.
    pub unbounded: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            workers: 4,
            unbounded: false,
        }
    }
}

impl QueueConfig {
    /// A queue that never rejects and never makes an event wait.
    pub fn unbounded() -> Self {
        Self {
            capacity: usize::MAX,
            workers: usize::MAX,
            unbounded: true,
        }
    }

    /// A bounded queue with the given capacity and pool size.
    pub fn bounded(capacity: usize, workers: usize) -> Self {
        Self {
            capacity,
            workers,
            unbounded: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DependencyConfig {
    pub name: Option<String>,
    pub availability: AvailabilityConfig,
    /// Latency of successful calls. `None` answers without consuming ticks.
    pub latency: Option<DistributionConfig>,
    /// Latency of failed calls; falls back to `latency`.
    pub error_latency: Option<DistributionConfig>,
    pub queue: QueueConfig,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            name: None,
            availability: AvailabilityConfig::default(),
            latency: Some(DistributionConfig::Normal {
                mean: 150.0,
                std: 25.0,
            }),
            error_latency: None,
            queue: QueueConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AvailabilityConfig {
    /// Every call succeeds with the same probability.
    Constant { probability: f64 },
    /// The success probability is itself drawn for every call.
    Sampled { distribution: DistributionConfig },
    /// Probability changes at the listed ticks.
    Phased { phases: Vec<AvailabilityPhase> },
    /// Call outcomes replayed in order, cycling when exhausted.
    Scripted { outcomes: Vec<bool> },
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self::Constant { probability: 0.7 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AvailabilityPhase {
    pub from_tick: u64,
    pub probability: f64,
}

/// One resilience layer wrapped around everything configured before it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LayerConfig {
    Cache {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        capacity: Option<usize>,
        #[serde(default)]
        ttl: Option<u64>,
        #[serde(default)]
        queue: QueueConfig,
    },
    AsideCache {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        capacity: Option<usize>,
        #[serde(default)]
        ttl: Option<u64>,
        #[serde(default)]
        queue: QueueConfig,
    },
    CircuitBreaker {
        #[serde(default)]
        name: Option<String>,
        #[serde(default = "default_breaker_threshold")]
        threshold: f64,
        #[serde(default = "default_breaker_capacity")]
        capacity: usize,
        #[serde(default = "default_breaker_open_ticks")]
        open_ticks: u64,
        #[serde(default)]
        report_failures_as_success: bool,
        #[serde(default)]
        queue: QueueConfig,
    },
    Retry {
        #[serde(default)]
        name: Option<String>,
        #[serde(default = "default_retry_count")]
        count: u32,
        #[serde(default)]
        queue: QueueConfig,
    },
    Timeout {
        #[serde(default)]
        name: Option<String>,
        #[serde(default = "default_timeout_ticks")]
        ticks: u64,
        #[serde(default)]
        queue: QueueConfig,
    },
    KeyCounter {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        queue: QueueConfig,
    },
}

fn default_retry_count() -> u32 {
    2
}

fn default_timeout_ticks() -> u64 {
    300
}

fn default_breaker_threshold() -> f64 {
    CircuitBreakerConfig::default().threshold
}

fn default_breaker_capacity() -> usize {
    CircuitBreakerConfig::default().capacity
}

fn default_breaker_open_ticks() -> u64 {
    CircuitBreakerConfig::default().open_ticks
}

impl LayerConfig {
    /// The layer's queue configuration.
    pub fn queue(&self) -> &QueueConfig {
        match self {
            Self::Cache { queue, .. }
            | Self::AsideCache { queue, .. }
            | Self::CircuitBreaker { queue, .. }
            | Self::Retry { queue, .. }
            | Self::Timeout { queue, .. }
            | Self::KeyCounter { queue, .. } => queue,
        }
    }

    /// The explicit stage name, if one was configured.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Cache { name, .. }
            | Self::AsideCache { name, .. }
            | Self::CircuitBreaker { name, .. }
            | Self::Retry { name, .. }
            | Self::Timeout { name, .. }
            | Self::KeyCounter { name, .. } => name.as_deref(),
        }
    }

    /// Breaker settings for a `circuit-breaker` layer.
    pub fn breaker(&self) -> Option<CircuitBreakerConfig> {
        match *self {
            Self::CircuitBreaker {
                threshold,
                capacity,
                open_ticks,
                report_failures_as_success,
                ..
            } => Some(CircuitBreakerConfig {
                threshold,
                capacity,
                open_ticks,
                report_failures_as_success,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Error rate above which the breaker opens.
    pub threshold: f64,
    /// Number of recent outcomes the error rate is computed over.
    pub capacity: usize,
    /// Ticks spent open before a trial (half-open) period.
    pub open_ticks: u64,
    /// Record failures but answer `success` to the caller.
    pub report_failures_as_success: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            capacity: 10,
            open_ticks: 3000,
            report_failures_as_success: false,
        }
    }
}

impl CircuitBreakerConfig {
    /// Rejects a threshold outside `[0, 1]` and an empty outcome ring.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_field("circuit_breaker")
    }

    fn validate_field(&self, field: &str) -> Result<(), ConfigError> {
        validate_probability(&format!("{field}.threshold"), self.threshold)?;
        if self.capacity == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{field}.capacity must be at least 1"
            )));
        }
        Ok(())
    }
}

impl StagesimConfig {
    /// Load configuration from defaults, an optional file, and the environment.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let mut loader = ConfigLoader::new();
        if let Some(path) = file {
            loader = loader.with_file(path);
        }
        loader.load()
    }

    /// Parse a scenario from TOML text, without consulting other sources.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::ParseError {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Read and parse a scenario file, without consulting other sources.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Rejects values the simulator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sim = &self.simulation;
        if !(sim.events_per_1000_ticks.is_finite() && sim.events_per_1000_ticks > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "simulation.events_per_1000_ticks must be positive, got {}",
                sim.events_per_1000_ticks
            )));
        }
        if sim.cache_sample_period == Some(0) {
            return Err(ConfigError::ValidationError(
                "simulation.cache_sample_period must be at least 1 tick".to_string(),
            ));
        }
        validate_distribution("simulation.keyspace", &sim.keyspace)?;

        let dep = &self.dependency;
        match &dep.availability {
            AvailabilityConfig::Constant { probability } => {
                validate_probability("dependency.availability.probability", *probability)?;
            }
            AvailabilityConfig::Sampled { distribution } => {
                validate_distribution("dependency.availability.distribution", distribution)?;
            }
            AvailabilityConfig::Phased { phases } => {
                if phases.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "dependency.availability.phases must not be empty".to_string(),
                    ));
                }
                for phase in phases {
                    validate_probability(
                        "dependency.availability.phases.probability",
                        phase.probability,
                    )?;
                }
            }
            AvailabilityConfig::Scripted { outcomes } => {
                if outcomes.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "dependency.availability.outcomes must not be empty".to_string(),
                    ));
                }
            }
        }
        if let Some(latency) = &dep.latency {
            validate_distribution("dependency.latency", latency)?;
        }
        if let Some(latency) = &dep.error_latency {
            validate_distribution("dependency.error_latency", latency)?;
        }
        validate_queue("dependency.queue", &dep.queue)?;

        for (index, layer) in self.layers.iter().enumerate() {
            validate_queue(&format!("layers[{index}].queue"), layer.queue())?;
            match layer {
                LayerConfig::Cache { capacity, ttl, .. }
                | LayerConfig::AsideCache { capacity, ttl, .. } => {
                    if *capacity == Some(0) {
                        return Err(ConfigError::ValidationError(format!(
                            "layers[{index}].capacity must be at least 1"
                        )));
                    }
                    if *ttl == Some(0) {
                        return Err(ConfigError::ValidationError(format!(
                            "layers[{index}].ttl must be at least 1 tick"
                        )));
                    }
                }
                LayerConfig::CircuitBreaker { .. } => {
                    if let Some(breaker) = layer.breaker() {
                        breaker.validate_field(&format!("layers[{index}]"))?;
                    }
                }
                LayerConfig::Timeout { ticks, .. } => {
                    if *ticks == 0 {
                        return Err(ConfigError::ValidationError(format!(
                            "layers[{index}].ticks must be at least 1"
                        )));
                    }
                }
                LayerConfig::Retry { .. } | LayerConfig::KeyCounter { .. } => {}
            }
        }

        Ok(())
    }
}

fn validate_probability(field: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "{field} must be within [0, 1], got {value}"
        )))
    }
}

fn validate_queue(field: &str, queue: &QueueConfig) -> Result<(), ConfigError> {
    if !queue.unbounded && queue.workers == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{field}.workers must be at least 1"
        )));
    }
    Ok(())
}

fn validate_distribution(field: &str, dist: &DistributionConfig) -> Result<(), ConfigError> {
    let ok = match *dist {
        DistributionConfig::Constant { value } => value.is_finite(),
        DistributionConfig::Normal { mean, std } => mean.is_finite() && std.is_finite() && std >= 0.0,
        DistributionConfig::Gamma { shape, scale } => shape > 0.0 && scale > 0.0,
        DistributionConfig::Poisson { lambda } => lambda > 0.0 && lambda.is_finite(),
        DistributionConfig::Exponential { rate } => rate > 0.0 && rate.is_finite(),
    };
    if ok {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "{field} has invalid parameters: {dist:?}"
        )))
    }
}
