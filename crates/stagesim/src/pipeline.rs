//! Pipeline composition.
//!
//! Pipelines are built inside-out: a dependency first, then each layer
//! wraps everything built so far.
//!
//! ```text
//! layers = [cache, circuit-breaker, timeout, retry]
//!   ==> Retry(Timeout(CircuitBreaker(Cache(Dependency))))
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;
use stagesim_config::{DependencyConfig, LayerConfig, StagesimConfig};

use crate::clock::{Clock, Tick};
use crate::error::SimError;
use crate::rng::SimRng;
use crate::stage::Stage;
use crate::stages::{Cache, CircuitBreaker, Dependency, KeyCounter, Policy, Retry, Timeout};
use crate::stats::StageStats;

/// A composed pipeline; keeps every stage for statistics.
#[derive(Debug)]
pub struct Pipeline {
    clock: Clock,
    /// Innermost (the dependency) first.
    stages: Vec<Rc<Stage>>,
}

/// One cache observation taken by [`Pipeline::sample_caches`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSample {
    pub tick: Tick,
    pub stage: String,
    pub live_keys: usize,
    pub average_age: f64,
}

impl Pipeline {
    /// Builds the dependency and layers described by a scenario.
    pub fn from_config(
        clock: &Clock,
        config: &StagesimConfig,
        rng: &mut SimRng,
    ) -> Result<Self, SimError> {
        config
            .validate()
            .map_err(|e| SimError::InvalidConfig(e.to_string()))?;

        let builder = PipelineBuilder::from_dependency_config(clock, &config.dependency, rng.fork())?;
        Ok(config
            .layers
            .iter()
            .try_fold(builder, PipelineBuilder::layer)?
            .build())
    }

    /// The stage events enter through.
    pub fn top(&self) -> &Rc<Stage> {
        // builders always start from a dependency stage
        &self.stages[self.stages.len() - 1]
    }

    pub fn stages(&self) -> &[Rc<Stage>] {
        &self.stages
    }

    /// First stage with the given name.
    pub fn stage(&self, name: &str) -> Option<&Rc<Stage>> {
        self.stages.iter().find(|s| s.name() == name)
    }

    /// Statistics of every stage, innermost first.
    pub fn stage_stats(&self) -> Vec<StageStats> {
        self.stages.iter().map(|s| s.stats()).collect()
    }

    /// Records a snapshot of every cache stage each `period` ticks.
    pub fn sample_caches(&self, period: Tick) -> Rc<RefCell<Vec<CacheSample>>> {
        let samples = Rc::new(RefCell::new(Vec::new()));
        let caches: Vec<Rc<Stage>> = self
            .stages
            .iter()
            .filter(|s| s.cache().is_some())
            .cloned()
            .collect();
        if caches.is_empty() {
            return samples;
        }

        let out = Rc::clone(&samples);
        let clock = self.clock.clone();
        self.clock.schedule_repeating(
            move || {
                let now = clock.now();
                let mut out = out.borrow_mut();
                for stage in &caches {
                    if let Some(cache) = stage.cache() {
                        let snapshot = cache.snapshot(now);
                        out.push(CacheSample {
                            tick: now,
                            stage: stage.name().to_string(),
                            live_keys: snapshot.live_keys,
                            average_age: snapshot.average_age,
                        });
                    }
                }
            },
            period,
        );
        samples
    }
}

/// Builder that wraps layers around a dependency stage.
pub struct PipelineBuilder {
    clock: Clock,
    stages: Vec<Rc<Stage>>,
}

impl PipelineBuilder {
    /// Starts from an already built terminal stage.
    pub fn new(clock: &Clock, dependency: Rc<Stage>) -> Self {
        Self {
            clock: clock.clone(),
            stages: vec![dependency],
        }
    }

    pub fn from_dependency_config(
        clock: &Clock,
        config: &DependencyConfig,
        rng: SimRng,
    ) -> Result<Self, SimError> {
        let mut builder = Stage::builder().queue(config.queue.clone());
        if let Some(name) = &config.name {
            builder = builder.name(name.clone());
        }
        let dependency = builder.build(clock, Dependency::from_config(config, rng)?);
        Ok(Self::new(clock, dependency))
    }

    /// Wraps the current top stage in the configured layer.
    pub fn layer(mut self, layer: &LayerConfig) -> Result<Self, SimError> {
        let mut builder = Stage::builder().queue(layer.queue().clone());
        if let Some(name) = layer.name() {
            builder = builder.name(name);
        }
        let inner = Rc::clone(&self.stages[self.stages.len() - 1]);
        let policy: Policy = match layer {
            LayerConfig::Cache { capacity, ttl, .. } => {
                if capacity.is_none() && ttl.is_none() {
                    Cache::new(inner).into()
                } else {
                    Cache::lru(inner, *capacity, *ttl).into()
                }
            }
            LayerConfig::AsideCache { capacity, ttl, .. } => {
                Cache::aside(inner, *capacity, *ttl).into()
            }
            LayerConfig::CircuitBreaker { .. } => {
                CircuitBreaker::new(inner, layer.breaker().unwrap_or_default())?.into()
            }
            LayerConfig::Retry { count, .. } => Retry::new(inner, *count).into(),
            LayerConfig::Timeout { ticks, .. } => Timeout::new(inner, *ticks).into(),
            LayerConfig::KeyCounter { .. } => KeyCounter::new(inner).into(),
        };
        self.stages.push(builder.build(&self.clock, policy));
        Ok(self)
    }

    /// Wraps the current top stage with a stage built by `make`.
    pub fn wrap(mut self, make: impl FnOnce(Rc<Stage>) -> Rc<Stage>) -> Self {
        let inner = Rc::clone(&self.stages[self.stages.len() - 1]);
        let outer = make(inner);
        self.stages.push(outer);
        self
    }

    pub fn build(self) -> Pipeline {
        tracing::debug!(
            stages = ?self.stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "pipeline built"
        );
        Pipeline {
            clock: self.clock,
            stages: self.stages,
        }
    }
}
