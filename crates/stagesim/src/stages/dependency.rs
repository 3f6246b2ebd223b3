//! Simulated remote dependency: the terminal stage of every pipeline.

use std::cell::{Cell, RefCell};

use stagesim_config::{AvailabilityConfig, DependencyConfig};

use crate::clock::{Clock, Tick};
use crate::error::{SamplerError, WorkError};
use crate::rng::SimRng;
use crate::sampler::Sampler;

/// How the dependency decides whether a call succeeds.
#[derive(Debug, Clone)]
pub enum AvailabilityModel {
    /// Bernoulli draw with a fixed success probability.
    Constant(f64),
    /// Success probability drawn per call, clamped to `[0, 1]`.
    Sampled(Sampler),
    /// `(from_tick, probability)` steps, sorted by tick. Fully available
    /// before the first step.
    Phased(Vec<(Tick, f64)>),
    /// Outcomes replayed by call index, cycling. Empty means always up.
    Scripted(Vec<bool>),
}

impl AvailabilityModel {
    pub fn from_config(config: &AvailabilityConfig) -> Result<Self, SamplerError> {
        Ok(match config {
            AvailabilityConfig::Constant { probability } => Self::Constant(*probability),
            AvailabilityConfig::Sampled { distribution } => {
                Self::Sampled(Sampler::from_config(distribution)?)
            }
            AvailabilityConfig::Phased { phases } => {
                let mut steps: Vec<(Tick, f64)> = phases
                    .iter()
                    .map(|p| (p.from_tick, p.probability))
                    .collect();
                steps.sort_by_key(|(tick, _)| *tick);
                Self::Phased(steps)
            }
            AvailabilityConfig::Scripted { outcomes } => Self::Scripted(outcomes.clone()),
        })
    }

    fn draw(&self, call: u64, now: Tick, rng: &mut SimRng) -> bool {
        match self {
            Self::Constant(p) => rng.next_bool_with_probability(*p),
            Self::Sampled(sampler) => {
                let p = sampler.sample(rng).clamp(0.0, 1.0);
                rng.next_bool_with_probability(p)
            }
            Self::Phased(steps) => {
                let p = steps
                    .iter()
                    .rev()
                    .find(|(from, _)| *from <= now)
                    .map_or(1.0, |(_, p)| *p);
                rng.next_bool_with_probability(p)
            }
            Self::Scripted(outcomes) => {
                if outcomes.is_empty() {
                    true
                } else {
                    outcomes[(call % outcomes.len() as u64) as usize]
                }
            }
        }
    }
}

/// Terminal stage with sampled availability and latency.
#[derive(Debug)]
pub struct Dependency {
    availability: AvailabilityModel,
    latency: Option<Sampler>,
    error_latency: Option<Sampler>,
    rng: RefCell<SimRng>,
    calls: Cell<u64>,
}

impl Dependency {
    /// A dependency whose calls take `latency` ticks, at least one.
    ///
    /// Without a latency sampler calls answer in the tick they start.
    pub fn new(availability: AvailabilityModel, latency: Option<Sampler>, rng: SimRng) -> Self {
        Self {
            availability,
            latency,
            error_latency: None,
            rng: RefCell::new(rng),
            calls: Cell::new(0),
        }
    }

    /// Latency for failed calls, when it differs from successful ones.
    pub fn with_error_latency(mut self, latency: Sampler) -> Self {
        self.error_latency = Some(latency);
        self
    }

    pub fn from_config(config: &DependencyConfig, rng: SimRng) -> Result<Self, SamplerError> {
        let availability = AvailabilityModel::from_config(&config.availability)?;
        let latency = config.latency.as_ref().map(Sampler::from_config).transpose()?;
        let mut dependency = Self::new(availability, latency, rng);
        if let Some(error_latency) = &config.error_latency {
            dependency = dependency.with_error_latency(Sampler::from_config(error_latency)?);
        }
        Ok(dependency)
    }

    pub fn availability(&self) -> &AvailabilityModel {
        &self.availability
    }

    /// Calls that reached the dependency's worker.
    pub fn calls(&self) -> u64 {
        self.calls.get()
    }

    pub(crate) async fn work(&self, clock: &Clock) -> Result<(), WorkError> {
        let call = self.calls.get();
        self.calls.set(call + 1);

        let (available, delay) = {
            let mut rng = self.rng.borrow_mut();
            let available = self.availability.draw(call, clock.now(), &mut rng);
            let sampler = if available {
                self.latency.as_ref()
            } else {
                self.error_latency.as_ref().or(self.latency.as_ref())
            };
            (available, sampler.map(|s| s.sample_ticks(&mut rng)))
        };

        if let Some(ticks) = delay {
            clock.wait(ticks).await;
        }

        if available {
            Ok(())
        } else {
            Err(WorkError::Unavailable)
        }
    }
}
