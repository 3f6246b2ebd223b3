//! Value distributions for latencies, availability and keys.

use rand_distr::{Distribution, Exp, Gamma, Normal, Poisson};
use stagesim_config::DistributionConfig;

use crate::clock::Tick;
use crate::error::SamplerError;
use crate::rng::SimRng;

/// A configured distribution that draws `f64` samples from a [`SimRng`].
#[derive(Debug, Clone)]
pub enum Sampler {
    Constant(f64),
    Normal(Normal<f64>),
    Gamma(Gamma<f64>),
    Poisson(Poisson<f64>),
    Exponential(Exp<f64>),
}

impl Sampler {
    pub fn constant(value: f64) -> Self {
        Self::Constant(value)
    }

    /// Normal distribution; a zero deviation degenerates to a constant.
    pub fn normal(mean: f64, std: f64) -> Result<Self, SamplerError> {
        if std == 0.0 && mean.is_finite() {
            return Ok(Self::Constant(mean));
        }
        Normal::new(mean, std)
            .map(Self::Normal)
            .map_err(|e| invalid("normal", e))
    }

    pub fn gamma(shape: f64, scale: f64) -> Result<Self, SamplerError> {
        Gamma::new(shape, scale)
            .map(Self::Gamma)
            .map_err(|e| invalid("gamma", e))
    }

    pub fn poisson(lambda: f64) -> Result<Self, SamplerError> {
        Poisson::new(lambda)
            .map(Self::Poisson)
            .map_err(|e| invalid("poisson", e))
    }

    pub fn exponential(rate: f64) -> Result<Self, SamplerError> {
        Exp::new(rate)
            .map(Self::Exponential)
            .map_err(|e| invalid("exponential", e))
    }

    pub fn from_config(config: &DistributionConfig) -> Result<Self, SamplerError> {
        match *config {
            DistributionConfig::Constant { value } => Ok(Self::constant(value)),
            DistributionConfig::Normal { mean, std } => Self::normal(mean, std),
            DistributionConfig::Gamma { shape, scale } => Self::gamma(shape, scale),
            DistributionConfig::Poisson { lambda } => Self::poisson(lambda),
            DistributionConfig::Exponential { rate } => Self::exponential(rate),
        }
    }

    pub fn sample(&self, rng: &mut SimRng) -> f64 {
        match self {
            Self::Constant(value) => *value,
            Self::Normal(d) => d.sample(rng),
            Self::Gamma(d) => d.sample(rng),
            Self::Poisson(d) => d.sample(rng),
            Self::Exponential(d) => d.sample(rng),
        }
    }

    /// Draws a duration in whole ticks.
    pub fn sample_ticks(&self, rng: &mut SimRng) -> Tick {
        ticks_from_f64(self.sample(rng))
    }
}

/// Floors a sampled value to ticks; negative and non-finite values become 0.
pub fn ticks_from_f64(value: f64) -> Tick {
    if value.is_finite() && value > 0.0 {
        value.floor() as Tick
    } else {
        0
    }
}

fn invalid(distribution: &'static str, err: impl std::fmt::Display) -> SamplerError {
    SamplerError {
        distribution,
        reason: err.to_string(),
    }
}
