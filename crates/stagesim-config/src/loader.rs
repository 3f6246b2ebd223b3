//! Configuration loader with multi-source merging

use crate::{ConfigError, StagesimConfig};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    /// Create a loader that only reads defaults and the environment
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: "STAGESIM".to_string(),
        }
    }

    /// Read a scenario file on top of the defaults
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix (default: "STAGESIM")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<StagesimConfig> {
        let mut builder = config::Config::builder();

        // 1. Start with built-in defaults
        let defaults = StagesimConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. Scenario file
        if let Some(path) = &self.file {
            if !path.exists() {
                return Err(ConfigError::MissingFile(path.clone()).into());
            }
            builder = builder.add_source(
                config::File::from(path.as_path())
                    .required(true)
                    .format(config::FileFormat::Toml),
            );
        }

        // 3. Environment variables (STAGESIM_SIMULATION__SEED=7)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let scenario: StagesimConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        scenario.validate()?;

        Ok(scenario)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
