//! Pipeline configuration
//!
//! Precedence, lowest first: built-in defaults, an optional JSON file, then
//! `CHOICEFIT_*` environment variables (a `.env` file is loaded if present).
//!
//! ```rust
//! use choicefit::config::PipelineConfig;
//!
//! let config = PipelineConfig::builder()
//!     .concurrency(8)
//!     .attempt_budget(20)
//!     .build()?;
//! assert_eq!(config.concurrency, 8);
//! assert_eq!(config.retry.attempt_budget, 20);
//! # Ok::<(), choicefit::Error>(())
//! ```

use crate::logging::{LogFormat, LoggingConfig};
use crate::sampler::SamplerConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "CHOICEFIT_";

/// When the convergence-retry loop stops.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum sampling attempts per session
    pub attempt_budget: u32,
    /// Acceptance threshold: converged when max target R-hat is strictly below this
    pub rhat_threshold: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_budget: 100,
            rhat_threshold: 1.01,
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-attempt sampler settings
    pub sampler: SamplerConfig,
    /// Retry loop settings
    pub retry: RetryPolicy,
    /// Sessions estimated at the same time
    pub concurrency: usize,
    /// Credible-interval-width z-score at or above which a session is excluded
    pub outlier_z_cutoff: f64,
    /// Base seed; attempt seeds are derived from it and the session key
    pub seed: u64,
    /// Log output settings
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sampler: SamplerConfig::default(),
            retry: RetryPolicy::default(),
            concurrency: 4,
            outlier_z_cutoff: 1.96,
            seed: 20_240_101,
            logging: LoggingConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Create a configuration builder starting from defaults.
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Defaults overridden by `CHOICEFIT_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a variable is set but unparseable,
    /// or the result fails validation.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// JSON file (missing fields take defaults) overridden by environment variables.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or the result is invalid.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut config: Self = serde_json::from_str(&text)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (names include [`ENV_PREFIX`]).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first unparseable variable.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        override_parsed(&mut self.sampler.chain_count, "CHAIN_COUNT", get("CHAIN_COUNT"))?;
        override_parsed(
            &mut self.sampler.draws_per_chain,
            "DRAWS_PER_CHAIN",
            get("DRAWS_PER_CHAIN"),
        )?;
        override_parsed(&mut self.sampler.warmup_draws, "WARMUP_DRAWS", get("WARMUP_DRAWS"))?;
        override_parsed(
            &mut self.retry.attempt_budget,
            "ATTEMPT_BUDGET",
            get("ATTEMPT_BUDGET"),
        )?;
        override_parsed(
            &mut self.retry.rhat_threshold,
            "RHAT_THRESHOLD",
            get("RHAT_THRESHOLD"),
        )?;
        override_parsed(&mut self.concurrency, "CONCURRENCY", get("CONCURRENCY"))?;
        override_parsed(
            &mut self.outlier_z_cutoff,
            "OUTLIER_Z_CUTOFF",
            get("OUTLIER_Z_CUTOFF"),
        )?;
        override_parsed(&mut self.seed, "SEED", get("SEED"))?;
        if let Some(level) = get("LOG_LEVEL") {
            self.logging.level = level;
        }
        override_parsed(&mut self.logging.format, "LOG_FORMAT", get("LOG_FORMAT"))?;
        Ok(())
    }

    /// Check every value is in range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        self.sampler
            .validate()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if self.retry.attempt_budget == 0 {
            return Err(Error::InvalidConfig(
                "attempt_budget must be >= 1".to_string(),
            ));
        }
        if !(self.retry.rhat_threshold.is_finite() && self.retry.rhat_threshold > 1.0) {
            return Err(Error::InvalidConfig(format!(
                "rhat_threshold must be a finite value > 1.0 (got {})",
                self.retry.rhat_threshold
            )));
        }
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig("concurrency must be >= 1".to_string()));
        }
        if !(self.outlier_z_cutoff.is_finite() && self.outlier_z_cutoff > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "outlier_z_cutoff must be a finite value > 0 (got {})",
                self.outlier_z_cutoff
            )));
        }
        Ok(())
    }
}

fn override_parsed<T: FromStr>(target: &mut T, name: &str, raw: Option<String>) -> Result<()> {
    if let Some(raw) = raw {
        *target = raw.trim().parse().map_err(|_| {
            Error::InvalidConfig(format!("{ENV_PREFIX}{name}: cannot parse '{raw}'"))
        })?;
    }
    Ok(())
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Number of independent chains per attempt.
    #[must_use]
    pub const fn chain_count(mut self, chains: usize) -> Self {
        self.config.sampler.chain_count = chains;
        self
    }

    /// Retained draws per chain.
    #[must_use]
    pub const fn draws_per_chain(mut self, draws: usize) -> Self {
        self.config.sampler.draws_per_chain = draws;
        self
    }

    /// Warm-up draws per chain.
    #[must_use]
    pub const fn warmup_draws(mut self, draws: usize) -> Self {
        self.config.sampler.warmup_draws = draws;
        self
    }

    /// Maximum attempts per session.
    #[must_use]
    pub const fn attempt_budget(mut self, budget: u32) -> Self {
        self.config.retry.attempt_budget = budget;
        self
    }

    /// R-hat acceptance threshold.
    #[must_use]
    pub const fn rhat_threshold(mut self, threshold: f64) -> Self {
        self.config.retry.rhat_threshold = threshold;
        self
    }

    /// Worker count.
    #[must_use]
    pub const fn concurrency(mut self, workers: usize) -> Self {
        self.config.concurrency = workers;
        self
    }

    /// Outlier z-score cutoff.
    #[must_use]
    pub const fn outlier_z_cutoff(mut self, cutoff: f64) -> Self {
        self.config.outlier_z_cutoff = cutoff;
        self
    }

    /// Base seed.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Log output format.
    #[must_use]
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.logging.format = format;
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any value is out of range.
    pub fn build(self) -> Result<PipelineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
