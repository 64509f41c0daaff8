//! Sampling engine boundary
//!
//! The estimation pipeline never draws samples itself. It hands a model, a
//! session and a [`SamplerConfig`] to a [`SamplingEngine`] and gets back a
//! [`PosteriorSummary`]: mean, sd, 2.5%/97.5% quantiles and R-hat for every
//! parameter, or a [`SamplerFailure`].
//!
//! Engines must run chains independently (no shared state between them) so
//! that R-hat is a meaningful between-chain / within-chain variance ratio.
//!
//! Two engines ship with the crate:
//! - [`MetropolisEngine`]: adaptive component-wise random-walk Metropolis,
//!   chains run in parallel on rayon
//! - [`ScriptedEngine`]: deterministic stand-in that replays scripted
//!   diagnostics and failures, for tests and dry runs

pub mod diagnostics;
mod metropolis;
mod scripted;

pub use metropolis::MetropolisEngine;
pub use scripted::{ScriptStep, ScriptedEngine};

pub use crate::error::SamplerFailure;
use crate::model::ModelSpec;
use crate::session::Session;
use serde::{Deserialize, Serialize};

/// Per-attempt sampler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Number of independent chains
    pub chain_count: usize,
    /// Retained draws per chain
    pub draws_per_chain: usize,
    /// Warm-up (adaptation) draws per chain, discarded
    pub warmup_draws: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            chain_count: 4,
            draws_per_chain: 4000,
            warmup_draws: 2000,
        }
    }
}

impl SamplerConfig {
    /// Check that the configuration can produce a split R-hat.
    ///
    /// # Errors
    ///
    /// Returns [`SamplerFailure::InvalidConfig`] if fewer than 2 chains or
    /// fewer than 4 draws per chain are requested.
    pub fn validate(&self) -> Result<(), SamplerFailure> {
        if self.chain_count < 2 {
            return Err(SamplerFailure::InvalidConfig(format!(
                "chain_count must be >= 2 (got {})",
                self.chain_count
            )));
        }
        if self.draws_per_chain < 4 {
            return Err(SamplerFailure::InvalidConfig(format!(
                "draws_per_chain must be >= 4 (got {})",
                self.draws_per_chain
            )));
        }
        Ok(())
    }
}

/// Everything an engine needs for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct SampleRequest<'a> {
    /// Model to sample
    pub model: &'a ModelSpec,
    /// Trial data
    pub session: &'a Session,
    /// Chain and draw counts
    pub config: &'a SamplerConfig,
    /// Seed for this attempt; chains derive their own streams from it
    pub seed: u64,
}

/// Posterior summary of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSummary {
    /// Parameter name
    pub name: String,
    /// Posterior mean
    pub mean: f64,
    /// Posterior standard deviation
    pub sd: f64,
    /// 2.5% quantile
    pub q025: f64,
    /// 97.5% quantile
    pub q975: f64,
    /// Split R-hat across chains
    pub rhat: f64,
}

impl ParamSummary {
    /// Width of the 95% credible interval.
    #[must_use]
    pub fn interval_width(&self) -> f64 {
        self.q975 - self.q025
    }

    fn check_finite(&self) -> Result<(), SamplerFailure> {
        for (statistic, value) in [
            ("mean", self.mean),
            ("sd", self.sd),
            ("q025", self.q025),
            ("q975", self.q975),
            ("rhat", self.rhat),
        ] {
            if !value.is_finite() {
                return Err(SamplerFailure::NonFinite {
                    param: self.name.clone(),
                    statistic,
                });
            }
        }
        Ok(())
    }
}

/// Summary of one sampling run, one entry per model parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSummary {
    /// Per-parameter summaries in model order
    pub params: Vec<ParamSummary>,
}

impl PosteriorSummary {
    /// Summary for a parameter.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamSummary> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Largest R-hat among `targets`.
    ///
    /// A target missing from the summary counts as infinitely unconverged.
    #[must_use]
    pub fn max_rhat(&self, targets: &[&str]) -> f64 {
        targets
            .iter()
            .map(|name| self.get(name).map_or(f64::INFINITY, |p| p.rhat))
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Verify every statistic is finite.
    ///
    /// # Errors
    ///
    /// Returns [`SamplerFailure::NonFinite`] for the first offending value.
    pub fn check_finite(&self) -> Result<(), SamplerFailure> {
        self.params.iter().try_for_each(ParamSummary::check_finite)
    }
}

/// A posterior sampling engine.
///
/// Implementations are called from scheduler workers on blocking threads and
/// must be safe to share between them.
pub trait SamplingEngine: Send + Sync + 'static {
    /// Run one independent sampling attempt.
    ///
    /// # Errors
    ///
    /// Returns a [`SamplerFailure`] if the run diverged or produced unusable output.
    fn sample(&self, request: &SampleRequest<'_>) -> Result<PosteriorSummary, SamplerFailure>;
}

impl<E: SamplingEngine> SamplingEngine for std::sync::Arc<E> {
    fn sample(&self, request: &SampleRequest<'_>) -> Result<PosteriorSummary, SamplerFailure> {
        (**self).sample(request)
    }
}
