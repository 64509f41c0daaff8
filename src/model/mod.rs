//! Choice model definitions
//!
//! Each task has one [`ModelSpec`]: a fixed parameter vector with hard
//! uniform-prior bounds and a Bernoulli-logit trial likelihood
//!
//! ```text
//! P(choice = 1) = logistic(inverse_temperature * (SV_1 - SV_0))
//! ```
//!
//! where `SV_1` is the subjective value of the option coded as choice 1
//! (larger-later, or the variable lottery).
//!
//! All functions here are pure so the sampling engine can evaluate them from
//! any number of chains in parallel.

pub mod discounting;
pub mod risk_ambiguity;

use crate::session::{TaskKind, Trial};

/// Scale a parameter is sampled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamScale {
    /// Unbounded-real or naturally signed parameter, reported as is
    Linear,
    /// Log of a positive-only quantity; `natural` names `exp(value)`
    Log {
        /// Column name of the natural-scale value
        natural: &'static str,
    },
}

/// A named model parameter and its prior support.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    /// Parameter name
    pub name: &'static str,
    /// Lower bound of the uniform prior
    pub lower: f64,
    /// Upper bound of the uniform prior
    pub upper: f64,
    /// Sampling scale
    pub scale: ParamScale,
}

impl ParamSpec {
    /// Whether `value` lies inside the prior support (bounds inclusive).
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    /// Width of the prior support.
    #[must_use]
    pub fn span(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Immutable definition of one choice model.
#[derive(Debug, PartialEq)]
pub struct ModelSpec {
    /// Task the model is fitted to
    pub task: TaskKind,
    /// Human-readable model name
    pub name: &'static str,
    /// Parameters, in the order parameter vectors use
    pub params: &'static [ParamSpec],
    /// Parameters whose R-hat decides convergence
    pub convergence_targets: &'static [&'static str],
    /// Parameters whose credible-interval width drives outlier exclusion
    pub outlier_targets: &'static [&'static str],
}

/// Hyperbolic discounting model.
pub static DISCOUNTING: ModelSpec = ModelSpec {
    task: TaskKind::Discounting,
    name: "hyperbolic-discounting",
    params: &[
        ParamSpec {
            name: "log_discount_rate",
            lower: -12.0,
            upper: 2.0,
            scale: ParamScale::Log {
                natural: "discount_rate",
            },
        },
        ParamSpec {
            name: "log_inverse_temperature",
            lower: -6.0,
            upper: 4.0,
            scale: ParamScale::Log {
                natural: "inverse_temperature",
            },
        },
    ],
    // Choice noise is excluded from the convergence check
    convergence_targets: &["log_discount_rate"],
    outlier_targets: &["log_discount_rate"],
};

/// Risk/ambiguity weighting model.
pub static RISK_AMBIGUITY: ModelSpec = ModelSpec {
    task: TaskKind::RiskAmbiguity,
    name: "risk-ambiguity-weighting",
    params: &[
        ParamSpec {
            name: "risk_exponent",
            lower: 0.0,
            upper: 2.0,
            scale: ParamScale::Linear,
        },
        ParamSpec {
            name: "ambiguity_weight",
            lower: -1.5,
            upper: 1.5,
            scale: ParamScale::Linear,
        },
        ParamSpec {
            name: "log_inverse_temperature",
            lower: -6.0,
            upper: 4.0,
            scale: ParamScale::Log {
                natural: "inverse_temperature",
            },
        },
    ],
    convergence_targets: &["risk_exponent", "ambiguity_weight"],
    outlier_targets: &["risk_exponent", "ambiguity_weight"],
};

impl ModelSpec {
    /// Number of parameters.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.params.len()
    }

    /// Look up a parameter by name.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Prior bounds keyed by parameter name.
    #[must_use]
    pub fn prior_bounds(&self) -> Vec<(&'static str, (f64, f64))> {
        self.params
            .iter()
            .map(|p| (p.name, (p.lower, p.upper)))
            .collect()
    }

    /// Whether every component of `params` lies inside its bounds.
    #[must_use]
    pub fn contains(&self, params: &[f64]) -> bool {
        params.len() == self.dim()
            && self
                .params
                .iter()
                .zip(params)
                .all(|(spec, &value)| spec.contains(value))
    }

    /// Log density of the truncated uniform prior (up to a constant).
    #[must_use]
    pub fn log_prior(&self, params: &[f64]) -> f64 {
        if self.contains(params) {
            0.0
        } else {
            f64::NEG_INFINITY
        }
    }

    /// Log-probability of one trial's observed choice.
    ///
    /// Returns NaN if the trial belongs to another task or `params` does not
    /// have one value per parameter; both only happen on misuse.
    #[must_use]
    pub fn log_likelihood(&self, params: &[f64], trial: &Trial) -> f64 {
        if params.len() != self.dim() {
            return f64::NAN;
        }
        match (self.task, trial) {
            (TaskKind::Discounting, Trial::Discounting(t)) => discounting::log_likelihood(params, t),
            (TaskKind::RiskAmbiguity, Trial::RiskAmbiguity(t)) => {
                risk_ambiguity::log_likelihood(params, t)
            }
            _ => f64::NAN,
        }
    }

    /// Sum of trial log-likelihoods.
    #[must_use]
    pub fn session_log_likelihood(&self, params: &[f64], trials: &[Trial]) -> f64 {
        trials
            .iter()
            .map(|trial| self.log_likelihood(params, trial))
            .sum()
    }

    /// Unnormalized log posterior: prior plus likelihood.
    #[must_use]
    pub fn log_posterior(&self, params: &[f64], trials: &[Trial]) -> f64 {
        let prior = self.log_prior(params);
        if prior == f64::NEG_INFINITY {
            return prior;
        }
        prior + self.session_log_likelihood(params, trials)
    }
}

/// `ln(1 + e^x)` without overflow.
fn softplus(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

/// Log-probability of `choice` under a logistic rule on `utility_difference`.
pub(crate) fn bernoulli_logit(choice: u8, utility_difference: f64) -> f64 {
    if choice == 1 {
        -softplus(-utility_difference)
    } else {
        -softplus(utility_difference)
    }
}
