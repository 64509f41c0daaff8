//! Risk/ambiguity weighting likelihood
//!
//! Parameter vector: `[risk_exponent, ambiguity_weight, log_inverse_temperature]`.
//! Choice 1 is the variable (lottery) option; the fixed option is certain.

use super::bernoulli_logit;
use crate::session::RiskAmbiguityTrial;

/// Subjective value `(p - beta * A / 2) * amount^alpha`.
///
/// A zero amount is worth zero for every exponent, including `alpha = 0`
/// where `0^0` would otherwise evaluate to one.
#[must_use]
pub fn subjective_value(
    amount: f64,
    probability: f64,
    ambiguity: f64,
    risk_exponent: f64,
    ambiguity_weight: f64,
) -> f64 {
    if amount == 0.0 {
        return 0.0;
    }
    (ambiguity_weight * ambiguity).mul_add(-0.5, probability) * amount.powf(risk_exponent)
}

pub(super) fn log_likelihood(params: &[f64], trial: &RiskAmbiguityTrial) -> f64 {
    let risk_exponent = params[0];
    let ambiguity_weight = params[1];
    let inverse_temperature = params[2].exp();
    let variable = subjective_value(
        trial.variable_amount,
        trial.probability,
        trial.ambiguity,
        risk_exponent,
        ambiguity_weight,
    );
    let fixed = subjective_value(trial.fixed_amount, 1.0, 0.0, risk_exponent, ambiguity_weight);
    bernoulli_logit(trial.choice, inverse_temperature * (variable - fixed))
}
