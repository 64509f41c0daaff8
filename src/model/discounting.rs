//! Hyperbolic discounting likelihood
//!
//! Parameter vector: `[log_discount_rate, log_inverse_temperature]`.
//! Choice 1 is the larger-later option.

use super::bernoulli_logit;
use crate::session::DiscountingTrial;

/// Hyperbolic subjective value `amount / (1 + k * delay)`.
#[must_use]
pub fn subjective_value(amount: f64, delay: f64, discount_rate: f64) -> f64 {
    amount / discount_rate.mul_add(delay, 1.0)
}

pub(super) fn log_likelihood(params: &[f64], trial: &DiscountingTrial) -> f64 {
    let discount_rate = params[0].exp();
    let inverse_temperature = params[1].exp();
    let later = subjective_value(trial.ll_amount, trial.ll_delay, discount_rate);
    let sooner = subjective_value(trial.ss_amount, trial.ss_delay, discount_rate);
    bernoulli_logit(trial.choice, inverse_temperature * (later - sooner))
}
