//! Shared fixtures: simulated sessions with known parameters

#![allow(dead_code)]

use choicefit::model::{discounting, risk_ambiguity};
use choicefit::runner::{FitAttempt, FitResult};
use choicefit::sampler::{ParamSummary, PosteriorSummary};
use choicefit::session::{Session, SessionKey, TaskKind, Trial};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn choose(rng: &mut StdRng, utility_difference: f64) -> u8 {
    let p = 1.0 / (1.0 + (-utility_difference).exp());
    u8::from(rng.gen_bool(p.clamp(0.0, 1.0)))
}

/// Discounting session simulated from `discount_rate` and `inverse_temperature`,
/// `repeats` passes over a 6 x 5 delay/amount grid.
pub fn discounting_session(
    subject: &str,
    day: u32,
    discount_rate: f64,
    inverse_temperature: f64,
    repeats: usize,
    seed: u64,
) -> Session {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut trials = Vec::new();
    for _ in 0..repeats {
        for ll_delay in [7.0, 14.0, 30.0, 60.0, 90.0, 180.0] {
            for ss_amount in [5.0, 10.0, 15.0, 20.0, 25.0] {
                let later = discounting::subjective_value(30.0, ll_delay, discount_rate);
                let sooner = discounting::subjective_value(ss_amount, 0.0, discount_rate);
                let choice = choose(&mut rng, inverse_temperature * (later - sooner));
                trials.push(Trial::discounting(ss_amount, 0.0, 30.0, ll_delay, choice));
            }
        }
    }
    Session::new(SessionKey::new(subject, day, TaskKind::Discounting), trials).unwrap()
}

/// Risk/ambiguity session simulated from known parameters.
pub fn risk_session(
    subject: &str,
    day: u32,
    risk_exponent: f64,
    ambiguity_weight: f64,
    seed: u64,
) -> Session {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut trials = Vec::new();
    for variable_amount in [5.0, 8.0, 20.0, 40.0, 50.0] {
        for (probability, ambiguity) in [
            (0.25, 0.0),
            (0.5, 0.0),
            (0.75, 0.0),
            (0.5, 0.24),
            (0.5, 0.5),
            (0.5, 0.74),
        ] {
            let variable = risk_ambiguity::subjective_value(
                variable_amount,
                probability,
                ambiguity,
                risk_exponent,
                ambiguity_weight,
            );
            let fixed =
                risk_ambiguity::subjective_value(5.0, 1.0, 0.0, risk_exponent, ambiguity_weight);
            let choice = choose(&mut rng, variable - fixed);
            trials.push(Trial::risk_ambiguity(
                5.0,
                variable_amount,
                probability,
                ambiguity,
                choice,
            ));
        }
    }
    Session::new(SessionKey::new(subject, day, TaskKind::RiskAmbiguity), trials).unwrap()
}

/// Minimal valid session; for scripted engines that ignore the data.
pub fn stub_session(subject: &str, day: u32, task: TaskKind) -> Session {
    let trial = match task {
        TaskKind::Discounting => Trial::discounting(10.0, 0.0, 20.0, 30.0, 1),
        TaskKind::RiskAmbiguity => Trial::risk_ambiguity(5.0, 20.0, 0.5, 0.0, 1),
    };
    Session::new(SessionKey::new(subject, day, task), vec![trial]).unwrap()
}

/// Converged fit whose every parameter has the given mean and interval width.
pub fn fit_with_width(subject: &str, day: u32, task: TaskKind, mean: f64, width: f64) -> FitResult {
    let params = task
        .model()
        .params
        .iter()
        .map(|spec| ParamSummary {
            name: spec.name.to_string(),
            mean,
            sd: width / 3.92,
            q025: mean - width / 2.0,
            q975: mean + width / 2.0,
            rhat: 1.001,
        })
        .collect();
    let best = FitAttempt {
        attempt: 0,
        seed: 1,
        diagnostic: 1.001,
        summary: PosteriorSummary { params },
    };
    FitResult::new(SessionKey::new(subject, day, task), Some(best), 1, true)
}
