//! Convergence-retry runner tests
//!
//! Scripted engines pin down the retry semantics exactly; a short real
//! Metropolis run checks that a well-identified session converges.

mod common;

use choicefit::config::RetryPolicy;
use choicefit::runner::{attempt_seed, ConvergenceRunner};
use choicefit::sampler::{MetropolisEngine, SamplerConfig, ScriptStep, ScriptedEngine};
use choicefit::session::{SessionKey, TaskKind};
use common::{discounting_session, stub_session};

fn policy(attempt_budget: u32) -> RetryPolicy {
    RetryPolicy {
        attempt_budget,
        rhat_threshold: 1.01,
    }
}

fn scripted_runner(steps: Vec<ScriptStep>, budget: u32) -> ConvergenceRunner<ScriptedEngine> {
    ConvergenceRunner::new(
        ScriptedEngine::new(steps),
        SamplerConfig::default(),
        policy(budget),
        7,
    )
}

#[test]
fn test_converges_on_fourth_attempt() {
    let runner = scripted_runner(
        vec![
            ScriptStep::Rhat(1.30),
            ScriptStep::Rhat(1.05),
            ScriptStep::Rhat(1.20),
            ScriptStep::Rhat(1.008),
        ],
        100,
    );
    let result = runner.run(&stub_session("S01", 1, TaskKind::Discounting));

    assert!(result.converged());
    assert_eq!(result.attempts(), 4);
    assert!((result.diagnostic().unwrap() - 1.008).abs() < 1e-12);
    assert_eq!(result.best().unwrap().attempt, 3);
    assert_eq!(runner.engine().calls(), 4);
}

#[test]
fn test_exhausted_keeps_lowest_diagnostic() {
    let runner = scripted_runner(
        vec![
            ScriptStep::Rhat(1.30),
            ScriptStep::Rhat(1.05),
            ScriptStep::Fail,
            ScriptStep::Rhat(1.20),
        ],
        5,
    );
    let result = runner.run(&stub_session("S01", 1, TaskKind::RiskAmbiguity));

    assert!(!result.converged());
    assert_eq!(result.attempts(), 5);
    assert_eq!(runner.engine().calls(), 5);
    // Attempt 1 (zero-based) had the lowest R-hat; later attempts were worse
    assert_eq!(result.best().unwrap().attempt, 1);
    assert!((result.diagnostic().unwrap() - 1.05).abs() < 1e-12);
    assert!(result.estimate("risk_exponent").is_some());
}

#[test]
fn test_every_attempt_failing_gives_no_estimate() {
    let runner = scripted_runner(vec![ScriptStep::Fail], 3);
    let result = runner.run(&stub_session("S02", 1, TaskKind::Discounting));

    assert!(!result.converged());
    assert_eq!(result.attempts(), 3);
    assert!(result.best().is_none());
    assert!(result.diagnostic().is_none());
}

#[test]
fn test_threshold_is_strict() {
    let runner = scripted_runner(vec![ScriptStep::Rhat(1.01)], 4);
    let result = runner.run(&stub_session("S03", 1, TaskKind::Discounting));
    assert!(!result.converged());
    assert_eq!(result.attempts(), 4);
}

#[test]
fn test_observer_sees_monotone_best() {
    let runner = scripted_runner(
        vec![
            ScriptStep::Rhat(1.4),
            ScriptStep::Fail,
            ScriptStep::Rhat(1.6),
            ScriptStep::Rhat(1.1),
            ScriptStep::Rhat(1.2),
        ],
        5,
    );
    let mut bests = Vec::new();
    let mut failures = 0;
    let result = runner.run_observed(&stub_session("S04", 1, TaskKind::Discounting), |event| {
        bests.push(event.best_diagnostic);
        if event.outcome.is_err() {
            failures += 1;
        }
    });

    assert_eq!(bests.len(), 5);
    assert!(bests.windows(2).all(|w| w[1] <= w[0]), "{bests:?}");
    assert_eq!(failures, 1);
    assert!((result.diagnostic().unwrap() - 1.1).abs() < 1e-12);
}

#[test]
fn test_attempt_seeds_are_distinct() {
    let key = SessionKey::new("S01", 1, TaskKind::Discounting);
    let other_day = SessionKey::new("S01", 2, TaskKind::Discounting);
    let other_task = SessionKey::new("S01", 1, TaskKind::RiskAmbiguity);

    let seeds = [
        attempt_seed(7, &key, 0),
        attempt_seed(7, &key, 1),
        attempt_seed(8, &key, 0),
        attempt_seed(7, &other_day, 0),
        attempt_seed(7, &other_task, 0),
    ];
    for (i, a) in seeds.iter().enumerate() {
        for b in &seeds[i + 1..] {
            assert_ne!(a, b);
        }
    }
    assert_eq!(attempt_seed(7, &key, 3), attempt_seed(7, &key, 3));
}

#[test]
fn test_metropolis_fit_converges_near_truth() {
    let session = discounting_session("S10", 1, 0.02, 1.0, 2, 11);
    let runner = ConvergenceRunner::new(
        MetropolisEngine::new(),
        SamplerConfig {
            chain_count: 4,
            draws_per_chain: 2000,
            warmup_draws: 1000,
        },
        RetryPolicy {
            attempt_budget: 10,
            rhat_threshold: 1.05,
        },
        1,
    );
    let result = runner.run(&session);

    assert!(result.converged(), "diagnostic {:?}", result.diagnostic());
    assert!(result.attempts() <= 10);
    let log_k = result.estimate("log_discount_rate").unwrap();
    assert!(log_k.q025 <= log_k.mean && log_k.mean <= log_k.q975);
    // True log k = ln 0.02 ~ -3.9; the design brackets it well
    assert!((log_k.mean - 0.02f64.ln()).abs() < 1.5, "mean {}", log_k.mean);
}
