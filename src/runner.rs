//! Convergence-retry runner
//!
//! Drives a [`SamplingEngine`] for one session until the convergence
//! diagnostic drops below the acceptance threshold or the attempt budget is
//! spent. Every attempt is an independent run with its own seed; the best
//! attempt seen so far is kept, so an early good attempt is never replaced by
//! a worse late one.
//!
//! The loop is an explicit state machine:
//!
//! ```text
//! Pending -> Attempting -> Converged
//!                 |  ^
//!                 +--+  (not converged, budget left)
//!                 |
//!                 +----> Exhausted  (budget spent, best effort kept)
//! ```

use crate::config::RetryPolicy;
use crate::sampler::{
    ParamSummary, PosteriorSummary, SampleRequest, SamplerConfig, SamplerFailure, SamplingEngine,
};
use crate::session::{Session, SessionKey, UnitKey};
use chrono::{DateTime, SubsecRound, Utc};
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Output of one successful sampling attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitAttempt {
    /// Zero-based attempt index
    pub attempt: u32,
    /// Seed the engine was given
    pub seed: u64,
    /// Max R-hat over the model's convergence targets
    pub diagnostic: f64,
    /// Per-parameter posterior summary
    pub summary: PosteriorSummary,
}

/// Final outcome of the retry loop for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    key: SessionKey,
    best: Option<FitAttempt>,
    attempts: u32,
    converged: bool,
    fitted_at: DateTime<Utc>,
}

impl FitResult {
    /// Create a result stamped with the current time (millisecond precision,
    /// as persisted).
    #[must_use]
    pub fn new(key: SessionKey, best: Option<FitAttempt>, attempts: u32, converged: bool) -> Self {
        Self {
            key,
            best,
            attempts,
            converged,
            fitted_at: Utc::now().trunc_subsecs(3),
        }
    }

    /// Replace the timestamp (used when decoding persisted results).
    #[must_use]
    pub const fn with_fitted_at(mut self, fitted_at: DateTime<Utc>) -> Self {
        self.fitted_at = fitted_at;
        self
    }

    /// Session this result belongs to.
    #[must_use]
    pub const fn key(&self) -> &SessionKey {
        &self.key
    }

    /// (subject, day) part of the key.
    #[must_use]
    pub fn unit(&self) -> UnitKey {
        self.key.unit()
    }

    /// Best attempt, if any attempt succeeded.
    #[must_use]
    pub const fn best(&self) -> Option<&FitAttempt> {
        self.best.as_ref()
    }

    /// Number of attempts used, failed ones included.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the best attempt met the acceptance threshold.
    #[must_use]
    pub const fn converged(&self) -> bool {
        self.converged
    }

    /// Diagnostic of the best attempt.
    #[must_use]
    pub fn diagnostic(&self) -> Option<f64> {
        self.best.as_ref().map(|b| b.diagnostic)
    }

    /// Summary of one parameter from the best attempt.
    #[must_use]
    pub fn estimate(&self, param: &str) -> Option<&ParamSummary> {
        self.best.as_ref().and_then(|b| b.summary.get(param))
    }

    /// When the result was produced.
    #[must_use]
    pub const fn fitted_at(&self) -> DateTime<Utc> {
        self.fitted_at
    }
}

/// Retry loop state.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerState {
    /// Not started
    Pending,
    /// Sampling; `attempts` have been made so far
    Attempting {
        /// Attempts made
        attempts: u32,
        /// Best successful attempt so far
        best: Option<FitAttempt>,
    },
    /// Best attempt is below the acceptance threshold
    Converged {
        /// Attempts made
        attempts: u32,
        /// Accepted attempt
        best: FitAttempt,
    },
    /// Budget spent without convergence
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Best effort, if any attempt succeeded
        best: Option<FitAttempt>,
    },
}

impl RunnerState {
    /// Whether no further attempts will be made.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Converged { .. } | Self::Exhausted { .. })
    }

    /// Attempts made so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Pending => 0,
            Self::Attempting { attempts, .. }
            | Self::Converged { attempts, .. }
            | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// Diagnostic of the best attempt so far; +inf when there is none.
    #[must_use]
    pub fn best_diagnostic(&self) -> f64 {
        match self {
            Self::Pending => f64::INFINITY,
            Self::Converged { best, .. } => best.diagnostic,
            Self::Attempting { best, .. } | Self::Exhausted { best, .. } => {
                best.as_ref().map_or(f64::INFINITY, |b| b.diagnostic)
            }
        }
    }

    /// Enter `Attempting` with no attempts and no best.
    #[must_use]
    pub fn start(self) -> Self {
        match self {
            Self::Pending => Self::Attempting {
                attempts: 0,
                best: None,
            },
            other => other,
        }
    }

    /// Apply one attempt outcome.
    ///
    /// `Pending` is started first; terminal states are returned unchanged.
    #[must_use]
    pub fn advance(self, outcome: Result<FitAttempt, SamplerFailure>, policy: &RetryPolicy) -> Self {
        let (attempts, mut best) = match self.start() {
            Self::Attempting { attempts, best } => (attempts + 1, best),
            terminal => return terminal,
        };

        if let Ok(attempt) = outcome {
            let converged = attempt.diagnostic < policy.rhat_threshold;
            let improves = best
                .as_ref()
                .map_or(true, |current| attempt.diagnostic < current.diagnostic);
            if improves {
                best = Some(attempt);
            }
            if converged {
                if let Some(best) = best.take() {
                    return Self::Converged { attempts, best };
                }
            }
        }

        if attempts >= policy.attempt_budget {
            Self::Exhausted { attempts, best }
        } else {
            Self::Attempting { attempts, best }
        }
    }

    /// Convert a terminal state into a result; `None` if not terminal.
    #[must_use]
    pub fn into_result(self, key: SessionKey) -> Option<FitResult> {
        match self {
            Self::Converged { attempts, best } => {
                Some(FitResult::new(key, Some(best), attempts, true))
            }
            Self::Exhausted { attempts, best } => Some(FitResult::new(key, best, attempts, false)),
            Self::Pending | Self::Attempting { .. } => None,
        }
    }
}

/// Report on one finished attempt, passed to observers.
#[derive(Debug, Clone, Copy)]
pub struct AttemptEvent<'a> {
    /// Session being fitted
    pub key: &'a SessionKey,
    /// Zero-based attempt index
    pub attempt: u32,
    /// Diagnostic of this attempt, or the failure
    pub outcome: Result<f64, &'a SamplerFailure>,
    /// Best diagnostic after this attempt
    pub best_diagnostic: f64,
}

/// Runs the convergence-retry loop for single sessions.
#[derive(Debug, Clone)]
pub struct ConvergenceRunner<E> {
    engine: E,
    sampler: SamplerConfig,
    policy: RetryPolicy,
    base_seed: u64,
}

impl<E: SamplingEngine> ConvergenceRunner<E> {
    /// Create a runner.
    #[must_use]
    pub const fn new(engine: E, sampler: SamplerConfig, policy: RetryPolicy, base_seed: u64) -> Self {
        Self {
            engine,
            sampler,
            policy,
            base_seed,
        }
    }

    /// The wrapped engine.
    #[must_use]
    pub const fn engine(&self) -> &E {
        &self.engine
    }

    /// Retry policy in force.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fit one session to a terminal state.
    #[must_use]
    pub fn run(&self, session: &Session) -> FitResult {
        self.run_observed(session, |_| {})
    }

    /// Fit one session, reporting every attempt to `observer`.
    pub fn run_observed<F>(&self, session: &Session, mut observer: F) -> FitResult
    where
        F: FnMut(&AttemptEvent<'_>),
    {
        let key = session.key();
        let model = key.task.model();
        let mut state = RunnerState::Pending.start();

        while let RunnerState::Attempting { attempts, .. } = state {
            let seed = attempt_seed(self.base_seed, key, attempts);
            let request = SampleRequest {
                model,
                session,
                config: &self.sampler,
                seed,
            };
            let outcome = self
                .engine
                .sample(&request)
                .and_then(|summary| {
                    summary.check_finite()?;
                    Ok(summary)
                })
                .map(|summary| FitAttempt {
                    attempt: attempts,
                    seed,
                    diagnostic: summary.max_rhat(model.convergence_targets),
                    summary,
                });

            match &outcome {
                Ok(fit) => tracing::debug!(
                    session = %key,
                    attempt = attempts,
                    diagnostic = fit.diagnostic,
                    "attempt sampled"
                ),
                Err(failure) => tracing::warn!(
                    session = %key,
                    attempt = attempts,
                    error = %failure,
                    "sampling attempt failed"
                ),
            }
            let diagnostic = outcome.as_ref().map(|fit| fit.diagnostic).map_err(Clone::clone);

            state = state.advance(outcome, &self.policy);
            observer(&AttemptEvent {
                key,
                attempt: attempts,
                outcome: diagnostic.as_ref().copied(),
                best_diagnostic: state.best_diagnostic(),
            });
        }

        let attempts = state.attempts();
        let converged = matches!(state, RunnerState::Converged { .. });
        let best_diagnostic = state.best_diagnostic();
        let result = state
            .into_result(key.clone())
            .unwrap_or_else(|| FitResult::new(key.clone(), None, attempts, false));

        if converged {
            tracing::debug!(session = %key, attempts, diagnostic = best_diagnostic, "converged");
        } else {
            tracing::warn!(
                session = %key,
                attempts,
                diagnostic = best_diagnostic,
                "attempt budget exhausted without convergence"
            );
        }
        result
    }
}

/// Seed for one attempt: independent across sessions, attempts and base seeds.
#[must_use]
pub fn attempt_seed(base_seed: u64, key: &SessionKey, attempt: u32) -> u64 {
    let mut hasher = FxHasher::default();
    base_seed.hash(&mut hasher);
    key.subject.hash(&mut hasher);
    key.day.hash(&mut hasher);
    key.task.as_str().hash(&mut hasher);
    attempt.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{ScriptStep, ScriptedEngine};
    use crate::session::{TaskKind, Trial};

    fn policy(budget: u32) -> RetryPolicy {
        RetryPolicy {
            attempt_budget: budget,
            rhat_threshold: 1.01,
        }
    }

    fn attempt(index: u32, diagnostic: f64) -> FitAttempt {
        FitAttempt {
            attempt: index,
            seed: u64::from(index),
            diagnostic,
            summary: PosteriorSummary { params: Vec::new() },
        }
    }

    fn session() -> Session {
        Session::new(
            SessionKey::new("S1", 1, TaskKind::Discounting),
            vec![Trial::discounting(10.0, 0.0, 20.0, 30.0, 1)],
        )
        .unwrap()
    }

    fn failure() -> SamplerFailure {
        SamplerFailure::Divergence("test".to_string())
    }

    #[test]
    fn test_pending_starts_attempting() {
        assert_eq!(
            RunnerState::Pending.start(),
            RunnerState::Attempting {
                attempts: 0,
                best: None
            }
        );
        let state = RunnerState::Pending.advance(Err(failure()), &policy(3));
        assert_eq!(state.attempts(), 1);
        assert!(state.best_diagnostic().is_infinite());
    }

    #[test]
    fn test_worse_attempt_does_not_replace_best() {
        let p = policy(10);
        let state = RunnerState::Attempting {
            attempts: 0,
            best: None,
        }
        .advance(Ok(attempt(0, 1.3)), &p)
        .advance(Ok(attempt(1, 1.8)), &p);
        assert_eq!(state.attempts(), 2);
        assert!((state.best_diagnostic() - 1.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_failure_counts_but_keeps_best() {
        let p = policy(10);
        let state = RunnerState::Attempting {
            attempts: 0,
            best: None,
        }
        .advance(Ok(attempt(0, 1.2)), &p)
        .advance(Err(failure()), &p);
        assert_eq!(state.attempts(), 2);
        assert!((state.best_diagnostic() - 1.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_exhausted_at_budget() {
        let p = policy(2);
        let state = RunnerState::Attempting {
            attempts: 0,
            best: None,
        }
        .advance(Err(failure()), &p)
        .advance(Ok(attempt(1, 1.5)), &p);
        assert!(matches!(state, RunnerState::Exhausted { attempts: 2, .. }));
        // Terminal states absorb further outcomes
        let after = state.clone().advance(Ok(attempt(2, 1.0)), &p);
        assert_eq!(after, state);
    }

    #[test]
    fn test_threshold_is_strict() {
        let p = policy(5);
        let at_threshold = RunnerState::Attempting {
            attempts: 0,
            best: None,
        }
        .advance(Ok(attempt(0, 1.01)), &p);
        assert!(!at_threshold.is_terminal());

        let below = at_threshold.advance(Ok(attempt(1, 1.009)), &p);
        assert!(matches!(below, RunnerState::Converged { attempts: 2, .. }));
    }

    #[test]
    fn test_run_converges_after_retries() {
        let engine = ScriptedEngine::new(vec![
            ScriptStep::Rhat(1.4),
            ScriptStep::Fail,
            ScriptStep::Rhat(1.005),
        ]);
        let runner = ConvergenceRunner::new(engine, SamplerConfig::default(), policy(100), 7);
        let mut events = Vec::new();
        let result = runner.run_observed(&session(), |event| {
            events.push((event.attempt, event.outcome.is_ok(), event.best_diagnostic));
        });

        assert!(result.converged());
        assert_eq!(result.attempts(), 3);
        assert_eq!(result.best().map(|b| b.attempt), Some(2));
        assert_eq!(runner.engine().calls(), 3);
        assert_eq!(events.len(), 3);
        assert!(!events[1].1);
        assert!((events[1].2 - 1.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_all_failures_exhaust_with_no_best() {
        let runner = ConvergenceRunner::new(
            ScriptedEngine::new(vec![ScriptStep::Fail]),
            SamplerConfig::default(),
            policy(4),
            7,
        );
        let result = runner.run(&session());
        assert!(!result.converged());
        assert_eq!(result.attempts(), 4);
        assert!(result.best().is_none());
        assert!(result.diagnostic().is_none());
    }

    #[test]
    fn test_attempt_seeds_are_distinct() {
        let key = SessionKey::new("S1", 1, TaskKind::Discounting);
        let other = SessionKey::new("S1", 1, TaskKind::RiskAmbiguity);
        assert_ne!(attempt_seed(1, &key, 0), attempt_seed(1, &key, 1));
        assert_ne!(attempt_seed(1, &key, 0), attempt_seed(2, &key, 0));
        assert_ne!(attempt_seed(1, &key, 0), attempt_seed(1, &other, 0));
        assert_eq!(attempt_seed(1, &key, 3), attempt_seed(1, &key, 3));
    }
}
