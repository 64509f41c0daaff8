//! Scripted sampling engine
//!
//! Replays a fixed sequence of outcomes per session instead of sampling.
//! Useful for exercising the retry loop and the scheduler without paying for
//! MCMC, and for counting how often the engine was invoked.

use super::{ParamSummary, PosteriorSummary, SampleRequest, SamplerFailure, SamplingEngine};
use crate::session::SessionKey;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One scripted attempt outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScriptStep {
    /// Succeed with this R-hat on every parameter
    Rhat(f64),
    /// Fail with a divergence
    Fail,
}

type ScriptFn = dyn Fn(&SessionKey, usize) -> ScriptStep + Send + Sync;

/// Deterministic engine that replays a per-session script.
///
/// The script is indexed by the number of times the engine has already been
/// called for the same session; once the script runs out its last step
/// repeats. Point estimates sit at the centre of each prior interval with a
/// credible interval a fifth of the span wide, unless overridden with
/// [`with_interval_width`](Self::with_interval_width).
pub struct ScriptedEngine {
    script: Box<ScriptFn>,
    interval_widths: DashMap<SessionKey, f64>,
    calls_per_session: DashMap<SessionKey, usize>,
    calls: Arc<AtomicUsize>,
}

impl std::fmt::Debug for ScriptedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedEngine")
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

impl ScriptedEngine {
    /// Same step sequence for every session.
    #[must_use]
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        let steps: Arc<[ScriptStep]> = steps.into();
        Self::from_fn(move |_, call| {
            steps
                .get(call)
                .or_else(|| steps.last())
                .copied()
                .unwrap_or(ScriptStep::Rhat(1.0))
        })
    }

    /// Every call converges immediately.
    #[must_use]
    pub fn converging() -> Self {
        Self::new(vec![ScriptStep::Rhat(1.0)])
    }

    /// Arbitrary script: `f(session, call_index)`.
    #[must_use]
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&SessionKey, usize) -> ScriptStep + Send + Sync + 'static,
    {
        Self {
            script: Box::new(f),
            interval_widths: DashMap::new(),
            calls_per_session: DashMap::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Report credible intervals of `width` for this session's parameters.
    #[must_use]
    pub fn with_interval_width(self, key: SessionKey, width: f64) -> Self {
        self.interval_widths.insert(key, width);
        self
    }

    /// Total number of `sample` calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Shared call counter, readable after the engine is moved.
    #[must_use]
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    /// Number of calls made for one session.
    #[must_use]
    pub fn calls_for(&self, key: &SessionKey) -> usize {
        self.calls_per_session.get(key).map_or(0, |c| *c)
    }
}

impl SamplingEngine for ScriptedEngine {
    fn sample(&self, request: &SampleRequest<'_>) -> Result<PosteriorSummary, SamplerFailure> {
        let key = request.session.key();
        self.calls.fetch_add(1, Ordering::SeqCst);
        let call = {
            let mut entry = self.calls_per_session.entry(key.clone()).or_insert(0);
            let call = *entry;
            *entry += 1;
            call
        };

        match (self.script)(key, call) {
            ScriptStep::Fail => Err(SamplerFailure::Divergence(format!(
                "scripted failure on call {call} for {key}"
            ))),
            ScriptStep::Rhat(rhat) => {
                let width = self.interval_widths.get(key).map(|w| *w);
                let params = request
                    .model
                    .params
                    .iter()
                    .map(|spec| {
                        let centre = (spec.lower + spec.upper) / 2.0;
                        let half = width.unwrap_or(spec.span() / 5.0) / 2.0;
                        ParamSummary {
                            name: spec.name.to_string(),
                            mean: centre,
                            sd: half / 1.96,
                            q025: centre - half,
                            q975: centre + half,
                            rhat,
                        }
                    })
                    .collect();
                Ok(PosteriorSummary { params })
            }
        }
    }
}
