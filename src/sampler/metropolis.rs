//! Adaptive component-wise random-walk Metropolis
//!
//! Each chain:
//! 1. starts from a uniform draw inside the prior box (over-dispersed
//!    starting points make R-hat informative),
//! 2. updates one parameter at a time with a Gaussian proposal; proposals
//!    outside the bounds are rejected (truncated uniform prior),
//! 3. adapts each parameter's proposal scale in batches during warm-up
//!    toward the target acceptance rate (Roberts & Rosenthal 2009), then
//!    freezes the scales for the retained draws.
//!
//! Chains share nothing: each owns a seeded RNG derived from the attempt seed
//! and runs on its own rayon task.

use super::diagnostics::{mean, quantile_sorted, sample_sd, split_rhat};
use super::{ParamSummary, PosteriorSummary, SampleRequest, SamplerFailure, SamplingEngine};
use crate::model::ModelSpec;
use crate::session::Trial;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;

/// Warm-up iterations per adaptation batch
const ADAPT_BATCH: usize = 50;

/// Initial proposal scale as a fraction of each parameter's prior span
const INITIAL_SCALE_FRACTION: f64 = 0.1;

/// Upper limit on a single log-scale adjustment
const MAX_ADAPT_STEP: f64 = 0.5;

/// Draws tried before giving up on a finite starting point
const MAX_INIT_TRIES: usize = 100;

/// Built-in posterior sampler.
#[derive(Debug, Clone, Copy)]
pub struct MetropolisEngine {
    target_acceptance: f64,
}

impl Default for MetropolisEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MetropolisEngine {
    /// Engine with the standard one-dimensional target acceptance of 0.44.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            target_acceptance: 0.44,
        }
    }
}

impl SamplingEngine for MetropolisEngine {
    fn sample(&self, request: &SampleRequest<'_>) -> Result<PosteriorSummary, SamplerFailure> {
        request.config.validate()?;
        let model = request.model;
        let trials = request.session.trials();

        // chains[c][p] = draws of parameter p in chain c
        let chains = (0..request.config.chain_count)
            .into_par_iter()
            .map(|chain| {
                let mut rng = StdRng::seed_from_u64(chain_seed(request.seed, chain));
                run_chain(
                    model,
                    trials,
                    &mut rng,
                    chain,
                    request.config.warmup_draws,
                    request.config.draws_per_chain,
                    self.target_acceptance,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let params = model
            .params
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let per_chain: Vec<Vec<f64>> =
                    chains.iter().map(|chain| chain[index].clone()).collect();
                summarize(spec.name, &per_chain)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let summary = PosteriorSummary { params };
        summary.check_finite()?;
        Ok(summary)
    }
}

/// SplitMix64 step; decorrelates chain seeds drawn from one attempt seed.
#[allow(clippy::cast_possible_truncation)]
const fn chain_seed(seed: u64, chain: usize) -> u64 {
    let mut z = seed.wrapping_add((chain as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn initial_point(
    model: &ModelSpec,
    trials: &[Trial],
    rng: &mut StdRng,
    chain: usize,
) -> Result<(Vec<f64>, f64), SamplerFailure> {
    for _ in 0..MAX_INIT_TRIES {
        let point: Vec<f64> = model
            .params
            .iter()
            .map(|p| rng.gen_range(p.lower..=p.upper))
            .collect();
        let log_density = model.log_posterior(&point, trials);
        if log_density.is_finite() {
            return Ok((point, log_density));
        }
    }
    Err(SamplerFailure::Initialization {
        chain,
        tries: MAX_INIT_TRIES,
    })
}

#[allow(clippy::cast_precision_loss)]
fn run_chain(
    model: &ModelSpec,
    trials: &[Trial],
    rng: &mut StdRng,
    chain: usize,
    warmup: usize,
    draws: usize,
    target_acceptance: f64,
) -> Result<Vec<Vec<f64>>, SamplerFailure> {
    let dim = model.dim();
    let (mut current, mut log_density) = initial_point(model, trials, rng, chain)?;
    let mut log_scales: Vec<f64> = model
        .params
        .iter()
        .map(|p| (p.span() * INITIAL_SCALE_FRACTION).ln())
        .collect();
    let mut accepted = vec![0usize; dim];
    let mut output: Vec<Vec<f64>> = (0..dim).map(|_| Vec::with_capacity(draws)).collect();

    for iteration in 0..warmup + draws {
        for p in 0..dim {
            let step: f64 = rng.sample(StandardNormal);
            let proposal_value = step.mul_add(log_scales[p].exp(), current[p]);
            if !model.params[p].contains(proposal_value) {
                continue;
            }
            let previous = current[p];
            current[p] = proposal_value;
            let proposal_density = model.log_posterior(&current, trials);
            if proposal_density.is_nan() {
                return Err(SamplerFailure::Divergence(format!(
                    "log density is NaN at {current:?} in chain {chain}"
                )));
            }
            if rng.gen::<f64>().ln() < proposal_density - log_density {
                log_density = proposal_density;
                accepted[p] += 1;
            } else {
                current[p] = previous;
            }
        }

        if iteration < warmup {
            let batch = iteration / ADAPT_BATCH + 1;
            if (iteration + 1) % ADAPT_BATCH == 0 {
                let delta = (1.0 / (batch as f64).sqrt()).min(MAX_ADAPT_STEP);
                for p in 0..dim {
                    let rate = accepted[p] as f64 / ADAPT_BATCH as f64;
                    if rate > target_acceptance {
                        log_scales[p] += delta;
                    } else {
                        log_scales[p] -= delta;
                    }
                    accepted[p] = 0;
                }
            }
        } else {
            for (p, value) in current.iter().enumerate() {
                output[p].push(*value);
            }
        }
    }

    if !log_density.is_finite() {
        return Err(SamplerFailure::Divergence(format!(
            "chain {chain} ended at non-finite log density"
        )));
    }
    Ok(output)
}

fn summarize(name: &str, chains: &[Vec<f64>]) -> Result<ParamSummary, SamplerFailure> {
    let mut pooled: Vec<f64> = chains.iter().flatten().copied().collect();
    let rhat = split_rhat(chains);
    if rhat.is_nan() {
        return Err(SamplerFailure::Degenerate(name.to_string()));
    }
    let summary_mean = mean(&pooled);
    let sd = sample_sd(&pooled);
    pooled.sort_by(f64::total_cmp);
    Ok(ParamSummary {
        name: name.to_string(),
        mean: summary_mean,
        sd,
        q025: quantile_sorted(&pooled, 0.025),
        q975: quantile_sorted(&pooled, 0.975),
        rhat,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DISCOUNTING;
    use crate::sampler::SamplerConfig;
    use crate::session::{Session, SessionKey, TaskKind};

    fn small_session() -> Session {
        let trials = (0..40)
            .map(|i| {
                let delay = f64::from(i % 8) * 20.0;
                Trial::discounting(10.0, 0.0, 20.0, delay, u8::from(delay < 80.0))
            })
            .collect();
        Session::new(SessionKey::new("S1", 1, TaskKind::Discounting), trials).unwrap()
    }

    #[test]
    fn test_chain_seeds_differ() {
        assert_ne!(chain_seed(7, 0), chain_seed(7, 1));
        assert_ne!(chain_seed(7, 0), chain_seed(8, 0));
    }

    #[test]
    fn test_sample_respects_bounds_and_is_deterministic() {
        let session = small_session();
        let config = SamplerConfig {
            chain_count: 2,
            draws_per_chain: 300,
            warmup_draws: 200,
        };
        let request = SampleRequest {
            model: &DISCOUNTING,
            session: &session,
            config: &config,
            seed: 42,
        };
        let engine = MetropolisEngine::new();
        let first = engine.sample(&request).unwrap();
        let second = engine.sample(&request).unwrap();

        assert_eq!(first, second);
        for (summary, spec) in first.params.iter().zip(DISCOUNTING.params) {
            assert_eq!(summary.name, spec.name);
            assert!(spec.contains(summary.mean));
            assert!(spec.contains(summary.q025) && spec.contains(summary.q975));
            assert!(summary.q025 <= summary.q975);
            assert!(summary.rhat >= 0.9);
        }
    }

    #[test]
    fn test_invalid_config_is_failure() {
        let session = small_session();
        let config = SamplerConfig {
            chain_count: 1,
            draws_per_chain: 100,
            warmup_draws: 0,
        };
        let request = SampleRequest {
            model: &DISCOUNTING,
            session: &session,
            config: &config,
            seed: 1,
        };
        assert!(matches!(
            MetropolisEngine::new().sample(&request),
            Err(SamplerFailure::InvalidConfig(_))
        ));
    }
}
