//! Posterior summary statistics and convergence diagnostics
//!
//! References:
//! - Gelman et al. (2013), *Bayesian Data Analysis* 3rd ed., §11.4 (split R-hat)
//! - Hyndman & Fan (1996), sample quantile type 7

/// Arithmetic mean. NaN for an empty slice.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance with `n - 1` denominator. NaN for fewer than two values.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

/// Sample standard deviation with `n - 1` denominator.
#[must_use]
pub fn sample_sd(values: &[f64]) -> f64 {
    sample_variance(values).sqrt()
}

/// Type-7 (linear interpolation) quantile of an ascending-sorted slice.
#[must_use]
#[allow(clippy::cast_precision_loss)]
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let h = (n - 1) as f64 * p.clamp(0.0, 1.0);
            let lo = h.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            let frac = h - lo as f64;
            (sorted[hi] - sorted[lo]).mul_add(frac, sorted[lo])
        }
    }
}

/// Split R-hat for one parameter.
///
/// Every chain is split in half (dropping the middle draw of odd-length
/// chains) and the classic potential scale reduction factor is computed over
/// the `2m` half-chains. Returns NaN if the within-chain variance is zero or
/// the chains are too short to split.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn split_rhat(chains: &[Vec<f64>]) -> f64 {
    let half = chains.iter().map(Vec::len).min().unwrap_or(0) / 2;
    if chains.is_empty() || half < 2 {
        return f64::NAN;
    }

    let halves: Vec<&[f64]> = chains
        .iter()
        .flat_map(|chain| {
            let n = chain.len();
            [&chain[..half], &chain[n - half..]]
        })
        .collect();

    let n = half as f64;
    let chain_means: Vec<f64> = halves.iter().map(|h| mean(h)).collect();
    let within = mean(&halves.iter().map(|h| sample_variance(h)).collect::<Vec<_>>());
    let between = n * sample_variance(&chain_means);

    if within <= 0.0 || !within.is_finite() {
        return f64::NAN;
    }

    let var_plus = (n - 1.0) / n * within + between / n;
    (var_plus / within).sqrt()
}
