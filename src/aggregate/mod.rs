//! Aggregation and outlier filtering
//!
//! Per task, after every session has a [`FitResult`]:
//!
//! 1. each parameter estimate is carried on its sampling scale, and log-scale
//!    parameters also get their natural value (`exp`),
//! 2. credible-interval width = `q97.5 - q2.5` per parameter,
//! 3. width z-score against the task's session population,
//!    `z = (width - mean) / sd` with the sample standard deviation,
//! 4. a session is excluded when `z >= cutoff` for any of the model's
//!    outlier targets. Only wide intervals are excluded, never narrow ones.
//!
//! The clean sets of both tasks are then outer-joined on (subject, day), see
//! [`join_tasks`]. Nothing here is random: the same results always give the
//! same table.

mod join;
mod output;

pub use join::{join_tasks, EstimateRow, EstimateTable};

use crate::model::{ModelSpec, ParamScale};
use crate::runner::FitResult;
use crate::sampler::diagnostics::{mean, sample_sd};
use crate::session::{SessionKey, TaskKind, UnitKey};
use crate::{Error, Result};
use std::collections::BTreeMap;
use tracing::info;

/// One parameter of one session, ready for the estimate table.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamEstimate {
    /// Parameter name
    pub name: &'static str,
    /// Posterior mean on the sampling scale
    pub estimate: f64,
    /// `exp(estimate)` for log-scale parameters, with its column name
    pub natural: Option<(&'static str, f64)>,
    /// Posterior standard deviation
    pub sd: f64,
    /// 2.5% quantile
    pub lower: f64,
    /// 97.5% quantile
    pub upper: f64,
    /// `upper - lower`
    pub width: f64,
    /// Width z-score within the task population
    pub width_z: f64,
}

/// One session's row within a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEstimateRow {
    /// Session key
    pub key: SessionKey,
    /// Converged flag of the fit
    pub converged: bool,
    /// Attempts the fit used
    pub attempts: u32,
    /// Convergence diagnostic of the retained attempt
    pub diagnostic: f64,
    /// Parameters in model order
    pub params: Vec<ParamEstimate>,
    /// Whether the row is an interval-width outlier
    pub excluded: bool,
}

impl TaskEstimateRow {
    /// Estimate for one parameter.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&ParamEstimate> {
        self.params.iter().find(|p| p.name == name)
    }

    /// (subject, day) of the row.
    #[must_use]
    pub fn unit(&self) -> UnitKey {
        self.key.unit()
    }
}

/// Population statistics of one parameter's interval width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WidthStats {
    /// Parameter name
    pub param: &'static str,
    /// Sessions contributing
    pub count: usize,
    /// Mean width
    pub mean: f64,
    /// Sample standard deviation of the width
    pub sd: f64,
}

impl WidthStats {
    fn of(param: &'static str, widths: &[f64]) -> Self {
        Self {
            param,
            count: widths.len(),
            mean: if widths.is_empty() { 0.0 } else { mean(widths) },
            sd: if widths.len() < 2 { 0.0 } else { sample_sd(widths) },
        }
    }

    /// z-score of `width`; zero when the spread is undefined or zero.
    #[must_use]
    pub fn z(&self, width: f64) -> f64 {
        if self.count < 2 || !(self.sd.is_finite() && self.sd > 0.0) {
            0.0
        } else {
            (width - self.mean) / self.sd
        }
    }
}

/// All estimated sessions of one task, with outlier flags.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEstimates {
    task: TaskKind,
    rows: Vec<TaskEstimateRow>,
    width_stats: Vec<WidthStats>,
    unestimated: Vec<SessionKey>,
    cutoff: f64,
}

impl TaskEstimates {
    /// Task of every row.
    #[must_use]
    pub const fn task(&self) -> TaskKind {
        self.task
    }

    /// Every estimated row, ordered by (subject, day).
    #[must_use]
    pub fn rows(&self) -> &[TaskEstimateRow] {
        &self.rows
    }

    /// Rows kept after outlier exclusion.
    pub fn clean(&self) -> impl Iterator<Item = &TaskEstimateRow> {
        self.rows.iter().filter(|r| !r.excluded)
    }

    /// Rows excluded as outliers.
    pub fn excluded(&self) -> impl Iterator<Item = &TaskEstimateRow> {
        self.rows.iter().filter(|r| r.excluded)
    }

    /// Width statistics per parameter, in model order.
    #[must_use]
    pub fn width_stats(&self) -> &[WidthStats] {
        &self.width_stats
    }

    /// Sessions with no successful attempt; they have no row.
    #[must_use]
    pub fn unestimated(&self) -> &[SessionKey] {
        &self.unestimated
    }

    /// z cutoff the flags were computed with.
    #[must_use]
    pub const fn cutoff(&self) -> f64 {
        self.cutoff
    }

    /// Number of rows excluded as outliers.
    #[must_use]
    pub fn excluded_count(&self) -> usize {
        self.excluded().count()
    }

    /// Number of rows whose fit converged.
    #[must_use]
    pub fn converged_count(&self) -> usize {
        self.rows.iter().filter(|r| r.converged).count()
    }
}

/// Aggregate one task's results and flag interval-width outliers.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if a result belongs to another task, the
/// same (subject, day) appears twice, or `cutoff` is not finite.
pub fn aggregate_task<'a, I>(task: TaskKind, results: I, cutoff: f64) -> Result<TaskEstimates>
where
    I: IntoIterator<Item = &'a FitResult>,
{
    if !cutoff.is_finite() {
        return Err(Error::InvalidInput(format!("outlier cutoff must be finite (got {cutoff})")));
    }
    let model = task.model();

    let mut by_unit: BTreeMap<UnitKey, &FitResult> = BTreeMap::new();
    for result in results {
        if result.key().task != task {
            return Err(Error::InvalidInput(format!(
                "result {} passed to the {task} aggregation",
                result.key()
            )));
        }
        if by_unit.insert(result.unit(), result).is_some() {
            return Err(Error::InvalidInput(format!(
                "more than one result for {} in {task}",
                result.unit()
            )));
        }
    }

    let mut rows = Vec::with_capacity(by_unit.len());
    let mut unestimated = Vec::new();
    for result in by_unit.into_values() {
        match estimate_row(model, result) {
            Some(row) => rows.push(row),
            None => unestimated.push(result.key().clone()),
        }
    }

    let width_stats: Vec<WidthStats> = model
        .params
        .iter()
        .enumerate()
        .map(|(index, spec)| {
            let widths: Vec<f64> = rows.iter().map(|r| r.params[index].width).collect();
            WidthStats::of(spec.name, &widths)
        })
        .collect();

    for row in &mut rows {
        for (param, stats) in row.params.iter_mut().zip(&width_stats) {
            param.width_z = stats.z(param.width);
        }
        row.excluded = row
            .params
            .iter()
            .any(|p| model.outlier_targets.contains(&p.name) && p.width_z >= cutoff);
    }

    let estimates = TaskEstimates {
        task,
        rows,
        width_stats,
        unestimated,
        cutoff,
    };
    info!(
        task = %task,
        rows = estimates.rows.len(),
        converged = estimates.converged_count(),
        excluded = estimates.excluded_count(),
        unestimated = estimates.unestimated.len(),
        "aggregated task estimates"
    );
    Ok(estimates)
}

fn estimate_row(model: &ModelSpec, result: &FitResult) -> Option<TaskEstimateRow> {
    let best = result.best()?;
    let params = model
        .params
        .iter()
        .map(|spec| {
            let summary = best.summary.get(spec.name)?;
            Some(ParamEstimate {
                name: spec.name,
                estimate: summary.mean,
                natural: match spec.scale {
                    ParamScale::Log { natural } => Some((natural, summary.mean.exp())),
                    ParamScale::Linear => None,
                },
                sd: summary.sd,
                lower: summary.q025,
                upper: summary.q975,
                width: summary.interval_width(),
                width_z: 0.0,
            })
        })
        .collect::<Option<Vec<_>>>()?;

    Some(TaskEstimateRow {
        key: result.key().clone(),
        converged: result.converged(),
        attempts: result.attempts(),
        diagnostic: best.diagnostic,
        params,
        excluded: false,
    })
}
