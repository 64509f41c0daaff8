//! Cross-task outer join on (subject, day)

use super::{TaskEstimateRow, TaskEstimates};
use crate::session::{TaskKind, UnitKey};
use crate::{Error, Result};
use std::collections::BTreeMap;
use tracing::info;

/// One (subject, day) of the final table: each task's clean row, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimateRow {
    /// (subject, day)
    pub unit: UnitKey,
    /// Row per task; a task without a clean row for this unit is absent
    pub estimates: BTreeMap<TaskKind, TaskEstimateRow>,
}

impl EstimateRow {
    /// This unit's row for `task`.
    #[must_use]
    pub fn task(&self, task: TaskKind) -> Option<&TaskEstimateRow> {
        self.estimates.get(&task)
    }

    /// Posterior mean of one parameter of one task.
    #[must_use]
    pub fn estimate(&self, task: TaskKind, param: &str) -> Option<f64> {
        self.task(task)
            .and_then(|row| row.param(param))
            .map(|p| p.estimate)
    }
}

/// Outer-joined estimate table, the pipeline's terminal artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimateTable {
    tasks: Vec<TaskKind>,
    rows: Vec<EstimateRow>,
}

impl EstimateTable {
    /// Tasks contributing columns, in column order.
    #[must_use]
    pub fn tasks(&self) -> &[TaskKind] {
        &self.tasks
    }

    /// Rows ordered by (subject, day).
    #[must_use]
    pub fn rows(&self) -> &[EstimateRow] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row for a unit.
    #[must_use]
    pub fn get(&self, unit: &UnitKey) -> Option<&EstimateRow> {
        self.rows
            .binary_search_by(|row| row.unit.cmp(unit))
            .ok()
            .map(|index| &self.rows[index])
    }
}

/// Outer-join the clean rows of each task on (subject, day).
///
/// A unit present in only one task keeps its row with the other task's
/// fields missing. Excluded rows do not take part.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the same task is passed twice.
pub fn join_tasks<'a, I>(tasks: I) -> Result<EstimateTable>
where
    I: IntoIterator<Item = &'a TaskEstimates>,
{
    let mut joined: BTreeMap<UnitKey, BTreeMap<TaskKind, TaskEstimateRow>> = BTreeMap::new();
    let mut kinds = Vec::new();

    for estimates in tasks {
        if kinds.contains(&estimates.task()) {
            return Err(Error::InvalidInput(format!(
                "task {} passed to the join twice",
                estimates.task()
            )));
        }
        kinds.push(estimates.task());
        for row in estimates.clean() {
            joined
                .entry(row.unit())
                .or_default()
                .insert(estimates.task(), row.clone());
        }
    }
    kinds.sort();

    let rows: Vec<EstimateRow> = joined
        .into_iter()
        .map(|(unit, estimates)| EstimateRow { unit, estimates })
        .collect();
    info!(tasks = kinds.len(), rows = rows.len(), "joined task estimates");
    Ok(EstimateTable { tasks: kinds, rows })
}
