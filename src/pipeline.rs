//! End-to-end estimation pipeline
//!
//! For each task: schedule every session through the convergence runner
//! (reusing stored results), aggregate and outlier-filter the results, then
//! outer-join the clean sets of all tasks into one [`EstimateTable`].
//!
//! Tasks are independent. A task whose store cannot be opened (for example a
//! corrupted file) is reported as failed and the other tasks still run; one
//! session failing to converge never fails anything.

use crate::aggregate::{aggregate_task, join_tasks, EstimateTable, TaskEstimates};
use crate::config::PipelineConfig;
use crate::sampler::SamplingEngine;
use crate::scheduler::JobScheduler;
use crate::session::{Session, SessionKey, SessionTable, TaskKind};
use crate::store::FitStore;
use crate::{Error, Result};
use std::collections::BTreeSet;
use tracing::{error, info, warn};

/// Sessions of one task, as loaded.
#[derive(Debug, Clone)]
pub struct TaskInput {
    /// Task of every session
    pub task: TaskKind,
    /// Valid sessions
    pub sessions: Vec<Session>,
    /// Sessions rejected while loading
    pub rejected: Vec<SessionKey>,
}

impl TaskInput {
    /// Input with no rejected sessions.
    #[must_use]
    pub const fn new(task: TaskKind, sessions: Vec<Session>) -> Self {
        Self {
            task,
            sessions,
            rejected: Vec::new(),
        }
    }
}

impl From<SessionTable> for TaskInput {
    fn from(table: SessionTable) -> Self {
        let task = table.task();
        let rejected = table.rejected().iter().map(|r| r.key.clone()).collect();
        Self {
            task,
            sessions: table.into_sessions(),
            rejected,
        }
    }
}

/// Outcome of one task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    /// Task
    pub task: TaskKind,
    /// Fits that converged
    pub converged: usize,
    /// Fits that spent the attempt budget
    pub exhausted: usize,
    /// Fits with no successful attempt at all
    pub unestimated: usize,
    /// Rows excluded as interval-width outliers
    pub excluded: usize,
    /// Results taken from the store
    pub reused: usize,
    /// Results computed in this run
    pub computed: usize,
    /// Sessions not started because the run was stopped
    pub cancelled: usize,
    /// Sessions whose worker died
    pub failed: usize,
    /// Sessions rejected at load time
    pub rejected: usize,
    /// Aggregated rows with outlier flags
    pub estimates: TaskEstimates,
}

/// A task that could not run.
#[derive(Debug)]
pub struct TaskFailure {
    /// Task
    pub task: TaskKind,
    /// Why
    pub error: Error,
}

/// Outcome of a full pipeline run.
#[derive(Debug)]
pub struct PipelineReport {
    /// Tasks that ran, in task order
    pub tasks: Vec<TaskReport>,
    /// Tasks that failed
    pub failures: Vec<TaskFailure>,
    /// Outer join of the clean rows of all successful tasks
    pub table: EstimateTable,
}

impl PipelineReport {
    /// Report for one task, if it ran.
    #[must_use]
    pub fn task(&self, task: TaskKind) -> Option<&TaskReport> {
        self.tasks.iter().find(|r| r.task == task)
    }

    /// Whether every task ran and nothing was cancelled.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.tasks.iter().all(|t| t.cancelled == 0 && t.failed == 0)
    }
}

/// Scheduler plus aggregation settings.
#[derive(Debug)]
pub struct Pipeline<E> {
    scheduler: JobScheduler<E>,
    outlier_z_cutoff: f64,
}

impl<E: SamplingEngine> Pipeline<E> {
    /// Pipeline with the given engine and settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is invalid.
    pub fn new(engine: E, config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            scheduler: JobScheduler::from_config(engine, config),
            outlier_z_cutoff: config.outlier_z_cutoff,
        })
    }

    /// The scheduler, for progress and stop handles.
    #[must_use]
    pub const fn scheduler(&self) -> &JobScheduler<E> {
        &self.scheduler
    }

    /// Stop starting new sessions in this and later tasks.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Schedule and aggregate one task.
    ///
    /// # Errors
    ///
    /// Returns scheduler or store errors.
    pub async fn run_task<S: FitStore>(&self, input: TaskInput, store: &S) -> Result<TaskReport> {
        let task = input.task;
        let rejected = input.rejected.len();
        let outcome = self.scheduler.run(input.sessions, store).await?;
        let estimates = aggregate_task(task, outcome.results.values(), self.outlier_z_cutoff)?;

        let report = TaskReport {
            task,
            converged: outcome.converged(),
            exhausted: outcome.exhausted(),
            unestimated: estimates.unestimated().len(),
            excluded: estimates.excluded_count(),
            reused: outcome.reused,
            computed: outcome.computed,
            cancelled: outcome.cancelled.len(),
            failed: outcome.failed.len(),
            rejected,
            estimates,
        };
        info!(
            task = %task,
            converged = report.converged,
            exhausted = report.exhausted,
            unestimated = report.unestimated,
            excluded = report.excluded,
            reused = report.reused,
            computed = report.computed,
            rejected = report.rejected,
            "task finished"
        );
        Ok(report)
    }

    /// Run every task and join the results.
    ///
    /// `open_store` is called once per task; an error from it (or from the
    /// task itself) fails that task only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if two inputs share a task.
    pub async fn run<S, F>(&self, inputs: Vec<TaskInput>, mut open_store: F) -> Result<PipelineReport>
    where
        S: FitStore,
        F: FnMut(TaskKind) -> Result<S>,
    {
        let mut seen = BTreeSet::new();
        for input in &inputs {
            if !seen.insert(input.task) {
                return Err(Error::InvalidInput(format!(
                    "task {} given more than once",
                    input.task
                )));
            }
        }

        let mut tasks = Vec::new();
        let mut failures = Vec::new();
        for input in inputs {
            let task = input.task;
            let outcome = match open_store(task) {
                Ok(store) => self.run_task(input, &store).await,
                Err(error) => Err(error),
            };
            match outcome {
                Ok(report) => tasks.push(report),
                Err(error) => {
                    error!(task = %task, error = %error, "task failed");
                    failures.push(TaskFailure { task, error });
                }
            }
        }
        tasks.sort_by_key(|r| r.task);

        let table = join_tasks(tasks.iter().map(|r| &r.estimates))?;
        if !failures.is_empty() {
            warn!(
                failed = failures.len(),
                rows = table.len(),
                "estimate table is missing failed tasks"
            );
        }
        Ok(PipelineReport {
            tasks,
            failures,
            table,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::ScriptedEngine;
    use crate::session::Trial;
    use crate::store::MemoryFitStore;

    fn config() -> PipelineConfig {
        PipelineConfig::builder()
            .attempt_budget(3)
            .concurrency(2)
            .build()
            .unwrap()
    }

    fn discounting(subjects: &[&str]) -> TaskInput {
        TaskInput::new(
            TaskKind::Discounting,
            subjects
                .iter()
                .map(|s| {
                    Session::new(
                        SessionKey::new(*s, 1, TaskKind::Discounting),
                        vec![Trial::discounting(10.0, 0.0, 20.0, 30.0, 1)],
                    )
                    .unwrap()
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_failed_store_fails_only_its_task() {
        let pipeline = Pipeline::new(ScriptedEngine::converging(), &config()).unwrap();
        let risk = TaskInput::new(TaskKind::RiskAmbiguity, Vec::new());
        let report = pipeline
            .run(vec![discounting(&["S1", "S2"]), risk], |task| match task {
                TaskKind::Discounting => Ok(MemoryFitStore::new(task)),
                TaskKind::RiskAmbiguity => Err(Error::StoreCorrupted {
                    task: task.to_string(),
                    reason: "test".to_string(),
                }),
            })
            .await
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].task, TaskKind::RiskAmbiguity);
        assert_eq!(report.task(TaskKind::Discounting).unwrap().converged, 2);
        assert_eq!(report.table.len(), 2);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_duplicate_task_rejected() {
        let pipeline = Pipeline::new(ScriptedEngine::converging(), &config()).unwrap();
        let result = pipeline
            .run(vec![discounting(&["S1"]), discounting(&["S2"])], |task| {
                Ok(MemoryFitStore::new(task))
            })
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
