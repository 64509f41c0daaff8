//! Job scheduler
//!
//! Fans the convergence runner out over many sessions with a fixed worker
//! bound. Each session runs to a terminal state on tokio's blocking pool
//! while holding one semaphore permit; workers hand their `FitResult` back by
//! value and only the scheduler touches the result map and the store.
//!
//! Before dispatching, every session is looked up in the store; a unit that
//! already has a result is reused and never reaches the engine. Re-running
//! over a fully populated store therefore makes zero engine calls.
//!
//! Finished sessions are drained while the scheduler waits for a free worker,
//! and each result is put and flushed as it arrives.
//!
//! Cancellation is coarse: [`JobScheduler::stop`] prevents sessions that have
//! not started yet from starting. A running session always finishes.

use crate::config::PipelineConfig;
use crate::runner::{AttemptEvent, ConvergenceRunner, FitResult};
use crate::sampler::SamplingEngine;
use crate::session::{Session, SessionKey};
use crate::store::FitStore;
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use rustc_hash::FxHashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, info};

/// Callback invoked for every sampling attempt of every session.
pub type AttemptObserver = dyn Fn(&AttemptEvent<'_>) + Send + Sync;

/// Runner result and the completed count at the time it finished.
type JobOutput = (std::result::Result<FitResult, JoinError>, usize);

/// Completed-session counter, shareable with a progress reporter.
#[derive(Debug, Default)]
pub struct Progress {
    total: AtomicUsize,
    completed: AtomicUsize,
}

impl Progress {
    /// Sessions in the current run.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Sessions that reached a terminal state (reused ones included).
    ///
    /// Never decreases during a run.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    fn begin(&self, total: usize) {
        self.completed.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    fn complete_one(&self) -> usize {
        self.completed.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// What one scheduler run produced.
#[derive(Debug, Default)]
pub struct ScheduleOutcome {
    /// Results by session, reused and freshly computed
    pub results: BTreeMap<SessionKey, FitResult>,
    /// Sessions answered from the store
    pub reused: usize,
    /// Sessions run through the engine
    pub computed: usize,
    /// Sessions not started because the scheduler was stopped
    pub cancelled: Vec<SessionKey>,
    /// Sessions whose worker died before producing a result
    pub failed: Vec<SessionKey>,
}

impl ScheduleOutcome {
    /// Number of results that converged.
    #[must_use]
    pub fn converged(&self) -> usize {
        self.results.values().filter(|r| r.converged()).count()
    }

    /// Number of results that exhausted the attempt budget.
    #[must_use]
    pub fn exhausted(&self) -> usize {
        self.results.len() - self.converged()
    }
}

/// Bounded-concurrency scheduler over a [`ConvergenceRunner`].
pub struct JobScheduler<E> {
    runner: Arc<ConvergenceRunner<E>>,
    concurrency: usize,
    progress: Arc<Progress>,
    stopped: Arc<AtomicBool>,
    observer: Option<Arc<AttemptObserver>>,
}

impl<E> std::fmt::Debug for JobScheduler<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("concurrency", &self.concurrency)
            .field("progress", &self.progress)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl<E: SamplingEngine> JobScheduler<E> {
    /// Scheduler running at most `concurrency` sessions at once (minimum 1).
    #[must_use]
    pub fn new(runner: ConvergenceRunner<E>, concurrency: usize) -> Self {
        Self {
            runner: Arc::new(runner),
            concurrency: concurrency.max(1),
            progress: Arc::new(Progress::default()),
            stopped: Arc::new(AtomicBool::new(false)),
            observer: None,
        }
    }

    /// Scheduler built from pipeline settings.
    #[must_use]
    pub fn from_config(engine: E, config: &PipelineConfig) -> Self {
        Self::new(
            ConvergenceRunner::new(engine, config.sampler, config.retry, config.seed),
            config.concurrency,
        )
    }

    /// Report every sampling attempt to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<AttemptObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The runner used for each session.
    #[must_use]
    pub fn runner(&self) -> &ConvergenceRunner<E> {
        &self.runner
    }

    /// Worker bound.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Shared progress counter.
    #[must_use]
    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    /// Flag that stops the scheduler when set; can be moved into a signal handler.
    #[must_use]
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }

    /// Stop starting new sessions. Running sessions finish normally.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Whether [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Fit every session not already in `store`.
    ///
    /// Each fresh result is written and flushed as soon as its session
    /// finishes, so an interrupted run keeps everything completed so far.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateSession`] if a key appears twice,
    /// [`Error::InvalidInput`] if a session belongs to another task than the
    /// store, or a store error. Sessions that fail to converge are results,
    /// not errors.
    pub async fn run<S: FitStore>(&self, sessions: Vec<Session>, store: &S) -> Result<ScheduleOutcome> {
        let mut seen = BTreeSet::new();
        for session in &sessions {
            if session.task() != store.task() {
                return Err(Error::InvalidInput(format!(
                    "session {} cannot be scheduled against the {} store",
                    session.key(),
                    store.task()
                )));
            }
            if !seen.insert(session.key().clone()) {
                return Err(Error::DuplicateSession(session.key().clone()));
            }
        }

        let total = sessions.len();
        self.progress.begin(total);
        let mut outcome = ScheduleOutcome::default();

        let mut pending = Vec::with_capacity(total);
        for session in sessions {
            if let Some(existing) = store.get(&session.key().unit()).await? {
                debug!(session = %session.key(), "reusing stored result");
                self.progress.complete_one();
                outcome.reused += 1;
                outcome.results.insert(session.key().clone(), existing);
            } else {
                pending.push(session);
            }
        }
        info!(
            task = %store.task(),
            total,
            reused = outcome.reused,
            pending = pending.len(),
            concurrency = self.concurrency,
            "scheduling sessions"
        );

        let dispatched = self.dispatch(pending, store, &mut outcome).await;
        // Whatever finished before an error is still written out
        let flushed = store.flush().await;
        dispatched?;
        flushed?;

        outcome.cancelled.sort();
        outcome.failed.sort();
        if !outcome.cancelled.is_empty() {
            info!(cancelled = outcome.cancelled.len(), "scheduler stopped early");
        }
        Ok(outcome)
    }

    /// Start sessions as permits free up, storing each result as it arrives.
    async fn dispatch<S: FitStore>(
        &self,
        pending: Vec<Session>,
        store: &S,
        outcome: &mut ScheduleOutcome,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut jobs = JoinSet::new();
        let mut in_flight: FxHashMap<Id, SessionKey> = FxHashMap::default();
        let mut queue = pending.into_iter();
        let mut next = queue.next();

        while let Some(session) = next.take() {
            if self.is_stopped() {
                outcome.cancelled.push(session.key().clone());
                next = queue.next();
                continue;
            }
            tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    let permit = permit
                        .map_err(|e| Error::StorageError(format!("worker pool closed: {e}")))?;
                    // Stop may have been requested while waiting for a worker
                    if self.is_stopped() {
                        outcome.cancelled.push(session.key().clone());
                    } else {
                        let key = session.key().clone();
                        let handle = jobs.spawn(run_job(
                            Arc::clone(&self.runner),
                            Arc::clone(&self.progress),
                            self.observer.clone(),
                            session,
                            permit,
                        ));
                        in_flight.insert(handle.id(), key);
                    }
                    next = queue.next();
                }
                Some(joined) = jobs.join_next_with_id(), if !jobs.is_empty() => {
                    self.record(joined, &mut in_flight, store, outcome).await?;
                    next = Some(session);
                }
            }
        }

        while let Some(joined) = jobs.join_next_with_id().await {
            self.record(joined, &mut in_flight, store, outcome).await?;
        }
        Ok(())
    }

    async fn record<S: FitStore>(
        &self,
        joined: std::result::Result<(Id, JobOutput), JoinError>,
        in_flight: &mut FxHashMap<Id, SessionKey>,
        store: &S,
        outcome: &mut ScheduleOutcome,
    ) -> Result<()> {
        let (id, output) = match joined {
            Ok((id, output)) => (id, Ok(output)),
            Err(e) => (e.id(), Err(e)),
        };
        let Some(key) = in_flight.remove(&id) else {
            error!(task_id = %id, "finished job has no session");
            return Ok(());
        };

        match output {
            Ok((Ok(result), completed)) => {
                info!(
                    session = %key,
                    converged = result.converged(),
                    attempts = result.attempts(),
                    completed,
                    total = self.progress.total(),
                    "session finished"
                );
                if store.put_if_absent(result.clone()).await? {
                    store.flush().await?;
                } else {
                    debug!(session = %key, "store already held a result");
                }
                outcome.computed += 1;
                outcome.results.insert(key, result);
            }
            Ok((Err(e), _)) | Err(e) => {
                error!(session = %key, error = %e, "session worker failed");
                outcome.failed.push(key);
            }
        }
        Ok(())
    }
}

/// Run one session on the blocking pool while holding `permit`.
async fn run_job<E: SamplingEngine>(
    runner: Arc<ConvergenceRunner<E>>,
    progress: Arc<Progress>,
    observer: Option<Arc<AttemptObserver>>,
    session: Session,
    permit: OwnedSemaphorePermit,
) -> JobOutput {
    let _permit = permit;
    let result = tokio::task::spawn_blocking(move || match observer {
        Some(observer) => runner.run_observed(&session, |event| observer(event)),
        None => runner.run(&session),
    })
    .await;
    let completed = progress.complete_one();
    (result, completed)
}
