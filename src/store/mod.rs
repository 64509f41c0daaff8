//! Persisted per-task result store
//!
//! One store per task, keyed by (subject, day). The store is both the
//! terminal per-task artifact and the resumability cache: the scheduler
//! checks it before dispatching a session and skips any unit that already has
//! a result.
//!
//! Writes are idempotent: [`FitStore::put_if_absent`] never overwrites an
//! existing key, so concurrent or repeated runs cannot write the same key
//! twice.
//!
//! # Example
//!
//! ```rust,no_run
//! use choicefit::store::{FitStore, MemoryFitStore};
//! use choicefit::runner::FitResult;
//! use choicefit::session::{SessionKey, TaskKind};
//!
//! # async fn example() -> choicefit::Result<()> {
//! let store = MemoryFitStore::new(TaskKind::Discounting);
//! let result = FitResult::new(SessionKey::new("S01", 1, TaskKind::Discounting), None, 3, false);
//!
//! assert!(store.put_if_absent(result.clone()).await?);
//! assert!(!store.put_if_absent(result).await?);
//! assert_eq!(store.len().await?, 1);
//! # Ok(())
//! # }
//! ```

pub mod codec;
mod memory;
mod parquet_store;

pub use memory::MemoryFitStore;
pub use parquet_store::ParquetFitStore;

use crate::runner::FitResult;
use crate::session::{TaskKind, UnitKey};
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;

/// Key-addressed store of [`FitResult`]s for one task.
pub trait FitStore: Send + Sync {
    /// Task whose results this store holds.
    fn task(&self) -> TaskKind;

    /// Result for a unit, if present.
    fn get(&self, unit: &UnitKey) -> impl Future<Output = Result<Option<FitResult>>> + Send;

    /// Whether a result exists for the unit.
    fn contains(&self, unit: &UnitKey) -> impl Future<Output = Result<bool>> + Send {
        async move { Ok(self.get(unit).await?.is_some()) }
    }

    /// Insert a result unless its unit is already present.
    ///
    /// Returns `true` if the result was written, `false` if an existing
    /// result was kept.
    fn put_if_absent(&self, result: FitResult) -> impl Future<Output = Result<bool>> + Send;

    /// All results, ordered by unit.
    fn load_all(&self) -> impl Future<Output = Result<Vec<FitResult>>> + Send;

    /// Number of stored results.
    fn len(&self) -> impl Future<Output = Result<usize>> + Send;

    /// Persist pending writes. No-op for volatile stores.
    fn flush(&self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

impl<S: FitStore> FitStore for Arc<S> {
    fn task(&self) -> TaskKind {
        (**self).task()
    }

    fn get(&self, unit: &UnitKey) -> impl Future<Output = Result<Option<FitResult>>> + Send {
        (**self).get(unit)
    }

    fn put_if_absent(&self, result: FitResult) -> impl Future<Output = Result<bool>> + Send {
        (**self).put_if_absent(result)
    }

    fn load_all(&self) -> impl Future<Output = Result<Vec<FitResult>>> + Send {
        (**self).load_all()
    }

    fn len(&self) -> impl Future<Output = Result<usize>> + Send {
        (**self).len()
    }

    fn flush(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).flush()
    }
}

fn check_task(store_task: TaskKind, result: &FitResult) -> Result<()> {
    if result.key().task == store_task {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "result for {} cannot be stored in the {store_task} store",
            result.key()
        )))
    }
}
