//! In-memory result store using `DashMap`.
//!
//! Results are lost on process restart. Also the working set behind
//! [`ParquetFitStore`](super::ParquetFitStore).

use super::{check_task, FitStore};
use crate::runner::FitResult;
use crate::session::{TaskKind, UnitKey};
use crate::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Volatile store backed by a concurrent hashmap.
#[derive(Debug)]
pub struct MemoryFitStore {
    task: TaskKind,
    results: DashMap<UnitKey, FitResult>,
}

impl MemoryFitStore {
    /// Create an empty store for a task.
    #[must_use]
    pub fn new(task: TaskKind) -> Self {
        Self {
            task,
            results: DashMap::new(),
        }
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub(crate) fn count(&self) -> usize {
        self.results.len()
    }

    pub(crate) fn insert_if_absent(&self, result: FitResult) -> Result<bool> {
        check_task(self.task, &result)?;
        match self.results.entry(result.unit()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(result);
                Ok(true)
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<FitResult> {
        let mut all: Vec<FitResult> = self.results.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.key().cmp(b.key()));
        all
    }
}

impl FitStore for MemoryFitStore {
    fn task(&self) -> TaskKind {
        self.task
    }

    async fn get(&self, unit: &UnitKey) -> Result<Option<FitResult>> {
        Ok(self.results.get(unit).map(|r| r.value().clone()))
    }

    async fn put_if_absent(&self, result: FitResult) -> Result<bool> {
        self.insert_if_absent(result)
    }

    async fn load_all(&self) -> Result<Vec<FitResult>> {
        Ok(self.snapshot())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.results.len())
    }
}
