//! Parquet-backed result store
//!
//! One file per task (`{dir}/{task}.parquet`). The file is read completely
//! when the store is opened; results accumulate in memory and [`flush`]
//! rewrites the whole table to a temporary file that is renamed over the old
//! one, so a crash mid-write never leaves a partially written store behind.
//!
//! A file that fails to decode makes [`ParquetFitStore::open`] fail with
//! [`Error::StoreCorrupted`]. There is no partial recovery: the caller either
//! aborts the task or starts over with [`ParquetFitStore::reset`].
//!
//! [`flush`]: FitStore::flush

use super::{codec, FitStore, MemoryFitStore};
use crate::runner::FitResult;
use crate::session::{TaskKind, UnitKey};
use crate::{Error, Result};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Persistent store for one task.
#[derive(Debug)]
pub struct ParquetFitStore {
    path: PathBuf,
    results: MemoryFitStore,
    dirty: AtomicBool,
}

impl ParquetFitStore {
    /// File name used for a task's store inside a directory.
    #[must_use]
    pub fn file_name(task: TaskKind) -> String {
        format!("{}.parquet", task.as_str())
    }

    /// Open (or create) the store for `task` under `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreCorrupted`] if an existing file cannot be decoded,
    /// or an IO error if the directory cannot be created.
    pub fn open<P: AsRef<Path>>(dir: P, task: TaskKind) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(Self::file_name(task));
        let results = MemoryFitStore::new(task);

        if path.exists() {
            let decoded = read_results(&path, task).map_err(|reason| {
                warn!(task = %task, path = %path.display(), reason = %reason, "result store is corrupted");
                Error::StoreCorrupted {
                    task: task.to_string(),
                    reason,
                }
            })?;
            for result in decoded {
                results.insert_if_absent(result)?;
            }
            info!(task = %task, results = results.count(), "opened result store");
        } else {
            debug!(task = %task, path = %path.display(), "no result store yet");
        }

        Ok(Self {
            path,
            results,
            dirty: AtomicBool::new(false),
        })
    }

    /// Delete any existing file for `task` under `dir` and open an empty store.
    ///
    /// # Errors
    ///
    /// Returns error if the old file cannot be removed.
    pub fn reset<P: AsRef<Path>>(dir: P, task: TaskKind) -> Result<Self> {
        let path = dir.as_ref().join(Self::file_name(task));
        if path.exists() {
            std::fs::remove_file(&path)?;
            warn!(task = %task, path = %path.display(), "result store reset");
        }
        Self::open(dir, task)
    }

    /// Location of the store file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_results(path: &Path, task: TaskKind) -> std::result::Result<Vec<FitResult>, String> {
    let file = File::open(path).map_err(|e| format!("cannot open {}: {e}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .and_then(|builder| builder.build())
        .map_err(|e| format!("not a readable Parquet file: {e}"))?;
    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("failed to read record batch: {e}"))?;
    codec::decode(task, &batches)
}

fn write_results(path: &Path, task: TaskKind, results: &[FitResult]) -> Result<()> {
    let batch = codec::encode(task, results)?;
    let tmp = path.with_extension("parquet.tmp");
    {
        let file = File::create(&tmp)?;
        let mut writer = ArrowWriter::try_new(&file, batch.schema(), None)?;
        writer.write(&batch)?;
        writer.close()?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl FitStore for ParquetFitStore {
    fn task(&self) -> TaskKind {
        self.results.task()
    }

    async fn get(&self, unit: &UnitKey) -> Result<Option<FitResult>> {
        self.results.get(unit).await
    }

    async fn put_if_absent(&self, result: FitResult) -> Result<bool> {
        let written = self.results.insert_if_absent(result)?;
        if written {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(written)
    }

    async fn load_all(&self) -> Result<Vec<FitResult>> {
        Ok(self.results.snapshot())
    }

    async fn len(&self) -> Result<usize> {
        self.results.len().await
    }

    async fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let path = self.path.clone();
        let task = self.results.task();
        let snapshot = self.results.snapshot();
        let count = snapshot.len();

        let written = tokio::task::spawn_blocking(move || write_results(&path, task, &snapshot))
            .await
            .map_err(|e| Error::StorageError(format!("flush task failed: {e}")))?;
        if let Err(error) = written {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(error);
        }
        debug!(task = %task, results = count, path = %self.path.display(), "result store flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionKey;

    fn result(subject: &str) -> FitResult {
        FitResult::new(
            SessionKey::new(subject, 1, TaskKind::Discounting),
            None,
            5,
            false,
        )
    }

    #[tokio::test]
    async fn test_flush_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetFitStore::open(dir.path(), TaskKind::Discounting).unwrap();
        store.put_if_absent(result("S1")).await.unwrap();
        store.put_if_absent(result("S2")).await.unwrap();
        store.flush().await.unwrap();
        assert!(store.path().exists());
        assert!(!store.path().with_extension("parquet.tmp").exists());

        let reopened = ParquetFitStore::open(dir.path(), TaskKind::Discounting).unwrap();
        assert_eq!(reopened.len().await.unwrap(), 2);
        assert_eq!(
            reopened.load_all().await.unwrap(),
            store.load_all().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_unflushed_writes_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetFitStore::open(dir.path(), TaskKind::Discounting).unwrap();
        store.put_if_absent(result("S1")).await.unwrap();
        drop(store);

        let reopened = ParquetFitStore::open(dir.path(), TaskKind::Discounting).unwrap();
        assert_eq!(reopened.len().await.unwrap(), 0);
    }

    #[test]
    fn test_garbage_file_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(ParquetFitStore::file_name(TaskKind::Discounting)),
            b"definitely not parquet",
        )
        .unwrap();

        let err = ParquetFitStore::open(dir.path(), TaskKind::Discounting).unwrap_err();
        assert!(matches!(err, Error::StoreCorrupted { .. }));

        let fresh = ParquetFitStore::reset(dir.path(), TaskKind::Discounting).unwrap();
        assert!(!fresh.path().exists());
    }
}
