//! Persisted result store tests
//!
//! Round trips through real Parquet files in a temp directory, corruption
//! detection, and the write-once contract.

mod common;

use arrow::array::Int32Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use choicefit::runner::FitResult;
use choicefit::session::{SessionKey, TaskKind, UnitKey};
use choicefit::store::{codec, FitStore, ParquetFitStore};
use choicefit::Error;
use common::fit_with_width;
use parquet::arrow::ArrowWriter;
use pretty_assertions::assert_eq;
use std::fs::File;
use std::sync::Arc;

fn mixed_results(task: TaskKind) -> Vec<FitResult> {
    let mut exhausted = fit_with_width("S02", 1, task, 0.5, 0.8);
    exhausted = FitResult::new(
        exhausted.key().clone(),
        exhausted.best().cloned(),
        100,
        false,
    );
    vec![
        fit_with_width("S01", 1, task, 0.3, 0.4),
        exhausted,
        FitResult::new(SessionKey::new("S03", 2, task), None, 100, false),
    ]
}

#[tokio::test]
async fn test_parquet_round_trip_preserves_results() {
    let dir = tempfile::tempdir().unwrap();
    let results = mixed_results(TaskKind::RiskAmbiguity);

    let store = ParquetFitStore::open(dir.path(), TaskKind::RiskAmbiguity).unwrap();
    for result in &results {
        assert!(store.put_if_absent(result.clone()).await.unwrap());
    }
    store.flush().await.unwrap();
    assert!(dir.path().join("risk_ambiguity.parquet").exists());
    drop(store);

    let reopened = ParquetFitStore::open(dir.path(), TaskKind::RiskAmbiguity).unwrap();
    assert_eq!(reopened.load_all().await.unwrap(), results);
    let missing = reopened.get(&UnitKey::new("S03", 2)).await.unwrap().unwrap();
    assert!(missing.best().is_none());
    assert!(!missing.converged());
}

#[tokio::test]
async fn test_reopened_store_never_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let original = fit_with_width("S01", 1, TaskKind::Discounting, -4.0, 1.0);

    let store = ParquetFitStore::open(dir.path(), TaskKind::Discounting).unwrap();
    store.put_if_absent(original.clone()).await.unwrap();
    store.flush().await.unwrap();
    drop(store);

    let reopened = ParquetFitStore::open(dir.path(), TaskKind::Discounting).unwrap();
    let replacement = fit_with_width("S01", 1, TaskKind::Discounting, -1.0, 3.0);
    assert!(!reopened.put_if_absent(replacement).await.unwrap());
    assert_eq!(
        reopened.get(&UnitKey::new("S01", 1)).await.unwrap(),
        Some(original)
    );
}

#[tokio::test]
async fn test_tasks_are_stored_separately() {
    let dir = tempfile::tempdir().unwrap();
    let discounting = ParquetFitStore::open(dir.path(), TaskKind::Discounting).unwrap();
    let risk = ParquetFitStore::open(dir.path(), TaskKind::RiskAmbiguity).unwrap();

    discounting
        .put_if_absent(fit_with_width("S01", 1, TaskKind::Discounting, -4.0, 1.0))
        .await
        .unwrap();
    discounting.flush().await.unwrap();
    risk.flush().await.unwrap();

    assert_eq!(discounting.len().await.unwrap(), 1);
    assert_eq!(risk.len().await.unwrap(), 0);
    assert!(risk
        .put_if_absent(fit_with_width("S01", 1, TaskKind::Discounting, -4.0, 1.0))
        .await
        .is_err());
}

#[test]
fn test_garbage_file_is_corrupted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(ParquetFitStore::file_name(TaskKind::Discounting));
    std::fs::write(&path, b"PAR1 this is not a parquet file").unwrap();

    let err = ParquetFitStore::open(dir.path(), TaskKind::Discounting).unwrap_err();
    assert!(matches!(err, Error::StoreCorrupted { ref task, .. } if task == "discounting"));
}

#[test]
fn test_foreign_schema_is_corrupted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(ParquetFitStore::file_name(TaskKind::RiskAmbiguity));
    let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int32, false)]));
    let batch = RecordBatch::try_new(
        Arc::clone(&schema),
        vec![Arc::new(Int32Array::from(vec![1, 2, 3]))],
    )
    .unwrap();
    let mut writer = ArrowWriter::try_new(File::create(&path).unwrap(), schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();

    let err = ParquetFitStore::open(dir.path(), TaskKind::RiskAmbiguity).unwrap_err();
    match err {
        Error::StoreCorrupted { reason, .. } => assert!(reason.contains("subject"), "{reason}"),
        other => panic!("expected StoreCorrupted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_other_task_file_is_corrupted() {
    let dir = tempfile::tempdir().unwrap();
    let store = ParquetFitStore::open(dir.path(), TaskKind::Discounting).unwrap();
    store
        .put_if_absent(fit_with_width("S01", 1, TaskKind::Discounting, -4.0, 1.0))
        .await
        .unwrap();
    store.flush().await.unwrap();

    // A discounting table sitting where the risk store belongs
    std::fs::rename(
        dir.path().join("discounting.parquet"),
        dir.path().join("risk_ambiguity.parquet"),
    )
    .unwrap();
    assert!(matches!(
        ParquetFitStore::open(dir.path(), TaskKind::RiskAmbiguity),
        Err(Error::StoreCorrupted { .. })
    ));
}

#[tokio::test]
async fn test_reset_starts_over() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(ParquetFitStore::file_name(TaskKind::Discounting));
    std::fs::write(&path, b"garbage").unwrap();

    let store = ParquetFitStore::reset(dir.path(), TaskKind::Discounting).unwrap();
    assert_eq!(store.len().await.unwrap(), 0);
    assert!(!path.exists());

    store
        .put_if_absent(fit_with_width("S01", 1, TaskKind::Discounting, -4.0, 1.0))
        .await
        .unwrap();
    store.flush().await.unwrap();
    let reopened = ParquetFitStore::open(dir.path(), TaskKind::Discounting).unwrap();
    assert_eq!(reopened.len().await.unwrap(), 1);
}

#[test]
fn test_encoded_batch_has_one_row_per_result() {
    let results = mixed_results(TaskKind::Discounting);
    let batch = codec::encode(TaskKind::Discounting, &results).unwrap();
    assert_eq!(batch.num_rows(), 3);
    assert_eq!(batch.schema(), codec::schema(TaskKind::Discounting));
    assert!(batch
        .schema()
        .field_with_name(&codec::param_column("log_discount_rate", "rhat"))
        .is_ok());
}
