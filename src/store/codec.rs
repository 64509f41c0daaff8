//! `FitResult` <-> Arrow `RecordBatch`
//!
//! One row per (subject, day). Per-parameter columns are named
//! `{param}_{statistic}` for every parameter of the task's model and are null
//! when no attempt succeeded. Decoding is strict: any missing column, type
//! mismatch, foreign task or duplicate unit is reported as an error string
//! that callers turn into [`Error::StoreCorrupted`](crate::Error::StoreCorrupted).

use crate::runner::{FitAttempt, FitResult};
use crate::sampler::{ParamSummary, PosteriorSummary};
use crate::session::{SessionKey, TaskKind};
use crate::Result;
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, UInt32Array, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::DateTime;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Per-parameter statistics stored for each model parameter, in column order.
pub const STATISTICS: [&str; 5] = ["mean", "sd", "q025", "q975", "rhat"];

/// Column holding the subject identifier.
pub const SUBJECT: &str = "subject";
/// Column holding the session day.
pub const DAY: &str = "day";
/// Column holding the task identifier.
pub const TASK: &str = "task";
/// Attempts used.
pub const ATTEMPTS: &str = "attempts";
/// Converged flag.
pub const CONVERGED: &str = "converged";
/// Index of the retained attempt (null if none succeeded).
pub const BEST_ATTEMPT: &str = "best_attempt";
/// Seed of the retained attempt.
pub const SEED: &str = "seed";
/// Diagnostic of the retained attempt.
pub const DIAGNOSTIC: &str = "diagnostic";
/// Completion time, milliseconds since the Unix epoch.
pub const FITTED_AT_MS: &str = "fitted_at_ms";

/// Column name for one statistic of one parameter.
#[must_use]
pub fn param_column(param: &str, statistic: &str) -> String {
    format!("{param}_{statistic}")
}

/// Store schema for a task.
#[must_use]
pub fn schema(task: TaskKind) -> SchemaRef {
    let mut fields = vec![
        Field::new(SUBJECT, DataType::Utf8, false),
        Field::new(DAY, DataType::UInt32, false),
        Field::new(TASK, DataType::Utf8, false),
        Field::new(ATTEMPTS, DataType::UInt32, false),
        Field::new(CONVERGED, DataType::Boolean, false),
        Field::new(BEST_ATTEMPT, DataType::UInt32, true),
        Field::new(SEED, DataType::UInt64, true),
        Field::new(DIAGNOSTIC, DataType::Float64, true),
        Field::new(FITTED_AT_MS, DataType::Int64, false),
    ];
    for param in task.model().params {
        for statistic in STATISTICS {
            fields.push(Field::new(
                param_column(param.name, statistic),
                DataType::Float64,
                true,
            ));
        }
    }
    Arc::new(Schema::new(fields))
}

/// Encode results (all of one task) into a single batch.
///
/// # Errors
///
/// Returns error if a result belongs to another task or Arrow rejects the batch.
pub fn encode(task: TaskKind, results: &[FitResult]) -> Result<RecordBatch> {
    if let Some(foreign) = results.iter().find(|r| r.key().task != task) {
        return Err(crate::Error::InvalidInput(format!(
            "cannot encode {} into the {task} store",
            foreign.key()
        )));
    }

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(
            results.iter().map(|r| r.key().subject.as_str()),
        )),
        Arc::new(UInt32Array::from_iter_values(
            results.iter().map(|r| r.key().day),
        )),
        Arc::new(StringArray::from_iter_values(
            results.iter().map(|_| task.as_str()),
        )),
        Arc::new(UInt32Array::from_iter_values(
            results.iter().map(FitResult::attempts),
        )),
        Arc::new(BooleanArray::from(
            results.iter().map(FitResult::converged).collect::<Vec<_>>(),
        )),
        Arc::new(UInt32Array::from(
            results
                .iter()
                .map(|r| r.best().map(|b| b.attempt))
                .collect::<Vec<_>>(),
        )),
        Arc::new(UInt64Array::from(
            results
                .iter()
                .map(|r| r.best().map(|b| b.seed))
                .collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            results
                .iter()
                .map(FitResult::diagnostic)
                .collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from_iter_values(
            results.iter().map(|r| r.fitted_at().timestamp_millis()),
        )),
    ];

    for param in task.model().params {
        for statistic in STATISTICS {
            let values: Vec<Option<f64>> = results
                .iter()
                .map(|r| r.estimate(param.name).map(|s| statistic_value(s, statistic)))
                .collect();
            columns.push(Arc::new(Float64Array::from(values)));
        }
    }

    Ok(RecordBatch::try_new(schema(task), columns)?)
}

fn statistic_value(summary: &ParamSummary, statistic: &str) -> f64 {
    match statistic {
        "mean" => summary.mean,
        "sd" => summary.sd,
        "q025" => summary.q025,
        "q975" => summary.q975,
        _ => summary.rhat,
    }
}

/// Decode batches written by [`encode`].
///
/// # Errors
///
/// Returns a description of the first inconsistency found.
pub fn decode(task: TaskKind, batches: &[RecordBatch]) -> std::result::Result<Vec<FitResult>, String> {
    let mut results = Vec::new();
    let mut seen = BTreeSet::new();
    for batch in batches {
        for result in decode_batch(task, batch)? {
            if !seen.insert(result.unit()) {
                return Err(format!("duplicate entry for {}", result.unit()));
            }
            results.push(result);
        }
    }
    Ok(results)
}

fn decode_batch(task: TaskKind, batch: &RecordBatch) -> std::result::Result<Vec<FitResult>, String> {
    let subject = typed::<StringArray>(batch, SUBJECT)?;
    let day = typed::<UInt32Array>(batch, DAY)?;
    let task_column = typed::<StringArray>(batch, TASK)?;
    let attempts = typed::<UInt32Array>(batch, ATTEMPTS)?;
    let converged = typed::<BooleanArray>(batch, CONVERGED)?;
    let best_attempt = typed::<UInt32Array>(batch, BEST_ATTEMPT)?;
    let seed = typed::<UInt64Array>(batch, SEED)?;
    let diagnostic = typed::<Float64Array>(batch, DIAGNOSTIC)?;
    let fitted_at = typed::<Int64Array>(batch, FITTED_AT_MS)?;

    let params = task.model().params;
    let mut stats: Vec<[&Float64Array; 5]> = Vec::with_capacity(params.len());
    for param in params {
        let mut columns = Vec::with_capacity(STATISTICS.len());
        for statistic in STATISTICS {
            columns.push(typed::<Float64Array>(batch, &param_column(param.name, statistic))?);
        }
        let columns: [&Float64Array; 5] = columns
            .try_into()
            .map_err(|_| "statistic column count mismatch".to_string())?;
        stats.push(columns);
    }

    for required in [subject.null_count(), day.null_count(), task_column.null_count()] {
        if required > 0 {
            return Err("null key column".to_string());
        }
    }

    let mut results = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        if task_column.value(row) != task.as_str() {
            return Err(format!(
                "row {row} belongs to task '{}'",
                task_column.value(row)
            ));
        }
        if attempts.is_null(row) || converged.is_null(row) || fitted_at.is_null(row) {
            return Err(format!("row {row}: missing bookkeeping field"));
        }
        let key = SessionKey::new(subject.value(row), day.value(row), task);

        let best = if best_attempt.is_null(row) {
            None
        } else {
            if seed.is_null(row) || diagnostic.is_null(row) {
                return Err(format!("row {row}: attempt without seed or diagnostic"));
            }
            let mut summaries = Vec::with_capacity(params.len());
            for (param, columns) in params.iter().zip(&stats) {
                if columns.iter().any(|c| c.is_null(row)) {
                    return Err(format!("row {row}: missing statistics for '{}'", param.name));
                }
                summaries.push(ParamSummary {
                    name: param.name.to_string(),
                    mean: columns[0].value(row),
                    sd: columns[1].value(row),
                    q025: columns[2].value(row),
                    q975: columns[3].value(row),
                    rhat: columns[4].value(row),
                });
            }
            Some(FitAttempt {
                attempt: best_attempt.value(row),
                seed: seed.value(row),
                diagnostic: diagnostic.value(row),
                summary: PosteriorSummary { params: summaries },
            })
        };

        if converged.value(row) && best.is_none() {
            return Err(format!("row {row}: converged without a retained attempt"));
        }

        let fitted = DateTime::from_timestamp_millis(fitted_at.value(row))
            .ok_or_else(|| format!("row {row}: timestamp out of range"))?;
        results.push(
            FitResult::new(key, best, attempts.value(row), converged.value(row))
                .with_fitted_at(fitted),
        );
    }
    Ok(results)
}

fn typed<'a, T: Array + 'static>(
    batch: &'a RecordBatch,
    name: &str,
) -> std::result::Result<&'a T, String> {
    batch
        .column_by_name(name)
        .ok_or_else(|| format!("missing column '{name}'"))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| format!("column '{name}' has unexpected type"))
}
