//! Session tables (Arrow/Parquet)
//!
//! Input tables hold one row per trial. Rows are grouped by (subject, day)
//! into sessions and ordered by the `trial` column. Numeric columns may use
//! any integer or floating type; they are cast on load.

use super::{Session, SessionKey, TaskKind, Trial};
use crate::{Error, Result};
use arrow::array::{Array, Float64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Column names of the input session tables.
pub mod columns {
    /// Subject identifier (Utf8)
    pub const SUBJECT: &str = "subject";
    /// Session day (integer)
    pub const DAY: &str = "day";
    /// Trial index within the session (integer)
    pub const TRIAL: &str = "trial";
    /// Observed choice (integer, 0 or 1)
    pub const CHOICE: &str = "choice";

    /// Smaller-sooner amount
    pub const SS_AMOUNT: &str = "ss_amount";
    /// Smaller-sooner delay
    pub const SS_DELAY: &str = "ss_delay";
    /// Larger-later amount
    pub const LL_AMOUNT: &str = "ll_amount";
    /// Larger-later delay
    pub const LL_DELAY: &str = "ll_delay";

    /// Certain amount
    pub const FIXED_AMOUNT: &str = "fixed_amount";
    /// Lottery amount
    pub const VARIABLE_AMOUNT: &str = "variable_amount";
    /// Lottery win probability
    pub const PROBABILITY: &str = "probability";
    /// Ambiguity level
    pub const AMBIGUITY: &str = "ambiguity";
}

/// A session dropped at load time, with the reason.
#[derive(Debug)]
pub struct RejectedSession {
    /// Key of the rejected session
    pub key: SessionKey,
    /// Validation error
    pub error: Error,
}

/// Validated sessions for one task, plus the ones that failed validation.
#[derive(Debug)]
pub struct SessionTable {
    task: TaskKind,
    sessions: Vec<Session>,
    rejected: Vec<RejectedSession>,
}

type RawRows = BTreeMap<SessionKey, Vec<(i64, Trial)>>;

impl SessionTable {
    /// Group trial rows into sessions.
    ///
    /// Malformed sessions are rejected individually (logged and kept in
    /// [`rejected`](Self::rejected)); they never reach the scheduler.
    ///
    /// # Errors
    ///
    /// Returns error if a required column is missing, has an uncastable type,
    /// or contains nulls.
    pub fn from_batches(task: TaskKind, batches: &[RecordBatch]) -> Result<Self> {
        let mut raw: RawRows = BTreeMap::new();
        for batch in batches {
            collect_rows(task, batch, &mut raw)?;
        }

        let mut sessions = Vec::with_capacity(raw.len());
        let mut rejected = Vec::new();
        for (key, mut rows) in raw {
            rows.sort_by_key(|(index, _)| *index);
            let trials = rows.into_iter().map(|(_, trial)| trial).collect();
            match Session::new(key.clone(), trials) {
                Ok(session) => sessions.push(session),
                Err(error) => {
                    warn!(session = %key, error = %error, "rejecting malformed session");
                    rejected.push(RejectedSession { key, error });
                }
            }
        }

        info!(
            task = %task,
            sessions = sessions.len(),
            rejected = rejected.len(),
            "loaded session table"
        );
        Ok(Self {
            task,
            sessions,
            rejected,
        })
    }

    /// Load a session table from a Parquet file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or does not have the expected columns.
    pub fn load_parquet<P: AsRef<Path>>(path: P, task: TaskKind) -> Result<Self> {
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
        use std::fs::File;

        let file = File::open(path.as_ref()).map_err(|e| {
            Error::StorageError(format!(
                "Failed to open session table {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
        Self::from_batches(task, &batches)
    }

    /// Task of every session in the table.
    #[must_use]
    pub const fn task(&self) -> TaskKind {
        self.task
    }

    /// Sessions that passed validation, ordered by (subject, day).
    #[must_use]
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// Sessions rejected at load time.
    #[must_use]
    pub fn rejected(&self) -> &[RejectedSession] {
        &self.rejected
    }

    /// Consume the table, returning the valid sessions.
    #[must_use]
    pub fn into_sessions(self) -> Vec<Session> {
        self.sessions
    }
}

fn collect_rows(task: TaskKind, batch: &RecordBatch, raw: &mut RawRows) -> Result<()> {
    let subject = string_column(batch, columns::SUBJECT)?;
    // Read as floats so that 1.5 is rejected rather than truncated to 1
    let day = float_column(batch, columns::DAY)?;
    let trial = float_column(batch, columns::TRIAL)?;
    let choice = float_column(batch, columns::CHOICE)?;
    let design: Vec<Float64Array> = match task {
        TaskKind::Discounting => [
            columns::SS_AMOUNT,
            columns::SS_DELAY,
            columns::LL_AMOUNT,
            columns::LL_DELAY,
        ],
        TaskKind::RiskAmbiguity => [
            columns::FIXED_AMOUNT,
            columns::VARIABLE_AMOUNT,
            columns::PROBABILITY,
            columns::AMBIGUITY,
        ],
    }
    .into_iter()
    .map(|name| float_column(batch, name))
    .collect::<Result<_>>()?;

    for row in 0..batch.num_rows() {
        let day_value = integral(day.value(row))
            .and_then(|d| u32::try_from(d).ok())
            .ok_or_else(|| {
                Error::InvalidInput(format!("row {row}: day {} is not a valid day", day.value(row)))
            })?;
        let trial_index = integral(trial.value(row)).ok_or_else(|| {
            Error::InvalidInput(format!(
                "row {row}: trial {} is not an integer",
                trial.value(row)
            ))
        })?;
        // Anything but 0 or 1 becomes an out-of-range code so session validation rejects it
        let choice_value = integral(choice.value(row))
            .and_then(|c| u8::try_from(c).ok())
            .unwrap_or(u8::MAX);
        let values = [
            design[0].value(row),
            design[1].value(row),
            design[2].value(row),
            design[3].value(row),
        ];
        let trial_value = match task {
            TaskKind::Discounting => {
                Trial::discounting(values[0], values[1], values[2], values[3], choice_value)
            }
            TaskKind::RiskAmbiguity => {
                Trial::risk_ambiguity(values[0], values[1], values[2], values[3], choice_value)
            }
        };
        let key = SessionKey::new(subject.value(row), day_value, task);
        raw.entry(key)
            .or_default()
            .push((trial_index, trial_value));
    }
    Ok(())
}

fn column_of<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a arrow::array::ArrayRef> {
    let index = batch
        .schema()
        .index_of(name)
        .map_err(|_| Error::InvalidInput(format!("session table is missing column '{name}'")))?;
    let column = batch.column(index);
    if column.null_count() > 0 {
        return Err(Error::InvalidInput(format!(
            "column '{name}' contains {} nulls",
            column.null_count()
        )));
    }
    Ok(column)
}

fn string_column(batch: &RecordBatch, name: &str) -> Result<StringArray> {
    let casted = cast(column_of(batch, name)?, &DataType::Utf8)?;
    casted
        .as_any()
        .downcast_ref::<StringArray>()
        .cloned()
        .ok_or_else(|| Error::InvalidInput(format!("column '{name}' is not a string column")))
}

/// Exact integer value of `value`, if it has one.
#[allow(clippy::cast_possible_truncation)]
fn integral(value: f64) -> Option<i64> {
    // 2^53: every integer up to here is exactly representable
    const EXACT: f64 = 9_007_199_254_740_992.0;
    (value.is_finite() && value.fract() == 0.0 && value.abs() <= EXACT).then_some(value as i64)
}

fn float_column(batch: &RecordBatch, name: &str) -> Result<Float64Array> {
    let casted = cast(column_of(batch, name)?, &DataType::Float64)?;
    casted
        .as_any()
        .downcast_ref::<Float64Array>()
        .cloned()
        .ok_or_else(|| Error::InvalidInput(format!("column '{name}' is not a numeric column")))
}
