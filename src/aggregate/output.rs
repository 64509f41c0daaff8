//! Arrow/Parquet output of estimate tables
//!
//! Every task contributes a block of columns prefixed with the task name:
//! `{task}_converged`, `{task}_attempts`, `{task}_diagnostic`, then for each
//! parameter `{task}_{param}` (posterior mean), `{task}_{natural}` for
//! log-scale parameters, and `_sd`, `_lower`, `_upper`, `_width`, `_width_z`.
//! Task columns are nullable so the outer join can leave them empty.

use super::{EstimateTable, TaskEstimateRow, TaskEstimates};
use crate::model::ParamScale;
use crate::session::{TaskKind, UnitKey};
use crate::Result;
use arrow::array::{ArrayRef, BooleanArray, Float64Array, StringArray, UInt32Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

#[derive(Default)]
struct Columns {
    fields: Vec<Field>,
    arrays: Vec<ArrayRef>,
}

impl Columns {
    fn push(&mut self, name: String, data_type: DataType, nullable: bool, array: ArrayRef) {
        self.fields.push(Field::new(name, data_type, nullable));
        self.arrays.push(array);
    }

    fn float<'a, F>(&mut self, name: String, rows: &[Option<&'a TaskEstimateRow>], value: F)
    where
        F: Fn(&'a TaskEstimateRow) -> Option<f64>,
    {
        let values: Float64Array = rows.iter().map(|r| r.and_then(&value)).collect();
        self.push(name, DataType::Float64, true, Arc::new(values));
    }

    fn finish(self) -> Result<RecordBatch> {
        Ok(RecordBatch::try_new(
            Arc::new(Schema::new(self.fields)),
            self.arrays,
        )?)
    }
}

fn unit_columns(columns: &mut Columns, units: &[&UnitKey]) {
    columns.push(
        "subject".to_string(),
        DataType::Utf8,
        false,
        Arc::new(StringArray::from_iter_values(
            units.iter().map(|u| u.subject.as_str()),
        )),
    );
    columns.push(
        "day".to_string(),
        DataType::UInt32,
        false,
        Arc::new(UInt32Array::from_iter_values(units.iter().map(|u| u.day))),
    );
}

fn task_columns(
    columns: &mut Columns,
    task: TaskKind,
    rows: &[Option<&TaskEstimateRow>],
    with_excluded: bool,
) {
    let prefix = task.as_str();

    let converged: BooleanArray = rows.iter().map(|r| r.map(|r| r.converged)).collect();
    columns.push(
        format!("{prefix}_converged"),
        DataType::Boolean,
        true,
        Arc::new(converged),
    );
    let attempts: UInt32Array = rows.iter().map(|r| r.map(|r| r.attempts)).collect();
    columns.push(
        format!("{prefix}_attempts"),
        DataType::UInt32,
        true,
        Arc::new(attempts),
    );
    columns.float(format!("{prefix}_diagnostic"), rows, |r| Some(r.diagnostic));
    if with_excluded {
        let excluded: BooleanArray = rows.iter().map(|r| r.map(|r| r.excluded)).collect();
        columns.push(
            format!("{prefix}_excluded"),
            DataType::Boolean,
            true,
            Arc::new(excluded),
        );
    }

    for (index, spec) in task.model().params.iter().enumerate() {
        let name = spec.name;
        columns.float(format!("{prefix}_{name}"), rows, |r| {
            r.params.get(index).map(|p| p.estimate)
        });
        if let ParamScale::Log { natural } = spec.scale {
            columns.float(format!("{prefix}_{natural}"), rows, |r| {
                r.params
                    .get(index)
                    .and_then(|p| p.natural)
                    .map(|(_, value)| value)
            });
        }
        columns.float(format!("{prefix}_{name}_sd"), rows, |r| {
            r.params.get(index).map(|p| p.sd)
        });
        columns.float(format!("{prefix}_{name}_lower"), rows, |r| {
            r.params.get(index).map(|p| p.lower)
        });
        columns.float(format!("{prefix}_{name}_upper"), rows, |r| {
            r.params.get(index).map(|p| p.upper)
        });
        columns.float(format!("{prefix}_{name}_width"), rows, |r| {
            r.params.get(index).map(|p| p.width)
        });
        columns.float(format!("{prefix}_{name}_width_z"), rows, |r| {
            r.params.get(index).map(|p| p.width_z)
        });
    }
}

fn write_batch(path: &Path, batch: &RecordBatch) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

impl EstimateTable {
    /// Convert to a single Arrow batch.
    ///
    /// # Errors
    ///
    /// Returns error if Arrow rejects the assembled columns.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let mut columns = Columns::default();
        let units: Vec<&UnitKey> = self.rows().iter().map(|row| &row.unit).collect();
        unit_columns(&mut columns, &units);
        for &task in self.tasks() {
            let rows: Vec<Option<&TaskEstimateRow>> =
                self.rows().iter().map(|row| row.task(task)).collect();
            task_columns(&mut columns, task, &rows, false);
        }
        columns.finish()
    }

    /// Write the table to a Parquet file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written.
    pub fn write_parquet<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_batch(path.as_ref(), &self.to_record_batch()?)
    }
}

impl TaskEstimates {
    /// Convert every row, excluded ones included, to an Arrow batch.
    ///
    /// # Errors
    ///
    /// Returns error if Arrow rejects the assembled columns.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let mut columns = Columns::default();
        let units: Vec<UnitKey> = self.rows().iter().map(TaskEstimateRow::unit).collect();
        let unit_refs: Vec<&UnitKey> = units.iter().collect();
        unit_columns(&mut columns, &unit_refs);
        let rows: Vec<Option<&TaskEstimateRow>> = self.rows().iter().map(Some).collect();
        task_columns(&mut columns, self.task(), &rows, true);
        columns.finish()
    }

    /// Write the per-task table to a Parquet file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written.
    pub fn write_parquet<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_batch(path.as_ref(), &self.to_record_batch()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{aggregate_task, join_tasks};
    use crate::runner::FitResult;

    #[test]
    fn test_empty_table_has_full_schema() {
        let discounting = aggregate_task(TaskKind::Discounting, &Vec::<FitResult>::new(), 1.96).unwrap();
        let risk = aggregate_task(TaskKind::RiskAmbiguity, &Vec::<FitResult>::new(), 1.96).unwrap();
        let batch = join_tasks([&risk, &discounting])
            .unwrap()
            .to_record_batch()
            .unwrap();

        assert_eq!(batch.num_rows(), 0);
        let schema = batch.schema();
        // Discounting block comes first regardless of argument order
        assert_eq!(schema.field(2).name(), "discounting_converged");
        assert!(schema.field_with_name("discounting_discount_rate").is_ok());
        assert!(schema.field_with_name("risk_ambiguity_ambiguity_weight_width_z").is_ok());
        assert!(schema.field_with_name("risk_ambiguity_inverse_temperature").is_ok());
        assert!(schema.field_with_name("discounting_excluded").is_err());
    }

    #[test]
    fn test_task_table_has_excluded_column() {
        let risk = aggregate_task(TaskKind::RiskAmbiguity, &Vec::<FitResult>::new(), 1.96).unwrap();
        let batch = risk.to_record_batch().unwrap();
        assert!(batch.schema().field_with_name("risk_ambiguity_excluded").is_ok());
    }
}
