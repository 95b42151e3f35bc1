//! Parquet persistence layer.
//!
//! RULE: Only the store module touches store and batch files.
//! Stages call store methods; they never open Parquet files directly.
//! Every write goes through `atomic::replace_atomically`.

pub mod atomic;
pub mod codec;

use crate::{
    config::{ColumnMap, PipelineConfig},
    error::{VelocityError, VelocityResult},
    record::RecordSet,
};
use codec::{read_parquet, write_parquet_atomically, RecordCodec};
use std::path::{Path, PathBuf};

/// The accumulating, deduplicated record set of one rule family.
#[derive(Debug, Clone)]
pub struct HistoricalStore {
    path: PathBuf,
    columns: ColumnMap,
    /// Column names read as flags; other unmapped columns pass through.
    flag_columns: Vec<String>,
}

impl HistoricalStore {
    pub fn new(path: impl Into<PathBuf>, columns: ColumnMap, flag_columns: Vec<String>) -> Self {
        Self {
            path: path.into(),
            columns,
            flag_columns,
        }
    }

    pub fn open(config: &PipelineConfig) -> Self {
        Self::new(
            config.historical.store_path.clone(),
            config.columns.clone(),
            config.known_flag_columns(),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Load the whole store. An absent store is `StoreMissing`.
    pub fn load(&self) -> VelocityResult<RecordSet> {
        self.load_if_exists()?
            .ok_or_else(|| VelocityError::StoreMissing {
                path: self.path.clone(),
            })
    }

    pub fn load_if_exists(&self) -> VelocityResult<Option<RecordSet>> {
        if !self.exists() {
            return Ok(None);
        }
        let set = read_record_set(&self.path, &self.columns, &self.flag_columns)?;
        log::info!(
            "Loaded historical store {} ({} records, flags {:?}, {} passthrough columns)",
            self.path.display(),
            set.len(),
            set.flag_columns,
            set.extra_columns.len()
        );
        Ok(Some(set))
    }

    /// Replace the store with `set`. Refuses to persist duplicate keys.
    pub fn save(&self, set: &RecordSet) -> VelocityResult<()> {
        let duplicates = set.duplicate_reference_count();
        if duplicates > 0 {
            return Err(VelocityError::schema(
                self.path.display().to_string(),
                format!("refusing to write {duplicates} duplicate reference ids"),
            ));
        }
        write_record_set(&self.path, set, &self.columns, None)?;
        log::info!(
            "Saved historical store {} ({} records)",
            self.path.display(),
            set.len()
        );
        Ok(())
    }
}

pub fn read_record_set(
    path: &Path,
    columns: &ColumnMap,
    flag_columns: &[String],
) -> VelocityResult<RecordSet> {
    let (schema, batches) = read_parquet(path)?;
    RecordCodec::new(columns).from_batches(&schema, &batches, flag_columns, &path.display().to_string())
}

/// Atomically write `set`; `temp_date_column` adds the calendar-day column
/// carried by daily flag batches.
pub fn write_record_set(
    path: &Path,
    set: &RecordSet,
    columns: &ColumnMap,
    temp_date_column: Option<&str>,
) -> VelocityResult<()> {
    let batch = RecordCodec::new(columns).to_batch(set, temp_date_column)?;
    write_parquet_atomically(path, &batch)
}
