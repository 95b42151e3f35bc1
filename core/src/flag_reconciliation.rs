//! Flag reconciliation: OR a rule's daily flag batch into the store.
//!
//! RULE: Flags are monotonic. Reconciliation only ever sets the rule's
//! own column to 1; it never clears a flag and never touches another
//! rule's column. A batch that changes nothing causes no write.

use crate::{
    clock::RunClock,
    config::{ColumnMap, PipelineConfig, ValidatedRule},
    error::{VelocityError, VelocityResult},
    event::{SkipReason, StageEvent},
    record::RecordSet,
    stage::PipelineStage,
    store::{
        codec::{read_parquet, required_column},
        HistoricalStore,
    },
    types::{FLAG_SET, FLAG_UNSET},
};
use arrow::array::{Array, AsArray};
use arrow::datatypes::{DataType, Int8Type};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Reference ids one rule flagged in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyFlagBatch {
    pub flag_column: String,
    pub reference_ids: HashSet<String>,
}

impl DailyFlagBatch {
    pub fn new(flag_column: impl Into<String>, reference_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            flag_column: flag_column.into(),
            reference_ids: reference_ids.into_iter().collect(),
        }
    }

    /// Read the reference ids whose `flag_column` is set in a daily flag
    /// batch file. Rows with a null or zero flag are ignored.
    pub fn from_file(path: &Path, flag_column: &str, columns: &ColumnMap) -> VelocityResult<Self> {
        let origin = path.display().to_string();
        let (schema, batches) = read_parquet(path)?;
        for name in [columns.reference_id.as_str(), flag_column] {
            if schema.field_with_name(name).is_err() {
                return Err(VelocityError::MissingColumn {
                    column: name.to_string(),
                    origin,
                });
            }
        }

        let mut reference_ids = HashSet::new();
        for batch in &batches {
            let refs = required_column(batch, &columns.reference_id, &DataType::Utf8, &origin)?;
            let flags = required_column(batch, flag_column, &DataType::Int8, &origin)?;
            let refs = refs.as_string::<i32>();
            let flags = flags.as_primitive::<Int8Type>();
            for row in 0..batch.num_rows() {
                if refs.is_null(row) || flags.is_null(row) || flags.value(row) == FLAG_UNSET {
                    continue;
                }
                reference_ids.insert(refs.value(row).to_string());
            }
        }
        Ok(Self {
            flag_column: flag_column.to_string(),
            reference_ids,
        })
    }

    pub fn len(&self) -> usize {
        self.reference_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reference_ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied { newly_flagged: usize },
    /// Every matching store record already carries the flag.
    AlreadyFlagged { matched: usize },
    NoMatchingRecords,
    EmptyBatch,
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Set `flag_column` to 1 on every store record named by `batch`.
/// `store` is left untouched unless the outcome is `Applied`.
pub fn reconcile_flags(store: &mut RecordSet, flag_column: &str, batch: &DailyFlagBatch) -> ReconcileOutcome {
    if batch.is_empty() {
        return ReconcileOutcome::EmptyBatch;
    }

    let (matched, unflagged) = store
        .records
        .iter()
        .filter(|r| batch.reference_ids.contains(&r.reference_id))
        .fold((0usize, 0usize), |(m, u), r| {
            (m + 1, u + usize::from(!r.is_flagged(flag_column)))
        });
    if matched == 0 {
        return ReconcileOutcome::NoMatchingRecords;
    }
    if unflagged == 0 {
        return ReconcileOutcome::AlreadyFlagged { matched };
    }

    if store.ensure_flag_column(flag_column) {
        log::info!("Added flag column '{flag_column}' to the store");
    }
    for record in store
        .records
        .iter_mut()
        .filter(|r| batch.reference_ids.contains(&r.reference_id))
    {
        record.flags.insert(flag_column.to_string(), FLAG_SET);
    }
    ReconcileOutcome::Applied {
        newly_flagged: unflagged,
    }
}

// ── Stage ──────────────────────────────────────────────────────────

pub struct FlagReconciliationStage {
    rule: String,
    flag_column: String,
    batch_path: PathBuf,
    store: HistoricalStore,
    columns: ColumnMap,
}

impl FlagReconciliationStage {
    pub fn new(config: &PipelineConfig, rule: &ValidatedRule) -> Self {
        Self {
            rule: rule.name.clone(),
            flag_column: rule.flag_column.clone(),
            batch_path: rule.batch_path.clone(),
            store: HistoricalStore::open(config),
            columns: config.columns.clone(),
        }
    }

    fn skipped(&self, reason: SkipReason) -> StageEvent {
        StageEvent::ReconcileSkipped {
            rule: self.rule.clone(),
            reason,
        }
    }
}

impl PipelineStage for FlagReconciliationStage {
    fn name(&self) -> &'static str {
        "flag_reconciliation"
    }

    fn rule(&self) -> Option<&str> {
        Some(&self.rule)
    }

    fn run(&self, _clock: &RunClock) -> VelocityResult<StageEvent> {
        if !self.store.exists() {
            return Err(VelocityError::StoreMissing {
                path: self.store.path().to_path_buf(),
            });
        }
        if !self.batch_path.is_file() {
            log::info!(
                "[{}] No daily flag batch at {}; nothing to reconcile",
                self.rule,
                self.batch_path.display()
            );
            return Ok(self.skipped(SkipReason::NoBatchFile));
        }

        let batch = DailyFlagBatch::from_file(&self.batch_path, &self.flag_column, &self.columns)?;
        if batch.is_empty() {
            log::info!("[{}] Daily flag batch is empty", self.rule);
            return Ok(self.skipped(SkipReason::EmptyBatch));
        }

        let mut history = self.store.load()?;
        match reconcile_flags(&mut history, &self.flag_column, &batch) {
            ReconcileOutcome::Applied { newly_flagged } => {
                self.store.save(&history)?;
                log::info!(
                    "[{}] Set {} on {newly_flagged} records",
                    self.rule,
                    self.flag_column
                );
                Ok(StageEvent::FlagsReconciled {
                    rule: self.rule.clone(),
                    flag_column: self.flag_column.clone(),
                    newly_flagged,
                })
            }
            ReconcileOutcome::AlreadyFlagged { matched } => {
                log::info!("[{}] No new records to flag ({matched} already flagged)", self.rule);
                Ok(self.skipped(SkipReason::AlreadyFlagged))
            }
            ReconcileOutcome::NoMatchingRecords => {
                log::warn!(
                    "[{}] None of the {} flagged reference ids exist in the store",
                    self.rule,
                    batch.len()
                );
                Ok(self.skipped(SkipReason::NoMatchingRecords))
            }
            ReconcileOutcome::EmptyBatch => Ok(self.skipped(SkipReason::EmptyBatch)),
        }
    }
}
