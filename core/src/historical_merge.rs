//! Historical update: fold newly ingested records into the store.
//!
//! RULE: The store only ever grows. A reference id already in the store
//! keeps its stored copy, including every flag; incoming duplicates are
//! dropped, never overwritten.

use crate::{
    clock::RunClock,
    config::PipelineConfig,
    error::VelocityResult,
    event::StageEvent,
    ingest::DailyFileSource,
    record::RecordSet,
    stage::PipelineStage,
    store::HistoricalStore,
};

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Nothing new; the store must not be rewritten.
    Unchanged,
    /// No store existed; this is its first content.
    Created(RecordSet),
    /// Store plus `added` new records.
    Appended { merged: RecordSet, added: usize },
}

impl MergeOutcome {
    /// The record set to persist, if any.
    pub fn to_write(&self) -> Option<&RecordSet> {
        match self {
            Self::Unchanged => None,
            Self::Created(set) | Self::Appended { merged: set, .. } => Some(set),
        }
    }
}

/// historical ∪ (incoming − historical), keyed on reference id.
///
/// Both sides end up with the same flag columns: the declared ones, then
/// any column either side already carries, backfilled with 0. Passthrough
/// and code columns are the union of both sides; the store's types win.
pub fn merge_delta(
    historical: Option<RecordSet>,
    mut incoming: RecordSet,
    declared_flags: &[String],
) -> MergeOutcome {
    let dropped = incoming.dedup_by_reference();
    if dropped > 0 {
        log::warn!("Dropped {dropped} duplicate reference ids from the incoming batch");
    }
    for flag in declared_flags {
        incoming.ensure_flag_column(flag);
    }

    let Some(mut historical) = historical else {
        if incoming.is_empty() {
            return MergeOutcome::Unchanged;
        }
        return MergeOutcome::Created(incoming);
    };

    let known = historical.reference_ids();
    let new_only: Vec<_> = incoming
        .records
        .into_iter()
        .filter(|r| !known.contains(r.reference_id.as_str()))
        .collect();
    if new_only.is_empty() {
        return MergeOutcome::Unchanged;
    }

    let mut delta = RecordSet::new(incoming.flag_columns, new_only);
    for field in incoming.extra_columns {
        historical.ensure_extra_column(field);
    }
    historical.codes = historical.codes.union(incoming.codes);
    for flag in &historical.flag_columns {
        delta.ensure_flag_column(flag);
    }
    for flag in &delta.flag_columns {
        historical.ensure_flag_column(flag);
    }

    let added = delta.len();
    historical.records.extend(delta.records);
    MergeOutcome::Appended {
        merged: historical,
        added,
    }
}

// ── Stage ──────────────────────────────────────────────────────────

pub struct HistoricalUpdateStage {
    source: DailyFileSource,
    store: HistoricalStore,
    declared_flags: Vec<String>,
}

impl HistoricalUpdateStage {
    pub fn new(config: &PipelineConfig, declared_flags: &[String]) -> Self {
        Self {
            source: DailyFileSource::new(config),
            store: HistoricalStore::open(config),
            declared_flags: declared_flags.to_vec(),
        }
    }
}

impl PipelineStage for HistoricalUpdateStage {
    fn name(&self) -> &'static str {
        "historical_update"
    }

    fn run(&self, clock: &RunClock) -> VelocityResult<StageEvent> {
        let store_path = self.store.path().display().to_string();
        let Some(incoming) = self.source.load(clock.today)? else {
            return Ok(StageEvent::NoInputFiles { store: store_path });
        };
        let incoming_len = incoming.len();
        let historical = self.store.load_if_exists()?;

        match merge_delta(historical, incoming, &self.declared_flags) {
            MergeOutcome::Unchanged => {
                log::info!("Historical store {store_path} already up to date");
                Ok(StageEvent::HistoricalUnchanged {
                    store: store_path,
                    incoming: incoming_len,
                })
            }
            MergeOutcome::Created(set) => {
                self.store.save(&set)?;
                Ok(StageEvent::HistoricalCreated {
                    store: store_path,
                    records: set.len(),
                })
            }
            MergeOutcome::Appended { merged, added } => {
                self.store.save(&merged)?;
                log::info!("Appended {added} new records to {store_path}");
                Ok(StageEvent::HistoricalMerged {
                    store: store_path,
                    added,
                    total: merged.len(),
                })
            }
        }
    }
}
