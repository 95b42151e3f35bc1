//! Velocity detection: rolling count and rolling value-sum bursts.
//!
//! RULE: Detection reads the historical store and writes only the rule's
//! daily flag batch. It never mutates the store itself; flags reach the
//! store through flag_reconciliation.
//!
//! A run is two phases: `DetectionPlan::for_rule` describes the work
//! (filters, window aggregate, threshold), `DetectionPlan::execute` does it.

use crate::{
    clock::RunClock,
    config::{ColumnMap, Detection, PipelineConfig, ValidatedRule},
    error::VelocityResult,
    event::StageEvent,
    record::{RecordSet, TransactionRecord},
    stage::PipelineStage,
    store::{write_record_set, HistoricalStore},
    types::FLAG_SET,
    window,
};
use chrono::{Duration, NaiveDate, Timelike};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};

// ── Plan ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum RecordFilter {
    /// Calendar day on or after the given date.
    OnOrAfter(NaiveDate),
    /// Hour of day within [start, end], both inclusive.
    HourBetween { start: u32, end: u32 },
}

impl RecordFilter {
    pub fn keep(&self, record: &TransactionRecord) -> bool {
        match self {
            Self::OnOrAfter(day) => record.timestamp.date() >= *day,
            Self::HourBetween { start, end } => {
                let hour = record.timestamp.hour();
                *start <= hour && hour <= *end
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::OnOrAfter(day) => format!("day >= {day}"),
            Self::HourBetween { start, end } => format!("hour in [{start}, {end}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowAggregate {
    Count {
        window: Duration,
        threshold: usize,
        marking_span: Duration,
    },
    ValueSum {
        lookback: Duration,
        threshold: f64,
    },
}

impl WindowAggregate {
    /// Per-record marks for one account's records, sorted by timestamp.
    fn marks(&self, records: &[&TransactionRecord]) -> Vec<bool> {
        let timestamps: Vec<_> = records.iter().map(|r| r.timestamp).collect();
        match self {
            Self::Count {
                window,
                threshold,
                marking_span,
            } => window::count_burst_marks(&timestamps, *window, *threshold, *marking_span),
            Self::ValueSum { lookback, threshold } => {
                let amounts: Vec<f64> = records.iter().map(|r| r.amount).collect();
                window::value_burst_marks(&timestamps, &amounts, *lookback, *threshold)
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Count {
                window,
                threshold,
                marking_span,
            } => format!(
                "count >= {threshold} within {}min, mark {}min back",
                window.num_minutes(),
                marking_span.num_minutes()
            ),
            Self::ValueSum { lookback, threshold } => {
                format!("sum(amount) >= {threshold} within {}h", lookback.num_hours())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionPlan {
    pub rule: String,
    pub flag_column: String,
    pub filters: Vec<RecordFilter>,
    pub aggregate: WindowAggregate,
}

impl DetectionPlan {
    pub fn for_rule(rule: &ValidatedRule, today: NaiveDate) -> Self {
        let mut filters = Vec::new();
        if let Some(days) = rule.lookback_days {
            filters.push(RecordFilter::OnOrAfter(RunClock::fixed(today).days_ago(days)));
        }
        if let Some((start, end)) = rule.hour_range {
            filters.push(RecordFilter::HourBetween { start, end });
        }
        let aggregate = match &rule.detection {
            Detection::Count {
                window,
                threshold,
                marking_span,
            } => WindowAggregate::Count {
                window: *window,
                threshold: *threshold,
                marking_span: *marking_span,
            },
            Detection::ValueSum { lookback, threshold } => WindowAggregate::ValueSum {
                lookback: *lookback,
                threshold: *threshold,
            },
        };
        Self {
            rule: rule.name.clone(),
            flag_column: rule.flag_column.clone(),
            filters,
            aggregate,
        }
    }

    /// One-line rendering for logs.
    pub fn describe(&self) -> String {
        let filters = if self.filters.is_empty() {
            "all records".to_string()
        } else {
            self.filters
                .iter()
                .map(RecordFilter::describe)
                .collect::<Vec<_>>()
                .join(" and ")
        };
        format!(
            "[{}] {filters} -> per account {} -> set {}",
            self.rule,
            self.aggregate.describe(),
            self.flag_column
        )
    }

    pub fn execute(&self, store: &RecordSet) -> FlagBatch {
        let mut by_account: HashMap<&str, Vec<&TransactionRecord>> = HashMap::new();
        for record in store
            .records
            .iter()
            .filter(|r| self.filters.iter().all(|f| f.keep(r)))
        {
            by_account
                .entry(record.account_number.as_str())
                .or_default()
                .push(record);
        }

        let flagged: Vec<&TransactionRecord> = by_account
            .into_par_iter()
            .flat_map_iter(|(_, mut records)| {
                records.sort_by_key(|r| r.timestamp);
                let marks = self.aggregate.marks(&records);
                records
                    .into_iter()
                    .zip(marks)
                    .filter_map(|(record, marked)| marked.then_some(record))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut seen = HashSet::with_capacity(flagged.len());
        let records = flagged
            .into_iter()
            .filter(|r| seen.insert(r.reference_id.as_str()))
            .map(|r| TransactionRecord {
                flags: BTreeMap::from([(self.flag_column.clone(), FLAG_SET)]),
                ..r.clone()
            })
            .collect();

        let mut set = RecordSet::new(vec![self.flag_column.clone()], records);
        set.extra_columns = store.extra_columns.clone();
        set.codes = store.codes;
        set.sort_chronologically();
        FlagBatch {
            flag_column: self.flag_column.clone(),
            records: set,
        }
    }
}

// ── Output ─────────────────────────────────────────────────────────

/// Records one rule flagged in one run. `records.flag_columns` holds only
/// the rule's own column, set to 1 on every record; passthrough columns
/// keep the store's layout.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagBatch {
    pub flag_column: String,
    pub records: RecordSet,
}

impl FlagBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn account_count(&self) -> usize {
        self.records
            .records
            .iter()
            .map(|r| r.account_number.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn reference_ids(&self) -> HashSet<&str> {
        self.records.reference_ids()
    }
}

// ── Stage ──────────────────────────────────────────────────────────

pub struct FlagDetectionStage {
    rule: ValidatedRule,
    store: HistoricalStore,
    columns: ColumnMap,
    temp_date_column: String,
}

impl FlagDetectionStage {
    pub fn new(config: &PipelineConfig, rule: &ValidatedRule) -> Self {
        Self {
            rule: rule.clone(),
            store: HistoricalStore::open(config),
            columns: config.columns.clone(),
            temp_date_column: config.temp_date_column.clone(),
        }
    }
}

impl PipelineStage for FlagDetectionStage {
    fn name(&self) -> &'static str {
        "flag_detection"
    }

    fn rule(&self) -> Option<&str> {
        Some(&self.rule.name)
    }

    fn run(&self, clock: &RunClock) -> VelocityResult<StageEvent> {
        log::info!("[{}] Detecting flagged transactions", self.rule.name);
        let history = self.store.load()?;

        let plan = DetectionPlan::for_rule(&self.rule, clock.today);
        log::debug!("{}", plan.describe());
        let batch = plan.execute(&history);

        write_record_set(
            &self.rule.batch_path,
            &batch.records,
            &self.columns,
            Some(&self.temp_date_column),
        )?;
        let path = self.rule.batch_path.display().to_string();

        if batch.is_empty() {
            log::info!("[{}] No flagged transactions; wrote empty batch {path}", self.rule.name);
            return Ok(StageEvent::NoFlagsDetected {
                rule: self.rule.name.clone(),
                batch: path,
            });
        }

        let accounts = batch.account_count();
        log::info!(
            "[{}] Flagged {} transactions across {accounts} accounts -> {path}",
            self.rule.name,
            batch.len()
        );
        Ok(StageEvent::FlagsDetected {
            rule: self.rule.name.clone(),
            flag_column: batch.flag_column,
            flagged: batch.records.len(),
            accounts,
            batch: path,
        })
    }
}
