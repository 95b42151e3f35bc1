//! Integration tests for flag reconciliation.
//!
//! Tests verify:
//! 1. Batch references get the rule's flag; every other value is untouched
//! 2. Applying the same batch twice changes nothing and skips the write
//! 3. Flags are monotonic: a set flag is never cleared
//! 4. Scenario C: an already-flagged batch leaves the store file untouched
//! 5. A missing store is fatal; a missing or empty batch is a no-op
//! 6. Rules must name exactly one flag column

use chrono::NaiveDate;
use std::fs;
use std::path::Path;
use velocity_core::{
    clock::RunClock,
    config::{FlagDesignator, PipelineConfig, ValidatedRule},
    error::VelocityError,
    event::{SkipReason, StageEvent},
    flag_reconciliation::{reconcile_flags, DailyFlagBatch, FlagReconciliationStage, ReconcileOutcome},
    record::{RecordSet, TransactionRecord},
    stage::PipelineStage,
    store::{write_record_set, HistoricalStore},
};

// ── Test helpers ───────────────────────────────────────────────────

fn txn(reference: &str) -> TransactionRecord {
    let ts = NaiveDate::from_ymd_opt(2025, 3, 1)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap();
    TransactionRecord::new(reference, "ACC-1", ts, 100.0).with_codes(0, 1, "TF_ONLINE")
}

fn store_with(refs: &[&str]) -> RecordSet {
    RecordSet::new(
        vec!["flag_10min".into(), "flag_50mio".into()],
        refs.iter().map(|r| txn(r)).collect(),
    )
}

fn batch(refs: &[&str]) -> DailyFlagBatch {
    DailyFlagBatch::new("flag_10min", refs.iter().map(|r| r.to_string()))
}

fn clock() -> RunClock {
    RunClock::fixed(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap())
}

fn burst_rule(config: &PipelineConfig) -> ValidatedRule {
    config.validate().unwrap().rule("burst_10min").unwrap().clone()
}

/// Write a daily batch file holding `refs` with `flag_10min` = `value`.
fn write_batch_file(config: &PipelineConfig, path: &Path, refs: &[&str], value: i8) {
    let records = refs.iter().map(|r| txn(r).with_flag("flag_10min", value)).collect();
    let set = RecordSet::new(vec!["flag_10min".into()], records);
    write_record_set(path, &set, &config.columns, Some(&config.temp_date_column)).unwrap();
}

// ── reconcile_flags ────────────────────────────────────────────────

#[test]
fn sets_only_batch_records_and_only_the_rule_column() {
    let mut store = store_with(&["A", "B", "C"]);
    store.records[2].flags.insert("flag_50mio".into(), 1);

    let outcome = reconcile_flags(&mut store, "flag_10min", &batch(&["A", "C", "UNKNOWN"]));
    assert_eq!(outcome, ReconcileOutcome::Applied { newly_flagged: 2 });

    assert_eq!(store.find("A").unwrap().flag("flag_10min"), 1);
    assert_eq!(store.find("B").unwrap().flag("flag_10min"), 0);
    assert_eq!(store.find("C").unwrap().flag("flag_10min"), 1);
    assert_eq!(store.find("A").unwrap().flag("flag_50mio"), 0);
    assert_eq!(store.find("C").unwrap().flag("flag_50mio"), 1, "other rule's flag untouched");
}

#[test]
fn applying_twice_is_idempotent() {
    let mut store = store_with(&["A", "B"]);
    let daily = batch(&["A"]);

    assert!(reconcile_flags(&mut store, "flag_10min", &daily).changed());
    let after_first = store.clone();
    let second = reconcile_flags(&mut store, "flag_10min", &daily);

    assert_eq!(second, ReconcileOutcome::AlreadyFlagged { matched: 1 });
    assert_eq!(store, after_first);
}

#[test]
fn flags_are_never_cleared() {
    let mut store = store_with(&["A", "B"]);
    store.records[1].flags.insert("flag_10min".into(), 1);

    reconcile_flags(&mut store, "flag_10min", &batch(&["A"]));
    assert_eq!(store.flagged_count("flag_10min"), 2, "B keeps the flag set by an earlier run");
}

#[test]
fn missing_target_column_is_added_with_backfill() {
    let mut store = store_with(&["A", "B"]);
    let outcome = reconcile_flags(&mut store, "flag_new", &DailyFlagBatch::new("flag_new", ["B".to_string()]));

    assert!(outcome.changed());
    assert!(store.has_flag_column("flag_new"));
    assert_eq!(store.find("A").unwrap().flag("flag_new"), 0);
    assert_eq!(store.find("A").unwrap().flags.len(), 3);
    assert_eq!(store.find("B").unwrap().flag("flag_new"), 1);
}

#[test]
fn empty_or_unmatched_batches_change_nothing() {
    let mut store = store_with(&["A"]);
    let before = store.clone();
    assert_eq!(reconcile_flags(&mut store, "flag_10min", &batch(&[])), ReconcileOutcome::EmptyBatch);
    assert_eq!(
        reconcile_flags(&mut store, "flag_10min", &batch(&["Z"])),
        ReconcileOutcome::NoMatchingRecords
    );
    assert_eq!(store, before);
}

// ── Batch files ────────────────────────────────────────────────────

#[test]
fn batch_file_ignores_unset_flags() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    let path = dir.path().join("daily.parquet");
    let records = vec![txn("A").with_flag("flag_10min", 1), txn("B").with_flag("flag_10min", 0)];
    write_record_set(
        &path,
        &RecordSet::new(vec!["flag_10min".into()], records),
        &config.columns,
        Some("transaction_day"),
    )
    .unwrap();

    let daily = DailyFlagBatch::from_file(&path, "flag_10min", &config.columns).unwrap();
    assert_eq!(daily.len(), 1);
    assert!(daily.reference_ids.contains("A"));
}

#[test]
fn batch_file_without_flag_column_is_a_schema_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    let path = dir.path().join("daily.parquet");
    write_batch_file(&config, &path, &["A"], 1);

    let err = DailyFlagBatch::from_file(&path, "flag_50mio", &config.columns).unwrap_err();
    assert!(err.is_schema_error(), "got {err}");
}

// ── Stage ──────────────────────────────────────────────────────────

#[test]
fn stage_applies_batch_then_skips_it() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    let rule = burst_rule(&config);
    let store = HistoricalStore::open(&config);
    store.save(&store_with(&["A", "B", "C"])).unwrap();
    write_batch_file(&config, &rule.batch_path, &["A", "B"], 1);

    let stage = FlagReconciliationStage::new(&config, &rule);
    let first = stage.run(&clock()).unwrap();
    assert!(matches!(first, StageEvent::FlagsReconciled { newly_flagged: 2, .. }), "{first:?}");
    assert_eq!(store.load().unwrap().flagged_count("flag_10min"), 2);

    let second = stage.run(&clock()).unwrap();
    assert_eq!(
        second,
        StageEvent::ReconcileSkipped {
            rule: "burst_10min".into(),
            reason: SkipReason::AlreadyFlagged,
        }
    );
}

#[test]
fn already_flagged_batch_leaves_store_file_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    let rule = burst_rule(&config);
    let mut seeded = store_with(&["A", "B"]);
    seeded.records[0].flags.insert("flag_10min".into(), 1);
    HistoricalStore::open(&config).save(&seeded).unwrap();
    write_batch_file(&config, &rule.batch_path, &["A"], 1);

    let path = &config.historical.store_path;
    let bytes = fs::read(path).unwrap();
    let modified = fs::metadata(path).unwrap().modified().unwrap();

    let event = FlagReconciliationStage::new(&config, &rule).run(&clock()).unwrap();
    assert!(!event.rewrote_store(), "{event:?}");
    assert_eq!(fs::read(path).unwrap(), bytes);
    assert_eq!(fs::metadata(path).unwrap().modified().unwrap(), modified);
}

#[test]
fn missing_store_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    let rule = burst_rule(&config);
    write_batch_file(&config, &rule.batch_path, &["A"], 1);

    let err = FlagReconciliationStage::new(&config, &rule).run(&clock()).unwrap_err();
    assert!(matches!(err, VelocityError::StoreMissing { .. }), "got {err}");
    assert!(!config.historical.store_path.exists());
}

#[test]
fn missing_or_empty_batch_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    let rule = burst_rule(&config);
    HistoricalStore::open(&config).save(&store_with(&["A"])).unwrap();
    let stage = FlagReconciliationStage::new(&config, &rule);

    let event = stage.run(&clock()).unwrap();
    assert_eq!(
        event,
        StageEvent::ReconcileSkipped {
            rule: "burst_10min".into(),
            reason: SkipReason::NoBatchFile,
        }
    );

    write_batch_file(&config, &rule.batch_path, &[], 1);
    let event = stage.run(&clock()).unwrap();
    assert_eq!(
        event,
        StageEvent::ReconcileSkipped {
            rule: "burst_10min".into(),
            reason: SkipReason::EmptyBatch,
        }
    );
}

#[test]
fn rule_with_flag_list_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = PipelineConfig::default_test(dir.path());
    config.rules[0].flag = FlagDesignator::MultiFlag(vec!["flag_10min".into()]);

    let err = config.validate().unwrap_err();
    assert!(matches!(err, VelocityError::Validation(_)), "got {err}");
}
