//! Integration tests for velocity detection.
//!
//! Tests verify:
//! 1. Count bursts: five records within ten minutes are all flagged, four are not
//! 2. Value bursts: every record contributing to a 24h sum over threshold is flagged
//! 3. The hour-of-day filter is inclusive on both ends
//! 4. The lookback filter drops records older than today - N days
//! 5. The batch carries only the rule's own flag column
//! 6. The stage writes a schema-preserving batch file, even when empty
//! 7. Detection against a missing store fails without writing

use chrono::{Duration, NaiveDate, NaiveDateTime};
use velocity_core::{
    clock::RunClock,
    config::{PipelineConfig, ValidatedRule},
    error::VelocityError,
    event::StageEvent,
    record::{RecordSet, TransactionRecord},
    stage::PipelineStage,
    store::{codec::read_parquet, HistoricalStore},
    velocity_detection::{DetectionPlan, FlagDetectionStage},
};

// ── Test helpers ───────────────────────────────────────────────────

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
}

fn at(hour: u32, minute: u32) -> NaiveDateTime {
    day().and_hms_opt(hour, minute, 0).unwrap()
}

fn txn(reference: &str, account: &str, ts: NaiveDateTime, amount: f64) -> TransactionRecord {
    TransactionRecord::new(reference, account, ts, amount).with_codes(0, 1, "TF_ONLINE")
}

fn store_of(records: Vec<TransactionRecord>) -> RecordSet {
    RecordSet::new(
        vec!["flag_10min".into(), "flag_50mio".into(), "flag_50mio_early".into()],
        records,
    )
}

fn rule(config: &PipelineConfig, name: &str) -> ValidatedRule {
    config.validate().unwrap().rule(name).unwrap().clone()
}

fn flagged_refs(set: &RecordSet) -> Vec<&str> {
    let mut refs: Vec<&str> = set.records.iter().map(|r| r.reference_id.as_str()).collect();
    refs.sort();
    refs
}

/// `count` records for `account`, two minutes apart from `start`.
fn burst(prefix: &str, account: &str, start: NaiveDateTime, count: usize) -> Vec<TransactionRecord> {
    (0..count)
        .map(|i| {
            txn(
                &format!("{prefix}{i}"),
                account,
                start + Duration::minutes(2 * i as i64),
                100_000.0,
            )
        })
        .collect()
}

// ── Count bursts ───────────────────────────────────────────────────

#[test]
fn five_records_in_ten_minutes_are_all_flagged() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    let plan = DetectionPlan::for_rule(&rule(&config, "burst_10min"), day());

    let mut records = burst("X", "ACC-X", at(10, 0), 5);
    records.extend(burst("Q", "ACC-Q", at(10, 0), 4));
    let batch = plan.execute(&store_of(records));

    assert_eq!(
        flagged_refs(&batch.records),
        vec!["X0", "X1", "X2", "X3", "X4"],
        "all five burst records flagged, the four-record account untouched"
    );
    assert_eq!(batch.account_count(), 1);
    assert!(batch.records.records.iter().all(|r| r.is_flagged("flag_10min")));
}

#[test]
fn four_records_in_ten_minutes_flag_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    let plan = DetectionPlan::for_rule(&rule(&config, "burst_10min"), day());

    let batch = plan.execute(&store_of(burst("X", "ACC-X", at(10, 0), 4)));
    assert!(batch.is_empty(), "four records must not reach a threshold of five");
}

#[test]
fn bursts_are_counted_per_account() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    let plan = DetectionPlan::for_rule(&rule(&config, "burst_10min"), day());

    // Five records in five minutes, but spread over three accounts.
    let records = (0..5)
        .map(|i| txn(&format!("R{i}"), &format!("ACC-{}", i % 3), at(9, i), 10.0))
        .collect();
    assert!(plan.execute(&store_of(records)).is_empty());
}

#[test]
fn marking_span_reaches_back_from_the_burst_point() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    let plan = DetectionPlan::for_rule(&rule(&config, "burst_10min"), day());

    // An early record 30 minutes before the burst stays unflagged.
    let mut records = vec![txn("EARLY", "ACC-X", at(9, 30), 10.0)];
    records.extend(burst("X", "ACC-X", at(10, 0), 5));
    let batch = plan.execute(&store_of(records));

    assert_eq!(batch.len(), 5);
    assert!(batch.records.find("EARLY").is_none());
}

// ── Value bursts ───────────────────────────────────────────────────

#[test]
fn value_burst_flags_every_contributing_record() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    let plan = DetectionPlan::for_rule(&rule(&config, "value_50mio"), day());

    let records = vec![
        txn("Y1", "ACC-Y", at(0, 30), 20_000_000.0),
        txn("Y2", "ACC-Y", at(8, 0), 25_000_000.0),
        txn("Y3", "ACC-Y", at(16, 0), 15_000_000.0),
        // 60M as well, but spread over three days.
        txn("S1", "ACC-S", at(0, 0) - Duration::hours(50), 20_000_000.0),
        txn("S2", "ACC-S", at(0, 0) - Duration::hours(25), 20_000_000.0),
        txn("S3", "ACC-S", at(0, 0), 20_000_000.0),
    ];
    let batch = plan.execute(&store_of(records));

    assert_eq!(flagged_refs(&batch.records), vec!["Y1", "Y2", "Y3"]);
}

#[test]
fn value_threshold_is_inclusive() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    let plan = DetectionPlan::for_rule(&rule(&config, "value_50mio"), day());

    let records = vec![
        txn("E1", "ACC-E", at(1, 0), 25_000_000.0),
        txn("E2", "ACC-E", at(2, 0), 25_000_000.0),
    ];
    assert_eq!(plan.execute(&store_of(records)).len(), 2);
}

#[test]
fn hour_filter_includes_both_ends() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    let plan = DetectionPlan::for_rule(&rule(&config, "value_50mio_early"), day());

    let records = vec![
        txn("H0", "ACC-H", at(0, 0), 20_000_000.0),
        txn("H5", "ACC-H", at(5, 59), 30_000_000.0),
        txn("H6", "ACC-H", at(6, 0), 40_000_000.0),
    ];
    let batch = plan.execute(&store_of(records));

    assert_eq!(flagged_refs(&batch.records), vec!["H0", "H5"]);
}

#[test]
fn hour_filter_applies_before_summing() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    let plan = DetectionPlan::for_rule(&rule(&config, "value_50mio_early"), day());

    // 60M in total, but only 30M of it falls inside 00:00-05:59.
    let records = vec![
        txn("A1", "ACC-A", at(3, 0), 30_000_000.0),
        txn("A2", "ACC-A", at(12, 0), 30_000_000.0),
    ];
    assert!(plan.execute(&store_of(records)).is_empty());
}

#[test]
fn lookback_filter_drops_old_days() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = PipelineConfig::default_test(dir.path());
    config.rules[0].lookback_days = Some(1);
    let today = day() + Duration::days(1);
    let plan = DetectionPlan::for_rule(&rule(&config, "burst_10min"), today);

    let mut records = burst("OLD", "ACC-X", at(10, 0) - Duration::days(2), 5);
    records.extend(burst("NEW", "ACC-X", at(10, 0), 5));
    let batch = plan.execute(&store_of(records));

    assert_eq!(batch.len(), 5);
    assert!(batch.records.records.iter().all(|r| r.reference_id.starts_with("NEW")));
    assert!(plan.describe().contains("day >= 2025-03-01"), "{}", plan.describe());
}

#[test]
fn batch_carries_only_the_rules_flag() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    let plan = DetectionPlan::for_rule(&rule(&config, "burst_10min"), day());

    let mut records = burst("X", "ACC-X", at(10, 0), 5);
    records[0] = records[0].clone().with_flag("flag_50mio", 1);
    let batch = plan.execute(&store_of(records));

    assert_eq!(batch.records.flag_columns, vec!["flag_10min".to_string()]);
    assert_eq!(batch.records.records[0].flags.len(), 1);
}

#[test]
fn batch_is_ordered_by_time_then_account() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    let plan = DetectionPlan::for_rule(&rule(&config, "burst_10min"), day());

    let mut records = burst("B", "ACC-B", at(10, 0), 5);
    records.extend(burst("A", "ACC-A", at(10, 0), 5));
    let batch = plan.execute(&store_of(records));

    let order: Vec<&str> = batch.records.records.iter().map(|r| r.reference_id.as_str()).collect();
    assert_eq!(order, vec!["A0", "B0", "A1", "B1", "A2", "B2", "A3", "B3", "A4", "B4"]);
}

// ── Stage ──────────────────────────────────────────────────────────

#[test]
fn stage_writes_batch_with_day_column() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    HistoricalStore::open(&config)
        .save(&store_of(burst("X", "ACC-X", at(10, 0), 5)))
        .unwrap();

    let rule = rule(&config, "burst_10min");
    let event = FlagDetectionStage::new(&config, &rule)
        .run(&RunClock::fixed(day()))
        .unwrap();
    match event {
        StageEvent::FlagsDetected { flagged, accounts, .. } => {
            assert_eq!((flagged, accounts), (5, 1));
        }
        other => panic!("expected flags_detected, got {other:?}"),
    }

    let (schema, batches) = read_parquet(&rule.batch_path).unwrap();
    assert!(schema.field_with_name("transaction_day").is_ok());
    assert!(schema.field_with_name("flag_10min").is_ok());
    assert!(schema.field_with_name("flag_50mio").is_err(), "other rules' flags are not carried");
    assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 5);
}

#[test]
fn stage_writes_empty_batch_when_nothing_qualifies() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    HistoricalStore::open(&config)
        .save(&store_of(burst("X", "ACC-X", at(10, 0), 2)))
        .unwrap();

    let rule = rule(&config, "burst_10min");
    let event = FlagDetectionStage::new(&config, &rule)
        .run(&RunClock::fixed(day()))
        .unwrap();
    assert_eq!(event.kind(), "no_flags_detected");

    let (schema, batches) = read_parquet(&rule.batch_path).unwrap();
    assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 0);
    assert!(schema.field_with_name("no_referensi").is_ok());
    assert!(schema.field_with_name("transaction_day").is_ok());
}

#[test]
fn stage_fails_without_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default_test(dir.path());
    let rule = rule(&config, "burst_10min");

    let err = FlagDetectionStage::new(&config, &rule)
        .run(&RunClock::fixed(day()))
        .unwrap_err();
    assert!(matches!(err, VelocityError::StoreMissing { .. }), "got {err}");
    assert!(!rule.batch_path.exists(), "no batch is written when the store is missing");
}
