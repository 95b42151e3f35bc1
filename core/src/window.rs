//! Rolling-window kernels over a single account's records.
//!
//! Every function takes timestamps sorted ascending. The window anchored
//! at record i is the half-open span (ts[i] - width, ts[i]], so records
//! sharing ts[i] are always inside it, including ones sorted after i.

use crate::types::Timestamp;
use chrono::Duration;

/// Index of the first timestamp strictly after `t`.
fn end_of(timestamps: &[Timestamp], t: Timestamp) -> usize {
    timestamps.partition_point(|x| *x <= t)
}

/// Index range of the window (ts[i] - width, ts[i]].
fn window_range(timestamps: &[Timestamp], i: usize, width: Duration) -> (usize, usize) {
    let anchor = timestamps[i];
    let start = timestamps.partition_point(|x| *x <= anchor - width);
    (start, end_of(timestamps, anchor))
}

fn debug_assert_sorted(timestamps: &[Timestamp]) {
    debug_assert!(
        timestamps.windows(2).all(|w| w[0] <= w[1]),
        "window kernels require ascending timestamps"
    );
}

/// Number of records in each record's rolling window.
pub fn rolling_counts(timestamps: &[Timestamp], window: Duration) -> Vec<usize> {
    debug_assert_sorted(timestamps);
    (0..timestamps.len())
        .map(|i| {
            let (start, end) = window_range(timestamps, i, window);
            end - start
        })
        .collect()
}

/// prefix[k] is the sum of amounts[..k].
fn prefix_sums(amounts: &[f64]) -> Vec<f64> {
    let mut prefix = Vec::with_capacity(amounts.len() + 1);
    prefix.push(0.0);
    let mut total = 0.0;
    for amount in amounts {
        total += amount;
        prefix.push(total);
    }
    prefix
}

/// Sum of `amounts` over each record's rolling window.
pub fn rolling_sums(timestamps: &[Timestamp], amounts: &[f64], lookback: Duration) -> Vec<f64> {
    debug_assert_sorted(timestamps);
    debug_assert_eq!(timestamps.len(), amounts.len());
    let prefix = prefix_sums(amounts);
    (0..timestamps.len())
        .map(|i| {
            let (start, end) = window_range(timestamps, i, lookback);
            prefix[end] - prefix[start]
        })
        .collect()
}

/// Turn a list of inclusive-exclusive index spans into a per-record mask.
fn cover(len: usize, spans: impl IntoIterator<Item = (usize, usize)>) -> Vec<bool> {
    let mut delta = vec![0i64; len + 1];
    for (start, end) in spans {
        if start < end {
            delta[start] += 1;
            delta[end] -= 1;
        }
    }
    let mut depth = 0i64;
    delta[..len]
        .iter()
        .map(|d| {
            depth += d;
            depth > 0
        })
        .collect()
}

/// Count-based burst marking.
///
/// A record is a burst point when its rolling count over `window` reaches
/// `threshold`. Every record within [bp - marking_span, bp] of any burst
/// point is marked.
pub fn count_burst_marks(
    timestamps: &[Timestamp],
    window: Duration,
    threshold: usize,
    marking_span: Duration,
) -> Vec<bool> {
    let counts = rolling_counts(timestamps, window);
    let spans = counts
        .iter()
        .enumerate()
        .filter(|(_, count)| **count >= threshold)
        .map(|(i, _)| {
            let anchor = timestamps[i];
            let start = timestamps.partition_point(|x| *x < anchor - marking_span);
            (start, end_of(timestamps, anchor))
        });
    cover(timestamps.len(), spans)
}

/// Value-sum burst marking.
///
/// A window whose amount sum reaches `threshold` is triggering; every
/// record that contributed to a triggering window is marked.
pub fn value_burst_marks(
    timestamps: &[Timestamp],
    amounts: &[f64],
    lookback: Duration,
    threshold: f64,
) -> Vec<bool> {
    debug_assert_sorted(timestamps);
    debug_assert_eq!(timestamps.len(), amounts.len());
    let prefix = prefix_sums(amounts);
    let spans = (0..timestamps.len()).filter_map(|i| {
        let (start, end) = window_range(timestamps, i, lookback);
        (prefix[end] - prefix[start] >= threshold).then_some((start, end))
    });
    cover(timestamps.len(), spans)
}
