//! Shared primitive types used across the entire pipeline.

use chrono::NaiveDateTime;

/// Globally unique transaction identifier. The merge and reconciliation key.
pub type ReferenceId = String;

/// Customer account number. The per-account grouping key for detection.
pub type AccountNumber = String;

/// Transaction timestamp. Local wall-clock time, no zone attached.
pub type Timestamp = NaiveDateTime;

/// A persisted flag value. 0 = not flagged, 1 = flagged.
pub type FlagValue = i8;

pub const FLAG_SET: FlagValue = 1;
pub const FLAG_UNSET: FlagValue = 0;
