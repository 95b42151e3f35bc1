//! Stage outcomes.
//!
//! RULE: Every stage run ends in exactly one StageEvent (or an error).
//! The runner prints events as JSON lines; variants are never reordered.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageEvent {
    // ── Historical update ──────────────────────────
    NoInputFiles {
        store: String,
    },
    HistoricalCreated {
        store: String,
        records: usize,
    },
    HistoricalMerged {
        store: String,
        added: usize,
        total: usize,
    },
    HistoricalUnchanged {
        store: String,
        incoming: usize,
    },

    // ── Flag detection ─────────────────────────────
    FlagsDetected {
        rule: String,
        flag_column: String,
        flagged: usize,
        accounts: usize,
        batch: String,
    },
    NoFlagsDetected {
        rule: String,
        batch: String,
    },

    // ── Flag reconciliation ────────────────────────
    FlagsReconciled {
        rule: String,
        flag_column: String,
        newly_flagged: usize,
    },
    ReconcileSkipped {
        rule: String,
        reason: SkipReason,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoBatchFile,
    EmptyBatch,
    AlreadyFlagged,
    NoMatchingRecords,
}

impl StageEvent {
    /// Stable name of the variant, matching its serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            StageEvent::NoInputFiles { .. }        => "no_input_files",
            StageEvent::HistoricalCreated { .. }   => "historical_created",
            StageEvent::HistoricalMerged { .. }    => "historical_merged",
            StageEvent::HistoricalUnchanged { .. } => "historical_unchanged",
            StageEvent::FlagsDetected { .. }       => "flags_detected",
            StageEvent::NoFlagsDetected { .. }     => "no_flags_detected",
            StageEvent::FlagsReconciled { .. }     => "flags_reconciled",
            StageEvent::ReconcileSkipped { .. }    => "reconcile_skipped",
        }
    }

    /// True when the stage replaced the historical store file.
    pub fn rewrote_store(&self) -> bool {
        matches!(
            self,
            StageEvent::HistoricalCreated { .. }
                | StageEvent::HistoricalMerged { .. }
                | StageEvent::FlagsReconciled { .. }
        )
    }
}
