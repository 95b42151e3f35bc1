//! In-memory transaction records and the flag-aware record set.
//!
//! RULE: A RecordSet's `flag_columns` is its schema. Every record answers
//! every listed column; a record without an entry reads as 0.
//!
//! Columns that are neither mapped transaction fields nor flags travel
//! through untouched as `extra_columns`; each record holds its own value
//! as a one-row array, and a record without one writes null.

use crate::types::{AccountNumber, FlagValue, ReferenceId, Timestamp, FLAG_UNSET};
use arrow::array::ArrayRef;
use arrow::datatypes::{Field, FieldRef};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub reference_id: ReferenceId,
    pub account_number: AccountNumber,
    pub timestamp: Timestamp,
    pub amount: f64,
    pub status: Option<i64>,
    pub state: Option<i64>,
    pub category: Option<String>,
    pub flags: BTreeMap<String, FlagValue>,
    /// Passthrough values keyed by column name, one row each.
    pub extra: BTreeMap<String, ArrayRef>,
}

impl TransactionRecord {
    pub fn new(
        reference_id: impl Into<ReferenceId>,
        account_number: impl Into<AccountNumber>,
        timestamp: Timestamp,
        amount: f64,
    ) -> Self {
        Self {
            reference_id: reference_id.into(),
            account_number: account_number.into(),
            timestamp,
            amount,
            status: None,
            state: None,
            category: None,
            flags: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_codes(mut self, status: i64, state: i64, category: impl Into<String>) -> Self {
        self.status = Some(status);
        self.state = Some(state);
        self.category = Some(category.into());
        self
    }

    pub fn with_flag(mut self, column: impl Into<String>, value: FlagValue) -> Self {
        self.flags.insert(column.into(), value);
        self
    }

    pub fn with_extra(mut self, column: impl Into<String>, value: ArrayRef) -> Self {
        self.extra.insert(column.into(), value);
        self
    }

    /// Value of a flag column; absent columns read as 0.
    pub fn flag(&self, column: &str) -> FlagValue {
        self.flags.get(column).copied().unwrap_or(FLAG_UNSET)
    }

    pub fn is_flagged(&self, column: &str) -> bool {
        self.flag(column) != FLAG_UNSET
    }
}

/// Which optional code columns (status, state, category) a set carries.
/// A store read without one of them is written back without it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeColumns {
    pub status: bool,
    pub state: bool,
    pub category: bool,
}

impl Default for CodeColumns {
    fn default() -> Self {
        Self {
            status: true,
            state: true,
            category: true,
        }
    }
}

impl CodeColumns {
    pub fn union(self, other: Self) -> Self {
        Self {
            status: self.status || other.status,
            state: self.state || other.state,
            category: self.category || other.category,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    pub flag_columns: Vec<String>,
    pub extra_columns: Vec<FieldRef>,
    pub codes: CodeColumns,
    pub records: Vec<TransactionRecord>,
}

impl RecordSet {
    pub fn new(flag_columns: Vec<String>, records: Vec<TransactionRecord>) -> Self {
        let mut set = Self {
            flag_columns: Vec::new(),
            extra_columns: Vec::new(),
            codes: CodeColumns::default(),
            records,
        };
        for column in flag_columns {
            set.ensure_flag_column(&column);
        }
        // Flags carried by records but not listed still belong to the schema.
        let carried: Vec<String> = set
            .records
            .iter()
            .flat_map(|r| r.flags.keys().cloned())
            .collect();
        for column in carried {
            set.ensure_flag_column(&column);
        }
        let extras: Vec<FieldRef> = set
            .records
            .iter()
            .flat_map(|r| r.extra.iter())
            .map(|(name, value)| Arc::new(Field::new(name, value.data_type().clone(), true)))
            .collect();
        for field in extras {
            set.ensure_extra_column(field);
        }
        set
    }

    pub fn empty(flag_columns: Vec<String>) -> Self {
        Self::new(flag_columns, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_flag_column(&self, column: &str) -> bool {
        self.flag_columns.iter().any(|c| c == column)
    }

    /// Add a flag column to the schema, backfilling 0 on every record
    /// that lacks it. Returns true if the column was new.
    pub fn ensure_flag_column(&mut self, column: &str) -> bool {
        let added = !self.has_flag_column(column);
        if added {
            self.flag_columns.push(column.to_string());
        }
        for record in &mut self.records {
            record.flags.entry(column.to_string()).or_insert(FLAG_UNSET);
        }
        added
    }

    pub fn extra_column(&self, name: &str) -> Option<&FieldRef> {
        self.extra_columns.iter().find(|f| f.name() == name)
    }

    /// Add a passthrough column unless one of that name exists already.
    /// The first declared type wins; values are cast to it on write.
    pub fn ensure_extra_column(&mut self, field: FieldRef) -> bool {
        if self.extra_column(field.name()).is_some() {
            return false;
        }
        self.extra_columns.push(field);
        true
    }

    pub fn reference_ids(&self) -> HashSet<&str> {
        self.records.iter().map(|r| r.reference_id.as_str()).collect()
    }

    /// Keep the first record per reference id. Returns how many were dropped.
    pub fn dedup_by_reference(&mut self) -> usize {
        let before = self.records.len();
        let mut seen: HashSet<ReferenceId> = HashSet::with_capacity(before);
        self.records.retain(|r| seen.insert(r.reference_id.clone()));
        before - self.records.len()
    }

    /// Count of records whose reference id occurs more than once.
    pub fn duplicate_reference_count(&self) -> usize {
        let mut seen: HashSet<&str> = HashSet::with_capacity(self.records.len());
        self.records
            .iter()
            .filter(|r| !seen.insert(r.reference_id.as_str()))
            .count()
    }

    /// Number of records with the given flag set.
    pub fn flagged_count(&self, column: &str) -> usize {
        self.records.iter().filter(|r| r.is_flagged(column)).count()
    }

    pub fn find(&self, reference_id: &str) -> Option<&TransactionRecord> {
        self.records.iter().find(|r| r.reference_id == reference_id)
    }

    /// Stable sort by (timestamp, account number, reference id).
    pub fn sort_chronologically(&mut self) {
        self.records.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.account_number.cmp(&b.account_number))
                .then_with(|| a.reference_id.cmp(&b.reference_id))
        });
    }
}
