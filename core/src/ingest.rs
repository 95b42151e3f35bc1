//! Daily file ingestion.
//!
//! RULE: Ingestion only reads. It turns the last `n_days` delimited
//! daily files into one filtered, time-sorted RecordSet and hands it
//! to historical_merge; it never touches the store.
//!
//! `usecols` entries beyond the mapped transaction columns are kept as
//! Utf8 passthrough columns, with null markers read as null.

use crate::{
    config::{ColumnMap, FilterConfig, IngestionConfig, PipelineConfig},
    error::{VelocityError, VelocityResult},
    record::{RecordSet, TransactionRecord},
    types::Timestamp,
};
use arrow::array::{Array, ArrayRef, AsArray, RecordBatch, StringArray};
use arrow::csv::ReaderBuilder;
use arrow::datatypes::{DataType, Field, FieldRef, Schema};
use chrono::{Days, NaiveDate, NaiveDateTime};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

pub struct DailyFileSource {
    ingestion: IngestionConfig,
    columns: ColumnMap,
    filter: FilterConfig,
}

impl DailyFileSource {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            ingestion: config.ingestion.clone(),
            columns: config.columns.clone(),
            filter: config.filter.clone(),
        }
    }

    /// Candidate file paths, today first.
    pub fn daily_paths(&self, today: NaiveDate) -> Vec<PathBuf> {
        let cfg = &self.ingestion;
        (0..cfg.n_days)
            .filter_map(|i| today.checked_sub_days(Days::new(u64::from(i))))
            .map(|day| {
                cfg.input_folder.join(format!(
                    "{}{}{}",
                    cfg.file_prefix,
                    day.format(&cfg.date_format),
                    cfg.file_suffix
                ))
            })
            .collect()
    }

    /// Read, filter and sort every available daily file.
    /// `None` when not a single file exists.
    pub fn load(&self, today: NaiveDate) -> VelocityResult<Option<RecordSet>> {
        let mut records = Vec::new();
        let mut found = 0usize;
        for path in self.daily_paths(today) {
            if !path.is_file() {
                log::warn!("Daily file not found, skipping: {}", path.display());
                continue;
            }
            found += 1;
            let rows = self.read_daily_file(&path)?;
            let read = rows.len();
            records.extend(rows.into_iter().filter(|r| self.accepts(r)));
            log::info!("Read {read} rows from {}", path.display());
        }
        if found == 0 {
            log::warn!("No daily files found under {}", self.ingestion.input_folder.display());
            return Ok(None);
        }

        records.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.account_number.cmp(&b.account_number))
        });
        log::info!("{} rows passed the status/state/category filter", records.len());
        let mut set = RecordSet::new(Vec::new(), records);
        for field in self.extra_fields() {
            set.ensure_extra_column(field);
        }
        Ok(Some(set))
    }

    /// Passthrough columns, in `usecols` order.
    pub fn extra_fields(&self) -> Vec<FieldRef> {
        self.ingestion
            .usecols
            .iter()
            .filter(|name| !self.columns.is_transaction_column(name))
            .map(|name| Arc::new(Field::new(name, DataType::Utf8, true)))
            .collect()
    }

    /// Parse one delimited file. The header row is discarded and the
    /// configured `usecols` name the columns by position.
    pub fn read_daily_file(&self, path: &Path) -> VelocityResult<Vec<TransactionRecord>> {
        let origin = path.display().to_string();
        let delimiter = u8::try_from(self.ingestion.delimiter).map_err(|_| {
            VelocityError::Validation(format!(
                "delimiter {:?} is not a single-byte character",
                self.ingestion.delimiter
            ))
        })?;
        let schema = Arc::new(Schema::new(
            self.ingestion
                .usecols
                .iter()
                .map(|name| Field::new(name, DataType::Utf8, true))
                .collect::<Vec<_>>(),
        ));

        let reader = ReaderBuilder::new(schema)
            .with_header(true)
            .with_delimiter(delimiter)
            .build(File::open(path)?)?;

        let mut records = Vec::new();
        // Line 1 is the header.
        let mut first_line = 2usize;
        for batch in reader {
            let batch = batch.map_err(|e| VelocityError::schema(&origin, e.to_string()))?;
            let rows = RowParser::new(self, &batch, &origin)?;
            for row in 0..batch.num_rows() {
                records.push(rows.parse(row, first_line + row)?);
            }
            first_line += batch.num_rows();
        }
        Ok(records)
    }

    fn accepts(&self, record: &TransactionRecord) -> bool {
        fn allowed<T: PartialEq>(list: &[T], value: Option<&T>) -> bool {
            list.is_empty() || value.is_some_and(|v| list.contains(v))
        }
        allowed(&self.filter.transaction_status, record.status.as_ref())
            && allowed(&self.filter.transaction_state, record.state.as_ref())
            && allowed(&self.filter.transaction_category, record.category.as_ref())
    }
}

// ── Row parsing ────────────────────────────────────────────────────

struct RowParser<'a> {
    source: &'a DailyFileSource,
    origin: &'a str,
    reference_id: &'a StringArray,
    account_number: &'a StringArray,
    timestamp: &'a StringArray,
    amount: &'a StringArray,
    status: &'a StringArray,
    state: &'a StringArray,
    category: &'a StringArray,
    extras: Vec<(&'a str, ArrayRef)>,
}

impl<'a> RowParser<'a> {
    fn new(source: &'a DailyFileSource, batch: &'a RecordBatch, origin: &'a str) -> VelocityResult<Self> {
        let column = |name: &str| -> VelocityResult<&'a StringArray> {
            batch
                .column_by_name(name)
                .map(|a| a.as_string::<i32>())
                .ok_or_else(|| VelocityError::MissingColumn {
                    column: name.to_string(),
                    origin: origin.to_string(),
                })
        };
        let c = &source.columns;
        let null_values = &source.ingestion.null_values;
        let mut extras = Vec::new();
        for name in source.ingestion.usecols.iter().filter(|n| !c.is_transaction_column(n)) {
            let cleaned: StringArray = column(name)?
                .iter()
                .map(|v| v.map(str::trim).filter(|v| !null_values.iter().any(|n| n.as_str() == *v)))
                .collect();
            extras.push((name.as_str(), Arc::new(cleaned) as ArrayRef));
        }
        Ok(Self {
            source,
            origin,
            reference_id: column(&c.reference_id)?,
            account_number: column(&c.account_number)?,
            timestamp: column(&c.timestamp)?,
            amount: column(&c.amount)?,
            status: column(&c.status)?,
            state: column(&c.state)?,
            category: column(&c.category)?,
            extras,
        })
    }

    /// Trimmed cell text, or None for nulls and configured null markers.
    fn cell(&self, array: &'a StringArray, row: usize) -> Option<&'a str> {
        if array.is_null(row) {
            return None;
        }
        let value = array.value(row).trim();
        let null_values = &self.source.ingestion.null_values;
        (!null_values.iter().any(|n| n == value)).then_some(value)
    }

    fn error(&self, line: usize, column: &str, message: impl std::fmt::Display) -> VelocityError {
        VelocityError::schema(self.origin, format!("line {line}, column '{column}': {message}"))
    }

    fn required(&self, array: &'a StringArray, row: usize, line: usize, column: &str) -> VelocityResult<&'a str> {
        self.cell(array, row)
            .ok_or_else(|| self.error(line, column, "required value is missing"))
    }

    fn optional<T: FromStr>(&self, array: &'a StringArray, row: usize, line: usize, column: &str) -> VelocityResult<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        self.cell(array, row)
            .map(|v| v.parse::<T>().map_err(|e| self.error(line, column, format!("'{v}': {e}"))))
            .transpose()
    }

    fn parse(&self, row: usize, line: usize) -> VelocityResult<TransactionRecord> {
        let c = &self.source.columns;
        let reference_id = self.required(self.reference_id, row, line, &c.reference_id)?;
        let account_number = self.required(self.account_number, row, line, &c.account_number)?;

        let raw_ts = self.required(self.timestamp, row, line, &c.timestamp)?;
        let timestamp: Timestamp =
            NaiveDateTime::parse_from_str(raw_ts, &self.source.ingestion.datetime_format)
                .map_err(|e| self.error(line, &c.timestamp, format!("'{raw_ts}': {e}")))?;

        let raw_amount = self.required(self.amount, row, line, &c.amount)?;
        let amount: f64 = raw_amount
            .parse()
            .map_err(|e| self.error(line, &c.amount, format!("'{raw_amount}': {e}")))?;
        if !amount.is_finite() {
            return Err(self.error(line, &c.amount, format!("'{raw_amount}' is not a finite amount")));
        }

        let mut record = TransactionRecord::new(reference_id, account_number, timestamp, amount);
        record.status = self.optional(self.status, row, line, &c.status)?;
        record.state = self.optional(self.state, row, line, &c.state)?;
        record.category = self.cell(self.category, row).map(str::to_string);
        for (name, values) in &self.extras {
            record.extra.insert(name.to_string(), values.slice(row, 1));
        }
        Ok(record)
    }
}
