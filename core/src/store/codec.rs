//! Arrow/Parquet encoding of record sets.
//!
//! On-disk layout: the mapped transaction columns, the passthrough
//! columns, one Int8 column per flag, then (batch files only) a Date32
//! calendar-day column. A column is a flag only when its name is a known
//! flag column; every other unmapped column is carried through as-is.

use crate::{
    config::ColumnMap,
    error::{VelocityError, VelocityResult},
    record::{CodeColumns, RecordSet, TransactionRecord},
    store::atomic::replace_atomically,
    types::Timestamp,
};
use arrow::array::{
    new_empty_array, new_null_array, Array, ArrayRef, AsArray, Date32Array, Float64Array,
    Int64Array, Int8Array, RecordBatch, StringArray, TimestampMicrosecondArray,
};
use arrow::compute::{cast, cast_with_options, concat, CastOptions};
use arrow::datatypes::{
    DataType, Field, FieldRef, Float64Type, Int64Type, Int8Type, Schema, SchemaRef, TimeUnit,
    TimestampMicrosecondType,
};
use chrono::{DateTime, NaiveDate, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

const ZSTD_LEVEL: i32 = 3;

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, None)
}

fn epoch_day() -> NaiveDate {
    DateTime::<Utc>::UNIX_EPOCH.date_naive()
}

fn timestamp_from_micros(micros: i64) -> Option<Timestamp> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos).map(|dt| dt.naive_utc())
}

pub struct RecordCodec<'a> {
    columns: &'a ColumnMap,
}

impl<'a> RecordCodec<'a> {
    pub fn new(columns: &'a ColumnMap) -> Self {
        Self { columns }
    }

    pub fn schema(&self, set: &RecordSet, temp_date_column: Option<&str>) -> SchemaRef {
        let c = self.columns;
        let mut fields = vec![
            Field::new(&c.reference_id, DataType::Utf8, false),
            Field::new(&c.account_number, DataType::Utf8, false),
            Field::new(&c.timestamp, timestamp_type(), false),
            Field::new(&c.amount, DataType::Float64, false),
        ];
        if set.codes.status {
            fields.push(Field::new(&c.status, DataType::Int64, true));
        }
        if set.codes.state {
            fields.push(Field::new(&c.state, DataType::Int64, true));
        }
        if set.codes.category {
            fields.push(Field::new(&c.category, DataType::Utf8, true));
        }
        fields.extend(
            set.extra_columns
                .iter()
                .map(|f| Field::new(f.name(), f.data_type().clone(), true)),
        );
        fields.extend(
            set.flag_columns
                .iter()
                .map(|flag| Field::new(flag, DataType::Int8, false)),
        );
        if let Some(temp) = temp_date_column {
            fields.push(Field::new(temp, DataType::Date32, false));
        }
        Arc::new(Schema::new(fields))
    }

    pub fn to_batch(
        &self,
        set: &RecordSet,
        temp_date_column: Option<&str>,
    ) -> VelocityResult<RecordBatch> {
        let records = &set.records;
        let mut arrays: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.reference_id.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.account_number.as_str()),
            )),
            Arc::new(TimestampMicrosecondArray::from_iter_values(
                records.iter().map(|r| r.timestamp.and_utc().timestamp_micros()),
            )),
            Arc::new(Float64Array::from_iter_values(records.iter().map(|r| r.amount))),
        ];
        if set.codes.status {
            arrays.push(Arc::new(records.iter().map(|r| r.status).collect::<Int64Array>()));
        }
        if set.codes.state {
            arrays.push(Arc::new(records.iter().map(|r| r.state).collect::<Int64Array>()));
        }
        if set.codes.category {
            arrays.push(Arc::new(
                records
                    .iter()
                    .map(|r| r.category.as_deref())
                    .collect::<StringArray>(),
            ));
        }
        for field in &set.extra_columns {
            arrays.push(extra_array(field, records)?);
        }
        for flag in &set.flag_columns {
            arrays.push(Arc::new(Int8Array::from_iter_values(
                records.iter().map(|r| r.flag(flag)),
            )));
        }
        if temp_date_column.is_some() {
            let epoch = epoch_day();
            arrays.push(Arc::new(Date32Array::from_iter_values(records.iter().map(
                |r| (r.timestamp.date() - epoch).num_days() as i32,
            ))));
        }

        let batch = RecordBatch::try_new(self.schema(set, temp_date_column), arrays)?;
        Ok(batch)
    }

    /// Decode batches read from `origin`. Required columns: reference id,
    /// account, timestamp, amount. Status/state/category are optional.
    /// Columns named in `known_flags` are flags; any other unmapped
    /// column is passthrough.
    pub fn from_batches(
        &self,
        schema: &Schema,
        batches: &[RecordBatch],
        known_flags: &[String],
        origin: &str,
    ) -> VelocityResult<RecordSet> {
        let c = self.columns;
        for required in [&c.reference_id, &c.account_number, &c.timestamp, &c.amount] {
            if schema.field_with_name(required).is_err() {
                return Err(VelocityError::MissingColumn {
                    column: required.clone(),
                    origin: origin.to_string(),
                });
            }
        }
        let mut flag_columns = Vec::new();
        let mut extra_columns: Vec<FieldRef> = Vec::new();
        for field in schema.fields() {
            if c.is_transaction_column(field.name()) {
                continue;
            }
            if known_flags.contains(field.name()) {
                flag_columns.push(field.name().clone());
            } else {
                extra_columns.push(Arc::new(Field::new(
                    field.name(),
                    field.data_type().clone(),
                    true,
                )));
            }
        }

        let mut records = Vec::with_capacity(batches.iter().map(RecordBatch::num_rows).sum());
        for batch in batches {
            self.decode_batch(batch, &flag_columns, &extra_columns, origin, &mut records)?;
        }
        let mut set = RecordSet::new(flag_columns, records);
        set.extra_columns = extra_columns;
        set.codes = CodeColumns {
            status: schema.field_with_name(&c.status).is_ok(),
            state: schema.field_with_name(&c.state).is_ok(),
            category: schema.field_with_name(&c.category).is_ok(),
        };
        Ok(set)
    }

    fn decode_batch(
        &self,
        batch: &RecordBatch,
        flag_columns: &[String],
        extra_columns: &[FieldRef],
        origin: &str,
        out: &mut Vec<TransactionRecord>,
    ) -> VelocityResult<()> {
        let c = self.columns;
        let refs = required_column(batch, &c.reference_id, &DataType::Utf8, origin)?;
        let accounts = required_column(batch, &c.account_number, &DataType::Utf8, origin)?;
        let timestamps = required_column(batch, &c.timestamp, &timestamp_type(), origin)?;
        let amounts = required_column(batch, &c.amount, &DataType::Float64, origin)?;
        let status = optional_column(batch, &c.status, &DataType::Int64, origin)?;
        let state = optional_column(batch, &c.state, &DataType::Int64, origin)?;
        let category = optional_column(batch, &c.category, &DataType::Utf8, origin)?;
        let flags: Vec<(&String, ArrayRef)> = flag_columns
            .iter()
            .map(|f| -> VelocityResult<(&String, ArrayRef)> {
                Ok((f, required_column(batch, f, &DataType::Int8, origin)?))
            })
            .collect::<VelocityResult<_>>()?;
        let extras: Vec<(&String, &ArrayRef)> = extra_columns
            .iter()
            .filter_map(|f| batch.column_by_name(f.name()).map(|a| (f.name(), a)))
            .collect();

        let refs = refs.as_string::<i32>();
        let accounts = accounts.as_string::<i32>();
        let timestamps = timestamps.as_primitive::<TimestampMicrosecondType>();
        let amounts = amounts.as_primitive::<Float64Type>();
        let status = status.as_ref().map(|a| a.as_primitive::<Int64Type>());
        let state = state.as_ref().map(|a| a.as_primitive::<Int64Type>());
        let category = category.as_ref().map(|a| a.as_string::<i32>());

        for row in 0..batch.num_rows() {
            for (name, array) in [
                (&c.reference_id, refs as &dyn Array),
                (&c.account_number, accounts as &dyn Array),
                (&c.timestamp, timestamps as &dyn Array),
                (&c.amount, amounts as &dyn Array),
            ] {
                if array.is_null(row) {
                    return Err(VelocityError::schema(
                        origin,
                        format!("row {row}: required column '{name}' is null"),
                    ));
                }
            }
            let micros = timestamps.value(row);
            let timestamp = timestamp_from_micros(micros).ok_or_else(|| {
                VelocityError::schema(origin, format!("row {row}: timestamp {micros} out of range"))
            })?;

            let mut record_flags = BTreeMap::new();
            for (name, array) in &flags {
                let array = array.as_primitive::<Int8Type>();
                let value = if array.is_null(row) { 0 } else { array.value(row) };
                record_flags.insert((*name).clone(), value);
            }
            let record_extra: BTreeMap<String, ArrayRef> = extras
                .iter()
                .map(|(name, array)| ((*name).clone(), array.slice(row, 1)))
                .collect();

            out.push(TransactionRecord {
                reference_id: refs.value(row).to_string(),
                account_number: accounts.value(row).to_string(),
                timestamp,
                amount: amounts.value(row),
                status: status.and_then(|a| (!a.is_null(row)).then(|| a.value(row))),
                state: state.and_then(|a| (!a.is_null(row)).then(|| a.value(row))),
                category: category.and_then(|a| (!a.is_null(row)).then(|| a.value(row).to_string())),
                flags: record_flags,
                extra: record_extra,
            });
        }
        Ok(())
    }
}

/// Reassemble one passthrough column from the records' one-row values.
/// Records without a value write null; values of another type are cast
/// to the column's type, and a value that does not convert is an error.
fn extra_array(field: &Field, records: &[TransactionRecord]) -> VelocityResult<ArrayRef> {
    let to = field.data_type();
    if records.is_empty() {
        return Ok(new_empty_array(to));
    }
    let null = new_null_array(to, 1);
    let strict = CastOptions {
        safe: false,
        ..Default::default()
    };
    let parts = records
        .iter()
        .map(|r| match r.extra.get(field.name()) {
            None => Ok(null.clone()),
            Some(value) if value.data_type() == to => Ok(value.clone()),
            Some(value) => cast_with_options(value, to, &strict).map_err(|e| {
                VelocityError::schema(
                    &r.reference_id,
                    format!("column '{}' value cannot be written as {to}: {e}", field.name()),
                )
            }),
        })
        .collect::<VelocityResult<Vec<ArrayRef>>>()?;
    let parts: Vec<&dyn Array> = parts.iter().map(|a| a.as_ref()).collect();
    Ok(concat(&parts)?)
}

/// Fetch `name` from `batch` and cast it to `to`. Absent → MissingColumn,
/// not castable → Schema.
pub(crate) fn required_column(
    batch: &RecordBatch,
    name: &str,
    to: &DataType,
    origin: &str,
) -> VelocityResult<ArrayRef> {
    optional_column(batch, name, to, origin)?.ok_or_else(|| VelocityError::MissingColumn {
        column: name.to_string(),
        origin: origin.to_string(),
    })
}

pub(crate) fn optional_column(
    batch: &RecordBatch,
    name: &str,
    to: &DataType,
    origin: &str,
) -> VelocityResult<Option<ArrayRef>> {
    let Some(array) = batch.column_by_name(name) else {
        return Ok(None);
    };
    if array.data_type() == to {
        return Ok(Some(array.clone()));
    }
    cast(array, to).map(Some).map_err(|e| {
        VelocityError::schema(
            origin,
            format!("column '{name}' of type {} cannot be read as {to}: {e}", array.data_type()),
        )
    })
}

/// Read a whole Parquet file. The schema is returned separately so that
/// files with zero rows still expose their columns.
pub fn read_parquet(path: &Path) -> VelocityResult<(SchemaRef, Vec<RecordBatch>)> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let schema = builder.schema().clone();
    let batches = builder.build()?.collect::<Result<Vec<_>, _>>()?;
    Ok((schema, batches))
}

/// Write `batch` as zstd-compressed Parquet through the atomic writer.
/// An empty batch still produces a file carrying the full schema.
pub fn write_parquet_atomically(dest: &Path, batch: &RecordBatch) -> VelocityResult<()> {
    replace_atomically(dest, |file| {
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::try_new(ZSTD_LEVEL)?))
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
        if batch.num_rows() > 0 {
            writer.write(batch)?;
        }
        writer.close()?;
        Ok(())
    })
}
