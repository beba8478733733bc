//! In-memory tabular datasets
//!
//! A [`Dataset`] is a named, ordered set of typed columns plus rows of
//! [`Value`]s. Stores read and write datasets; builders convert them to Arrow
//! record batches for [`crate::engine::QueryEngine`] and back.
//!
//! Column lookup is case-insensitive, the same way unquoted SQL identifiers
//! fold, so `ProductID` and `productid` name the same column.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use datafusion::arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Date32Array, Decimal128Array, Float64Array,
    Int64Array, StringArray, TimestampMicrosecondArray,
};
use datafusion::arrow::compute::cast;
use datafusion::arrow::datatypes::{
    DataType as ArrowType, Date32Type, Decimal128Type, Field, Float64Type, Int64Type, Schema,
    TimeUnit, TimestampMicrosecondType,
};
use datafusion::arrow::record_batch::{RecordBatch, RecordBatchOptions};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EtlError, EtlResult};

/// Logical column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 32-bit integer
    Integer,
    /// 64-bit integer
    BigInt,
    /// Auto-increment 32-bit integer, assigned by the store
    Serial,
    /// Exact decimal
    Numeric,
    /// Double precision float
    Double,
    Text,
    Date,
    Timestamp,
    Boolean,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Integer => "integer",
            DataType::BigInt => "bigint",
            DataType::Serial => "serial",
            DataType::Numeric => "numeric",
            DataType::Double => "double",
            DataType::Text => "text",
            DataType::Date => "date",
            DataType::Timestamp => "timestamp",
            DataType::Boolean => "boolean",
        };
        write!(f, "{}", name)
    }
}

/// A single cell
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view of the value
    ///
    /// Decimals and floats convert only when they carry no fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Decimal(d) if d.fract().is_zero() => i64::try_from(*d).ok(),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    /// Exact decimal view of the value
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Int(i) => Some(Decimal::from(*i)),
            Value::Decimal(d) => Some(*d),
            Value::Float(f) => Decimal::try_from(*f).ok(),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Calendar date view of the value
    ///
    /// Timestamps are truncated to their date; text is accepted in ISO form.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::Timestamp(ts) => Some(ts.date()),
            Value::Text(s) => {
                let s = s.trim();
                NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d").ok()
            }
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Stable text encoding used for fingerprints
    fn canonical(&self) -> String {
        match self {
            Value::Null => "\u{0}".to_string(),
            Value::Decimal(d) => d.normalize().to_string(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Text(s) => write!(f, "{}", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Named in-memory table
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    name: String,
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl Dataset {
    /// Create an empty dataset
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    /// Create a dataset from rows, checking every row has one value per column
    pub fn with_rows(
        name: impl Into<String>,
        columns: Vec<Column>,
        rows: Vec<Vec<Value>>,
    ) -> EtlResult<Self> {
        let mut dataset = Self::new(name, columns);
        for row in rows {
            dataset.push_row(row)?;
        }
        Ok(dataset)
    }

    /// Rename the dataset
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Append a row
    pub fn push_row(&mut self, row: Vec<Value>) -> EtlResult<()> {
        if row.len() != self.columns.len() {
            return Err(EtlError::Config(format!(
                "Row width {} does not match {} columns of {}",
                row.len(),
                self.columns.len(),
                self.name
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Case-insensitive column position
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Column position, or a schema mismatch naming this dataset
    pub fn require_column(&self, name: &str) -> EtlResult<usize> {
        self.column_index(name)
            .ok_or_else(|| EtlError::schema_mismatch(&self.name, name))
    }

    /// Value at `row`, `column`, `None` when either is out of range
    pub fn value(&self, row: usize, column: usize) -> Option<&Value> {
        self.rows.get(row).and_then(|r| r.get(column))
    }

    /// Keep rows matching the predicate, returning how many were removed
    pub fn retain_rows(&mut self, mut keep: impl FnMut(&[Value]) -> bool) -> usize {
        let before = self.rows.len();
        self.rows.retain(|row| keep(row));
        before - self.rows.len()
    }

    /// Distinct non-null integer values of a column
    pub fn distinct_ints(&self, column: &str) -> EtlResult<HashSet<i64>> {
        let idx = self.require_column(column)?;
        Ok(self.rows.iter().filter_map(|r| r[idx].as_i64()).collect())
    }

    /// Order-independent SHA-256 digest of column names and row contents
    ///
    /// Two datasets with the same columns and the same multiset of rows share
    /// a fingerprint, whatever order a store returned them in.
    pub fn fingerprint(&self) -> String {
        let mut row_hashes: Vec<[u8; 32]> = self
            .rows
            .iter()
            .map(|row| {
                let mut hasher = Sha256::new();
                for value in row {
                    hasher.update(value.canonical().as_bytes());
                    hasher.update([0x1f]);
                }
                hasher.finalize().into()
            })
            .collect();
        row_hashes.sort_unstable();

        let mut hasher = Sha256::new();
        for col in &self.columns {
            hasher.update(col.name.to_ascii_lowercase().as_bytes());
            hasher.update([0x1e]);
        }
        for h in &row_hashes {
            hasher.update(h);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Widest precision Arrow's Decimal128 holds
const DECIMAL_PRECISION: u8 = 38;

/// Widest scale a [`Decimal`] holds
const MAX_DECIMAL_SCALE: u32 = 28;

impl Dataset {
    /// Convert to a single Arrow record batch
    ///
    /// Field names are lowercased so unquoted SQL identifiers resolve.
    /// Integers widen to Int64. A NUMERIC column becomes Decimal128 at the
    /// widest scale found in it.
    pub fn to_record_batch(&self) -> EtlResult<RecordBatch> {
        let mut fields = Vec::with_capacity(self.columns.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.columns.len());
        for (idx, column) in self.columns.iter().enumerate() {
            let array = self.column_array(idx, column.data_type)?;
            fields.push(Field::new(
                column.name.to_ascii_lowercase(),
                array.data_type().clone(),
                true,
            ));
            arrays.push(array);
        }

        let options = RecordBatchOptions::new().with_row_count(Some(self.rows.len()));
        Ok(RecordBatch::try_new_with_options(
            Arc::new(Schema::new(fields)),
            arrays,
            &options,
        )?)
    }

    fn column_array(&self, idx: usize, data_type: DataType) -> EtlResult<ArrayRef> {
        let array: ArrayRef = match data_type {
            DataType::Integer | DataType::BigInt | DataType::Serial => Arc::new(
                self.rows
                    .iter()
                    .map(|row| self.cell(row, idx, Value::as_i64))
                    .collect::<EtlResult<Int64Array>>()?,
            ),
            DataType::Double => Arc::new(
                self.rows
                    .iter()
                    .map(|row| {
                        self.cell(row, idx, |v| match v {
                            Value::Float(f) => Some(*f),
                            other => other.as_decimal().and_then(|d| d.to_f64()),
                        })
                    })
                    .collect::<EtlResult<Float64Array>>()?,
            ),
            DataType::Numeric => {
                let scale = self
                    .rows
                    .iter()
                    .filter_map(|row| row[idx].as_decimal())
                    .map(|d| d.scale())
                    .max()
                    .unwrap_or(0)
                    .min(MAX_DECIMAL_SCALE);
                let array = self
                    .rows
                    .iter()
                    .map(|row| {
                        self.cell(row, idx, |v| {
                            v.as_decimal().map(|mut d| {
                                d.rescale(scale);
                                d.mantissa()
                            })
                        })
                    })
                    .collect::<EtlResult<Decimal128Array>>()?
                    .with_precision_and_scale(DECIMAL_PRECISION, scale as i8)?;
                Arc::new(array)
            }
            DataType::Text => Arc::new(
                self.rows
                    .iter()
                    .map(|row| {
                        self.cell(row, idx, |v| match v {
                            Value::Text(s) => Some(s.clone()),
                            other => Some(other.to_string()),
                        })
                    })
                    .collect::<EtlResult<StringArray>>()?,
            ),
            DataType::Boolean => Arc::new(
                self.rows
                    .iter()
                    .map(|row| {
                        self.cell(row, idx, |v| match v {
                            Value::Bool(b) => Some(*b),
                            _ => None,
                        })
                    })
                    .collect::<EtlResult<BooleanArray>>()?,
            ),
            DataType::Date => Arc::new(
                self.rows
                    .iter()
                    .map(|row| self.cell(row, idx, |v| v.as_date().map(days_since_epoch)))
                    .collect::<EtlResult<Date32Array>>()?,
            ),
            DataType::Timestamp => Arc::new(
                self.rows
                    .iter()
                    .map(|row| {
                        self.cell(row, idx, |v| {
                            let ts = match v {
                                Value::Timestamp(ts) => Some(*ts),
                                other => other.as_date().and_then(|d| d.and_hms_opt(0, 0, 0)),
                            };
                            ts.map(|ts| ts.and_utc().timestamp_micros())
                        })
                    })
                    .collect::<EtlResult<TimestampMicrosecondArray>>()?,
            ),
        };
        Ok(array)
    }

    /// One cell through `view`; NULL stays NULL, anything `view` rejects is an error
    fn cell<T>(
        &self,
        row: &[Value],
        idx: usize,
        view: impl Fn(&Value) -> Option<T>,
    ) -> EtlResult<Option<T>> {
        let value = &row[idx];
        if value.is_null() {
            return Ok(None);
        }
        view(value).map(Some).ok_or_else(|| {
            EtlError::Query(format!(
                "Cannot read {:?} as {} in column {} of {}",
                value, self.columns[idx].data_type, self.columns[idx].name, self.name
            ))
        })
    }

    /// Build a dataset from query results
    pub fn from_record_batches(
        name: impl Into<String>,
        schema: &Schema,
        batches: &[RecordBatch],
    ) -> EtlResult<Self> {
        let columns = schema
            .fields()
            .iter()
            .map(|f| Column::new(f.name(), column_type(f.data_type())))
            .collect();
        let mut dataset = Self::new(name, columns);

        for batch in batches {
            let values = batch
                .columns()
                .iter()
                .map(array_values)
                .collect::<EtlResult<Vec<_>>>()?;
            for row in 0..batch.num_rows() {
                dataset.push_row(values.iter().map(|col| col[row].clone()).collect())?;
            }
        }
        Ok(dataset)
    }
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    (date - epoch).num_days() as i32
}

/// Logical type for an Arrow column
fn column_type(arrow: &ArrowType) -> DataType {
    match arrow {
        ArrowType::Boolean => DataType::Boolean,
        ArrowType::Int8
        | ArrowType::Int16
        | ArrowType::Int32
        | ArrowType::UInt8
        | ArrowType::UInt16 => DataType::Integer,
        t if t.is_integer() => DataType::BigInt,
        t if t.is_floating() => DataType::Double,
        ArrowType::Decimal128(_, _) | ArrowType::Decimal256(_, _) => DataType::Numeric,
        ArrowType::Date32 | ArrowType::Date64 => DataType::Date,
        ArrowType::Timestamp(_, _) => DataType::Timestamp,
        _ => DataType::Text,
    }
}

fn array_values(array: &ArrayRef) -> EtlResult<Vec<Value>> {
    let len = array.len();
    let values: Vec<Value> = match array.data_type() {
        ArrowType::Null => vec![Value::Null; len],
        ArrowType::Boolean => {
            let a = array.as_boolean();
            (0..len)
                .map(|i| if a.is_null(i) { Value::Null } else { Value::Bool(a.value(i)) })
                .collect()
        }
        ArrowType::Decimal128(_, scale) => {
            let scale = u32::try_from(*scale)
                .map_err(|_| EtlError::Query(format!("Negative decimal scale {}", scale)))?;
            let a = array.as_primitive::<Decimal128Type>();
            (0..len)
                .map(|i| {
                    if a.is_null(i) {
                        return Ok(Value::Null);
                    }
                    Decimal::try_from_i128_with_scale(a.value(i), scale)
                        .map(Value::Decimal)
                        .map_err(|e| EtlError::Query(e.to_string()))
                })
                .collect::<EtlResult<Vec<_>>>()?
        }
        t if t.is_integer() => {
            let converted = cast(array.as_ref(), &ArrowType::Int64)?;
            let a = converted.as_primitive::<Int64Type>();
            (0..len)
                .map(|i| if a.is_null(i) { Value::Null } else { Value::Int(a.value(i)) })
                .collect()
        }
        t if t.is_floating() => {
            let converted = cast(array.as_ref(), &ArrowType::Float64)?;
            let a = converted.as_primitive::<Float64Type>();
            (0..len)
                .map(|i| if a.is_null(i) { Value::Null } else { Value::Float(a.value(i)) })
                .collect()
        }
        ArrowType::Date32 | ArrowType::Date64 => {
            let converted = cast(array.as_ref(), &ArrowType::Date32)?;
            let a = converted.as_primitive::<Date32Type>();
            (0..len)
                .map(|i| Value::from(a.value_as_date(i).filter(|_| !a.is_null(i))))
                .collect()
        }
        ArrowType::Timestamp(_, _) => {
            let converted = cast(
                array.as_ref(),
                &ArrowType::Timestamp(TimeUnit::Microsecond, None),
            )?;
            let a = converted.as_primitive::<TimestampMicrosecondType>();
            (0..len)
                .map(|i| Value::from(a.value_as_datetime(i).filter(|_| !a.is_null(i))))
                .collect()
        }
        _ => {
            let converted = cast(array.as_ref(), &ArrowType::Utf8)?;
            let a = converted.as_string::<i32>();
            (0..len)
                .map(|i| {
                    if a.is_null(i) {
                        Value::Null
                    } else {
                        Value::Text(a.value(i).to_string())
                    }
                })
                .collect()
        }
    };
    Ok(values)
}
