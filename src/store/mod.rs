//! Relational store abstraction
//!
//! The pipeline touches three stores: the OLTP source (read-only), the
//! staging area and the final warehouse. Each is reached through [`Store`]:
//! - [`MemoryStore`]: in-process tables, always available
//! - PostgreSQL: pooled connections via deadpool-postgres
//! - DuckDB: embedded file or in-memory database
//!
//! Every write is a full-table replace. There is no upsert path.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dataset::{DataType, Dataset, Value};
use crate::schema::{SqlDialect, TableDef};

#[cfg(feature = "duckdb-backend")]
pub mod duckdb;
pub mod memory;
#[cfg(feature = "postgres-backend")]
pub mod postgres;

#[cfg(feature = "duckdb-backend")]
pub use self::duckdb::DuckDbStore;
pub use memory::MemoryStore;
#[cfg(feature = "postgres-backend")]
pub use self::postgres::PostgresStore;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Failed to connect to the store
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Statement execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Table does not exist
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Primary or foreign key constraint rejected a write
    #[error("Constraint violation on {table}: {message}")]
    ConstraintViolation { table: String, message: String },

    /// Table or column name is not a plain SQL identifier
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A value could not be converted to the column type
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Store configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Which end of the pipeline a store serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreRole {
    Source,
    Staging,
    Warehouse,
}

impl std::fmt::Display for StoreRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreRole::Source => write!(f, "source"),
            StoreRole::Staging => write!(f, "staging"),
            StoreRole::Warehouse => write!(f, "warehouse"),
        }
    }
}

/// Relational store used by the pipeline
///
/// Each call is a short-lived, self-contained operation. No transaction
/// spans two calls.
#[async_trait(?Send)]
pub trait Store: Send + Sync {
    /// Role this store was opened for
    fn role(&self) -> StoreRole;

    /// Backend type name ("memory", "postgres" or "duckdb")
    fn backend_type(&self) -> &'static str;

    /// DDL dialect used when rendering table definitions
    fn dialect(&self) -> SqlDialect;

    /// Read a table in full
    ///
    /// # Arguments
    /// * `table` - Table name, optionally schema-qualified
    ///
    /// # Returns
    /// Every row of the table, named after it
    async fn read_table(&self, table: &str) -> StoreResult<Dataset>;

    /// Replace a table with the given rows
    ///
    /// Drops any existing table named `definition.name` (together with
    /// constraints that depend on it), creates it from `definition` and
    /// inserts every row of `dataset`. Dataset columns are matched to
    /// definition columns by name; definition columns missing from the
    /// dataset are left to their default (SERIAL) or NULL.
    ///
    /// # Returns
    /// Number of rows written
    async fn replace_table(&self, dataset: &Dataset, definition: &TableDef) -> StoreResult<u64>;

    /// Create an empty table
    async fn create_table(&self, definition: &TableDef) -> StoreResult<()>;

    /// Drop a table if it exists, along with constraints depending on it
    async fn drop_table(&self, table: &str) -> StoreResult<()>;

    /// Check whether a table exists
    async fn table_exists(&self, table: &str) -> StoreResult<bool>;

    /// Number of rows in a table
    async fn row_count(&self, table: &str) -> StoreResult<u64>;

    /// Check the store is reachable
    async fn health_check(&self) -> StoreResult<bool>;

    /// Try to take the run-level lock
    ///
    /// # Returns
    /// False when another holder already has it
    async fn try_lock_run(&self) -> StoreResult<bool>;

    /// Release the run-level lock taken by [`Store::try_lock_run`]
    async fn unlock_run(&self) -> StoreResult<()>;
}

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("valid regex")
});

/// Check a table name is a plain, optionally schema-qualified identifier
///
/// Table names are rendered into SQL unquoted, so anything else is rejected.
pub fn validate_identifier(name: &str) -> StoreResult<&str> {
    if IDENTIFIER.is_match(name) {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Double-quote a column name for SQL
pub fn quote_column(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Pair each dataset column with its definition column
///
/// # Returns
/// `(dataset index, definition column name, definition type)` per dataset
/// column, in dataset order
pub fn insert_columns(
    dataset: &Dataset,
    definition: &TableDef,
) -> StoreResult<Vec<(usize, String, DataType)>> {
    dataset
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| {
            definition
                .column_def(&col.name)
                .map(|def| (i, def.name.clone(), def.data_type))
                .ok_or_else(|| {
                    StoreError::Conversion(format!(
                        "Column {} is not defined on table {}",
                        col.name, definition.name
                    ))
                })
        })
        .collect()
}

/// Convert a value to the canonical variant for a column type
///
/// Integer columns hold [`Value::Int`], NUMERIC holds [`Value::Decimal`] and
/// so on. NULL passes through unchanged.
pub fn coerce(value: &Value, data_type: DataType) -> StoreResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let mismatch = || StoreError::Conversion(format!("Cannot store {:?} as {}", value, data_type));

    let coerced = match data_type {
        DataType::Integer | DataType::Serial => {
            let v = value.as_i64().ok_or_else(mismatch)?;
            i32::try_from(v).map_err(|_| mismatch())?;
            Value::Int(v)
        }
        DataType::BigInt => Value::Int(value.as_i64().ok_or_else(mismatch)?),
        DataType::Numeric => Value::Decimal(value.as_decimal().ok_or_else(mismatch)?),
        DataType::Double => match value {
            Value::Float(f) => Value::Float(*f),
            other => {
                use rust_decimal::prelude::ToPrimitive;
                let d = other.as_decimal().ok_or_else(mismatch)?;
                Value::Float(d.to_f64().ok_or_else(mismatch)?)
            }
        },
        DataType::Text => match value {
            Value::Text(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        },
        DataType::Date => Value::Date(value.as_date().ok_or_else(mismatch)?),
        DataType::Timestamp => match value {
            Value::Timestamp(ts) => Value::Timestamp(*ts),
            other => {
                let date = other.as_date().ok_or_else(mismatch)?;
                Value::Timestamp(date.and_hms_opt(0, 0, 0).ok_or_else(mismatch)?)
            }
        },
        DataType::Boolean => match value {
            Value::Bool(b) => Value::Bool(*b),
            _ => return Err(mismatch()),
        },
    };
    Ok(coerced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("raw_product").is_ok());
        assert!(validate_identifier("Sales.SalesOrderDetail").is_ok());
        assert!(validate_identifier("a.b.c").is_err());
        assert!(validate_identifier("dim_date; DROP TABLE x").is_err());
        assert!(validate_identifier("1table").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_quote_column_escapes_quotes() {
        assert_eq!(quote_column("name"), "\"name\"");
        assert_eq!(quote_column("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_coerce_integer_range() {
        assert_eq!(
            coerce(&Value::Int(42), DataType::Integer).unwrap(),
            Value::Int(42)
        );
        assert!(coerce(&Value::Int(i64::MAX), DataType::Integer).is_err());
        assert_eq!(
            coerce(&Value::Int(i64::MAX), DataType::BigInt).unwrap(),
            Value::Int(i64::MAX)
        );
    }

    #[test]
    fn test_coerce_dates_and_text() {
        let d = NaiveDate::from_ymd_opt(2013, 7, 4).unwrap();
        assert_eq!(
            coerce(&Value::Text("2013-07-04".to_string()), DataType::Date).unwrap(),
            Value::Date(d)
        );
        assert_eq!(
            coerce(&Value::Date(d), DataType::Timestamp).unwrap(),
            Value::Timestamp(d.and_hms_opt(0, 0, 0).unwrap())
        );
        assert_eq!(
            coerce(&Value::Int(7), DataType::Text).unwrap(),
            Value::Text("7".to_string())
        );
        assert!(coerce(&Value::Int(1), DataType::Boolean).is_err());
        assert_eq!(coerce(&Value::Null, DataType::Date).unwrap(), Value::Null);
    }
}
