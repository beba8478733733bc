//! DuckDB store
//!
//! Embedded database, either file-backed or in-memory. Star tables are
//! created without FOREIGN KEY clauses on this dialect.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use duckdb::types::{TimeUnit, ValueRef};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use super::{
    Store, StoreError, StoreResult, StoreRole, coerce, insert_columns, quote_column,
    validate_identifier,
};
use crate::dataset::{Column, DataType, Dataset, Value};
use crate::schema::{SqlDialect, TableDef};

/// DuckDB store
pub struct DuckDbStore {
    role: StoreRole,
    /// Path to the database file (None for in-memory)
    db_path: Option<PathBuf>,
    connection: Mutex<duckdb::Connection>,
    run_locked: AtomicBool,
}

impl DuckDbStore {
    /// Open a file-backed database, creating it if needed
    ///
    /// # Arguments
    /// * `role` - Which end of the pipeline the store serves
    /// * `db_path` - Path to the DuckDB database file
    pub fn new(role: StoreRole, db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        let connection = duckdb::Connection::open(&path)
            .map_err(|e| StoreError::ConnectionFailed(format!("Failed to open DuckDB: {}", e)))?;

        Ok(Self {
            role,
            db_path: Some(path),
            connection: Mutex::new(connection),
            run_locked: AtomicBool::new(false),
        })
    }

    /// Open an in-memory database
    pub fn in_memory(role: StoreRole) -> StoreResult<Self> {
        let connection = duckdb::Connection::open_in_memory().map_err(|e| {
            StoreError::ConnectionFailed(format!("Failed to create in-memory DuckDB: {}", e))
        })?;

        Ok(Self {
            role,
            db_path: None,
            connection: Mutex::new(connection),
            run_locked: AtomicBool::new(false),
        })
    }

    /// Database file path (None for in-memory)
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, duckdb::Connection>> {
        self.connection
            .lock()
            .map_err(|e| StoreError::ConnectionFailed(format!("Lock error: {}", e)))
    }

    fn exists(conn: &duckdb::Connection, table: &str) -> StoreResult<bool> {
        let (schema, name) = split_table(table);
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE lower(table_schema) = lower(?) AND lower(table_name) = lower(?)",
                duckdb::params![schema, name],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::QueryFailed(format!("Table lookup failed: {}", e)))?;
        Ok(count > 0)
    }

    /// Declared columns of a table, in ordinal order
    fn declared_columns(conn: &duckdb::Connection, table: &str) -> StoreResult<Vec<Column>> {
        let (schema, name) = split_table(table);
        let mut stmt = conn
            .prepare(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE lower(table_schema) = lower(?) AND lower(table_name) = lower(?) \
                 ORDER BY ordinal_position",
            )
            .map_err(|e| StoreError::QueryFailed(format!("Prepare failed: {}", e)))?;
        let columns = stmt
            .query_map(duckdb::params![schema, name], |row| {
                let name: String = row.get(0)?;
                let declared: String = row.get(1)?;
                Ok(Column::new(name, column_type(&declared)))
            })
            .map_err(|e| StoreError::QueryFailed(format!("Column lookup failed: {}", e)))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::QueryFailed(format!("Column lookup failed: {}", e)))?;
        Ok(columns)
    }
}

fn split_table(table: &str) -> (&str, &str) {
    table.split_once('.').unwrap_or(("main", table))
}

/// Logical type for a DuckDB `information_schema` type name
fn column_type(declared: &str) -> DataType {
    let declared = declared.trim().to_ascii_uppercase();
    match declared.as_str() {
        "TINYINT" | "SMALLINT" | "INTEGER" | "UTINYINT" | "USMALLINT" => DataType::Integer,
        "BIGINT" | "UINTEGER" | "UBIGINT" | "HUGEINT" => DataType::BigInt,
        "FLOAT" | "REAL" | "DOUBLE" => DataType::Double,
        "BOOLEAN" => DataType::Boolean,
        "DATE" => DataType::Date,
        t if t.starts_with("DECIMAL") || t.starts_with("NUMERIC") => DataType::Numeric,
        t if t.starts_with("TIMESTAMP") => DataType::Timestamp,
        _ => DataType::Text,
    }
}

/// Convert a DuckDB value to a dataset value
fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::Int(i as i64),
        ValueRef::SmallInt(i) => Value::Int(i as i64),
        ValueRef::Int(i) => Value::Int(i as i64),
        ValueRef::BigInt(i) => Value::Int(i),
        ValueRef::UTinyInt(i) => Value::Int(i as i64),
        ValueRef::USmallInt(i) => Value::Int(i as i64),
        ValueRef::UInt(i) => Value::Int(i as i64),
        ValueRef::HugeInt(i) => i64::try_from(i)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(i.to_string())),
        ValueRef::UBigInt(i) => i64::try_from(i)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(i.to_string())),
        ValueRef::Float(f) => Value::Float(f as f64),
        ValueRef::Double(f) => Value::Float(f),
        ValueRef::Decimal(d) => d
            .to_string()
            .parse::<Decimal>()
            .map(Value::Decimal)
            .unwrap_or_else(|_| Value::Text(d.to_string())),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            Value::Text(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        ValueRef::Date32(days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days as i64)))
            .map(Value::Date)
            .unwrap_or(Value::Null),
        ValueRef::Timestamp(unit, raw) => {
            let micros = match unit {
                TimeUnit::Second => raw.saturating_mul(1_000_000),
                TimeUnit::Millisecond => raw.saturating_mul(1_000),
                TimeUnit::Microsecond => raw,
                TimeUnit::Nanosecond => raw / 1_000,
            };
            DateTime::from_timestamp_micros(micros)
                .map(|dt| Value::Timestamp(dt.naive_utc()))
                .unwrap_or(Value::Null)
        }
        other => Value::Text(format!("{:?}", other)),
    }
}

/// Bind value for a column
///
/// Exact types travel as text and are cast by the INSERT placeholder.
fn to_param(value: &Value, data_type: DataType) -> StoreResult<duckdb::types::Value> {
    use duckdb::types::Value as Db;

    let param = match coerce(value, data_type)? {
        Value::Null => Db::Null,
        Value::Int(i) => Db::BigInt(i),
        Value::Float(f) => Db::Double(f),
        Value::Decimal(d) => Db::Text(d.to_string()),
        Value::Text(s) => Db::Text(s),
        Value::Bool(b) => Db::Boolean(b),
        Value::Date(d) => Db::Text(d.format("%Y-%m-%d").to_string()),
        Value::Timestamp(ts) => Db::Text(format_timestamp(&ts)),
    };
    Ok(param)
}

fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

#[async_trait(?Send)]
impl Store for DuckDbStore {
    fn role(&self) -> StoreRole {
        self.role
    }

    fn backend_type(&self) -> &'static str {
        "duckdb"
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::DuckDb
    }

    async fn read_table(&self, table: &str) -> StoreResult<Dataset> {
        validate_identifier(table)?;
        let conn = self.lock()?;
        if !Self::exists(&conn, table)? {
            return Err(StoreError::TableNotFound(table.to_string()));
        }

        let columns = Self::declared_columns(&conn, table)?;
        let select_list = columns
            .iter()
            .map(|c| quote_column(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        if select_list.is_empty() {
            return Ok(Dataset::new(table, columns));
        }

        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM {}", select_list, table))
            .map_err(|e| StoreError::QueryFailed(format!("Prepare failed: {}", e)))?;
        let mut result_rows = stmt
            .query([])
            .map_err(|e| StoreError::QueryFailed(format!("Query failed: {}", e)))?;

        let mut rows = Vec::new();
        while let Some(row) = result_rows
            .next()
            .map_err(|e| StoreError::QueryFailed(format!("Row fetch error: {}", e)))?
        {
            let values = (0..columns.len())
                .map(|i| row.get_ref(i).map(from_value_ref).unwrap_or(Value::Null))
                .collect::<Vec<_>>();
            rows.push(values);
        }

        Dataset::with_rows(table, columns, rows).map_err(|e| StoreError::Conversion(e.to_string()))
    }

    async fn replace_table(&self, dataset: &Dataset, definition: &TableDef) -> StoreResult<u64> {
        let table = validate_identifier(&definition.name)?;
        let mapping = insert_columns(dataset, definition)?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::QueryFailed(format!("Failed to begin transaction: {}", e)))?;

        let ddl = format!(
            "{}\n{}",
            TableDef::drop_sql(table, SqlDialect::DuckDb),
            definition.create_sql(SqlDialect::DuckDb)
        );
        debug!(sql = %ddl, "Replacing table");
        tx.execute_batch(&ddl)
            .map_err(|e| StoreError::QueryFailed(format!("{}: {}", table, e)))?;

        let mut written = 0u64;
        if !mapping.is_empty() {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                mapping
                    .iter()
                    .map(|(_, name, _)| quote_column(name))
                    .collect::<Vec<_>>()
                    .join(", "),
                mapping
                    .iter()
                    .map(|(_, _, t)| format!("CAST(? AS {})", SqlDialect::DuckDb.type_name(*t)))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let mut stmt = tx
                .prepare(&sql)
                .map_err(|e| StoreError::QueryFailed(format!("Prepare failed: {}", e)))?;
            for row in dataset.rows() {
                let params = mapping
                    .iter()
                    .map(|(idx, _, t)| to_param(&row[*idx], *t))
                    .collect::<StoreResult<Vec<_>>>()?;
                written += stmt
                    .execute(duckdb::params_from_iter(params.iter()))
                    .map_err(|e| StoreError::ConstraintViolation {
                        table: table.to_string(),
                        message: e.to_string(),
                    })? as u64;
            }
        }

        tx.commit()
            .map_err(|e| StoreError::QueryFailed(format!("Commit failed: {}", e)))?;
        Ok(written)
    }

    async fn create_table(&self, definition: &TableDef) -> StoreResult<()> {
        let table = validate_identifier(&definition.name)?;
        let conn = self.lock()?;
        let sql = definition.create_sql(SqlDialect::DuckDb);
        debug!(sql = %sql, "Creating table");
        conn.execute_batch(&sql)
            .map_err(|e| StoreError::QueryFailed(format!("{}: {}", table, e)))
    }

    async fn drop_table(&self, table: &str) -> StoreResult<()> {
        validate_identifier(table)?;
        let conn = self.lock()?;
        conn.execute_batch(&TableDef::drop_sql(table, SqlDialect::DuckDb))
            .map_err(|e| StoreError::QueryFailed(format!("{}: {}", table, e)))
    }

    async fn table_exists(&self, table: &str) -> StoreResult<bool> {
        validate_identifier(table)?;
        let conn = self.lock()?;
        Self::exists(&conn, table)
    }

    async fn row_count(&self, table: &str) -> StoreResult<u64> {
        validate_identifier(table)?;
        let conn = self.lock()?;
        if !Self::exists(&conn, table)? {
            return Err(StoreError::TableNotFound(table.to_string()));
        }
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })
            .map_err(|e| StoreError::QueryFailed(format!("{}: {}", table, e)))?;
        Ok(count as u64)
    }

    async fn health_check(&self) -> StoreResult<bool> {
        let conn = self.lock()?;
        Ok(conn.execute_batch("SELECT 1").is_ok())
    }

    async fn try_lock_run(&self) -> StoreResult<bool> {
        Ok(!self.run_locked.swap(true, Ordering::SeqCst))
    }

    async fn unlock_run(&self) -> StoreResult<()> {
        self.run_locked.store(false, Ordering::SeqCst);
        Ok(())
    }
}
