//! PostgreSQL store
//!
//! Uses a deadpool-postgres pool; every operation checks out a client for
//! its own duration. The run lock is a session advisory lock, so it lives on
//! a dedicated connection outside the pool.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{NoTls, Row};
use tracing::{debug, warn};

use super::{
    Store, StoreError, StoreResult, StoreRole, coerce, insert_columns, quote_column,
    validate_identifier,
};
use crate::config::StoreSection;
use crate::dataset::{Column, DataType, Dataset, Value};
use crate::schema::{SqlDialect, TableDef};

/// Advisory lock key guarding pipeline runs
const RUN_LOCK_KEY: i64 = 0x5A1E_5E71;

/// PostgreSQL caps bind parameters per statement at this many
const MAX_BIND_PARAMS: usize = 65_535;

type Param = Box<dyn ToSql + Sync + Send>;

/// PostgreSQL store
pub struct PostgresStore {
    role: StoreRole,
    description: String,
    config: tokio_postgres::Config,
    pool: Pool,
    lock_client: Mutex<Option<tokio_postgres::Client>>,
}

impl PostgresStore {
    /// Open a pool for the given settings and check it can connect
    ///
    /// # Arguments
    /// * `role` - Which end of the pipeline the store serves
    /// * `settings` - Host, port, credentials and pool size
    pub async fn connect(role: StoreRole, settings: &StoreSection) -> StoreResult<Self> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&settings.host)
            .port(settings.port)
            .user(&settings.user)
            .dbname(&settings.database);
        if let Some(password) = &settings.password {
            config.password(password);
        }

        let manager = Manager::from_config(
            config.clone(),
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
                ..Default::default()
            },
        );
        let pool = Pool::builder(manager)
            .max_size(settings.pool_size.max(1))
            .build()
            .map_err(|e| StoreError::Config(format!("Failed to build pool: {}", e)))?;

        let store = Self {
            role,
            description: settings.masked_url(),
            config,
            pool,
            lock_client: Mutex::new(None),
        };
        store.client().await?;
        Ok(store)
    }

    /// Connection URL with the password masked
    pub fn connection_string_masked(&self) -> &str {
        &self.description
    }

    async fn client(&self) -> StoreResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(|e| {
            StoreError::ConnectionFailed(format!(
                "Failed to connect to {} ({}): {}",
                self.role, self.description, e
            ))
        })
    }

    fn query_error(table: &str, e: tokio_postgres::Error) -> StoreError {
        match e.code() {
            Some(code) if *code == SqlState::UNDEFINED_TABLE => {
                StoreError::TableNotFound(table.to_string())
            }
            Some(code)
                if *code == SqlState::FOREIGN_KEY_VIOLATION
                    || *code == SqlState::UNIQUE_VIOLATION
                    || *code == SqlState::NOT_NULL_VIOLATION =>
            {
                StoreError::ConstraintViolation {
                    table: table.to_string(),
                    message: e.to_string(),
                }
            }
            _ => StoreError::QueryFailed(format!("{}: {}", table, e)),
        }
    }

    async fn insert_rows(
        tx: &tokio_postgres::Transaction<'_>,
        dataset: &Dataset,
        definition: &TableDef,
    ) -> StoreResult<u64> {
        let mapping = insert_columns(dataset, definition)?;
        if mapping.is_empty() || dataset.is_empty() {
            return Ok(0);
        }

        let column_list = mapping
            .iter()
            .map(|(_, name, _)| quote_column(name))
            .collect::<Vec<_>>()
            .join(", ");
        let rows_per_statement = (MAX_BIND_PARAMS / mapping.len()).max(1);

        let mut written = 0;
        for chunk in dataset.rows().chunks(rows_per_statement) {
            let mut params: Vec<Param> = Vec::with_capacity(chunk.len() * mapping.len());
            let mut tuples = Vec::with_capacity(chunk.len());
            for row in chunk {
                let mut placeholders = Vec::with_capacity(mapping.len());
                for (idx, _, data_type) in &mapping {
                    params.push(to_param(&row[*idx], *data_type)?);
                    placeholders.push(format!("${}", params.len()));
                }
                tuples.push(format!("({})", placeholders.join(", ")));
            }

            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                definition.name,
                column_list,
                tuples.join(", ")
            );
            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            written += tx
                .execute(sql.as_str(), &refs)
                .await
                .map_err(|e| Self::query_error(&definition.name, e))?;
        }
        Ok(written)
    }
}

/// Column type for a PostgreSQL type read natively, `None` if it is read as text
fn map_type(ty: &Type) -> Option<DataType> {
    let mapped = if *ty == Type::INT2 || *ty == Type::INT4 {
        DataType::Integer
    } else if *ty == Type::INT8 {
        DataType::BigInt
    } else if *ty == Type::NUMERIC {
        DataType::Numeric
    } else if *ty == Type::FLOAT4 || *ty == Type::FLOAT8 {
        DataType::Double
    } else if *ty == Type::TEXT
        || *ty == Type::VARCHAR
        || *ty == Type::BPCHAR
        || *ty == Type::NAME
    {
        DataType::Text
    } else if *ty == Type::DATE {
        DataType::Date
    } else if *ty == Type::TIMESTAMP {
        DataType::Timestamp
    } else if *ty == Type::BOOL {
        DataType::Boolean
    } else {
        return None;
    };
    Some(mapped)
}

/// Select-list entry for a column, casting types without a native mapping
fn select_expr(name: &str, ty: &Type) -> String {
    let quoted = quote_column(name);
    if *ty == Type::TIMESTAMPTZ {
        format!("{q}::timestamp AS {q}", q = quoted)
    } else if *ty == Type::MONEY {
        format!("{q}::numeric AS {q}", q = quoted)
    } else if map_type(ty).is_none() {
        format!("{q}::text AS {q}", q = quoted)
    } else {
        quoted
    }
}

fn read_value(row: &Row, idx: usize, ty: &Type) -> Result<Value, tokio_postgres::Error> {
    let value = if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?.map(|v| Value::Int(v as i64))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?.map(Value::from)
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(Value::Int)
    } else if *ty == Type::NUMERIC {
        row.try_get::<_, Option<Decimal>>(idx)?.map(Value::Decimal)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?
            .map(|v| Value::Float(v as f64))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(Value::Float)
    } else if *ty == Type::DATE {
        row.try_get::<_, Option<chrono::NaiveDate>>(idx)?
            .map(Value::Date)
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(Value::Timestamp)
    } else if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool)
    } else {
        row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Typed bind parameter for a column; NULL binds as a typed `None`
fn to_param(value: &Value, data_type: DataType) -> StoreResult<Param> {
    let value = coerce(value, data_type)?;
    let param: Param = match data_type {
        // Range already checked by coerce
        DataType::Integer | DataType::Serial => Box::new(value.as_i64().map(|v| v as i32)),
        DataType::BigInt => Box::new(value.as_i64()),
        DataType::Numeric => Box::new(value.as_decimal()),
        DataType::Double => Box::new(match value {
            Value::Float(f) => Some(f),
            _ => None,
        }),
        DataType::Text => Box::new(value.as_text().map(str::to_string)),
        DataType::Date => Box::new(value.as_date()),
        DataType::Timestamp => Box::new(match value {
            Value::Timestamp(ts) => Some(ts),
            _ => None,
        }),
        DataType::Boolean => Box::new(match value {
            Value::Bool(b) => Some(b),
            _ => None,
        }),
    };
    Ok(param)
}

#[async_trait(?Send)]
impl Store for PostgresStore {
    fn role(&self) -> StoreRole {
        self.role
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    async fn read_table(&self, table: &str) -> StoreResult<Dataset> {
        validate_identifier(table)?;
        let client = self.client().await?;

        let shape = client
            .prepare(&format!("SELECT * FROM {}", table))
            .await
            .map_err(|e| Self::query_error(table, e))?;
        let select_list = shape
            .columns()
            .iter()
            .map(|c| select_expr(c.name(), c.type_()))
            .collect::<Vec<_>>()
            .join(", ");
        if select_list.is_empty() {
            return Ok(Dataset::new(table, Vec::new()));
        }

        let sql = format!("SELECT {} FROM {}", select_list, table);
        debug!(sql = %sql, "Reading table");
        let statement = client
            .prepare(&sql)
            .await
            .map_err(|e| Self::query_error(table, e))?;
        let rows = client
            .query(&statement, &[])
            .await
            .map_err(|e| Self::query_error(table, e))?;

        let types: Vec<Type> = statement
            .columns()
            .iter()
            .map(|c| c.type_().clone())
            .collect();
        let columns = statement
            .columns()
            .iter()
            .map(|c| Column::new(c.name(), map_type(c.type_()).unwrap_or(DataType::Text)))
            .collect();

        let mut dataset = Dataset::new(table, columns);
        for row in &rows {
            let values = types
                .iter()
                .enumerate()
                .map(|(i, ty)| read_value(row, i, ty))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::Conversion(format!("{}: {}", table, e)))?;
            dataset
                .push_row(values)
                .map_err(|e| StoreError::Conversion(e.to_string()))?;
        }
        Ok(dataset)
    }

    async fn replace_table(&self, dataset: &Dataset, definition: &TableDef) -> StoreResult<u64> {
        let table = validate_identifier(&definition.name)?;
        let mut object = self.client().await?;
        let client: &mut tokio_postgres::Client = &mut object;
        let tx = client
            .transaction()
            .await
            .map_err(|e| StoreError::QueryFailed(format!("Failed to begin transaction: {}", e)))?;

        let ddl = format!(
            "{}\n{}",
            TableDef::drop_sql(table, SqlDialect::Postgres),
            definition.create_sql(SqlDialect::Postgres)
        );
        debug!(sql = %ddl, "Replacing table");
        tx.batch_execute(&ddl)
            .await
            .map_err(|e| Self::query_error(table, e))?;

        let written = Self::insert_rows(&tx, dataset, definition).await?;
        tx.commit()
            .await
            .map_err(|e| Self::query_error(table, e))?;
        Ok(written)
    }

    async fn create_table(&self, definition: &TableDef) -> StoreResult<()> {
        let table = validate_identifier(&definition.name)?;
        let client = self.client().await?;
        let sql = definition.create_sql(SqlDialect::Postgres);
        debug!(sql = %sql, "Creating table");
        client
            .batch_execute(&sql)
            .await
            .map_err(|e| Self::query_error(table, e))
    }

    async fn drop_table(&self, table: &str) -> StoreResult<()> {
        validate_identifier(table)?;
        let client = self.client().await?;
        client
            .batch_execute(&TableDef::drop_sql(table, SqlDialect::Postgres))
            .await
            .map_err(|e| Self::query_error(table, e))
    }

    async fn table_exists(&self, table: &str) -> StoreResult<bool> {
        validate_identifier(table)?;
        let client = self.client().await?;
        let row = client
            .query_one("SELECT to_regclass($1::text) IS NOT NULL", &[&table])
            .await
            .map_err(|e| Self::query_error(table, e))?;
        Ok(row.get(0))
    }

    async fn row_count(&self, table: &str) -> StoreResult<u64> {
        validate_identifier(table)?;
        let client = self.client().await?;
        let row = client
            .query_one(format!("SELECT COUNT(*) FROM {}", table).as_str(), &[])
            .await
            .map_err(|e| Self::query_error(table, e))?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn health_check(&self) -> StoreResult<bool> {
        let client = self.client().await?;
        Ok(client.simple_query("SELECT 1").await.is_ok())
    }

    async fn try_lock_run(&self) -> StoreResult<bool> {
        let mut held = self.lock_client.lock().await;
        if held.is_some() {
            return Ok(false);
        }

        let (client, connection) = self.config.connect(NoTls).await.map_err(|e| {
            StoreError::ConnectionFailed(format!(
                "Failed to open lock session on {}: {}",
                self.description, e
            ))
        })?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL lock session error");
            }
        });

        let row = client
            .query_one("SELECT pg_try_advisory_lock($1::bigint)", &[&RUN_LOCK_KEY])
            .await
            .map_err(|e| StoreError::QueryFailed(format!("Advisory lock failed: {}", e)))?;
        let acquired: bool = row.get(0);
        if acquired {
            *held = Some(client);
        }
        Ok(acquired)
    }

    async fn unlock_run(&self) -> StoreResult<()> {
        if let Some(client) = self.lock_client.lock().await.take() {
            client
                .execute("SELECT pg_advisory_unlock($1::bigint)", &[&RUN_LOCK_KEY])
                .await
                .map_err(|e| StoreError::QueryFailed(format!("Advisory unlock failed: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_type() {
        assert_eq!(map_type(&Type::INT2), Some(DataType::Integer));
        assert_eq!(map_type(&Type::INT8), Some(DataType::BigInt));
        assert_eq!(map_type(&Type::NUMERIC), Some(DataType::Numeric));
        assert_eq!(map_type(&Type::VARCHAR), Some(DataType::Text));
        assert_eq!(map_type(&Type::UUID), None);
        assert_eq!(map_type(&Type::XML), None);
    }

    #[test]
    fn test_select_expr_casts_unmapped_types() {
        assert_eq!(select_expr("productid", &Type::INT4), "\"productid\"");
        assert_eq!(
            select_expr("rowguid", &Type::UUID),
            "\"rowguid\"::text AS \"rowguid\""
        );
        assert_eq!(
            select_expr("modifieddate", &Type::TIMESTAMPTZ),
            "\"modifieddate\"::timestamp AS \"modifieddate\""
        );
        assert_eq!(
            select_expr("totaldue", &Type::MONEY),
            "\"totaldue\"::numeric AS \"totaldue\""
        );
    }

    #[test]
    fn test_to_param_rejects_out_of_range_integer() {
        assert!(to_param(&Value::Int(1), DataType::Integer).is_ok());
        assert!(to_param(&Value::Null, DataType::Numeric).is_ok());
        assert!(to_param(&Value::Int(i64::MAX), DataType::Integer).is_err());
    }
}
