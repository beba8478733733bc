//! In-process store
//!
//! Holds tables in a mutex-guarded map. Declared primary and foreign keys are
//! enforced on write, and dropping a table strips foreign keys that point at
//! it, the way `DROP TABLE ... CASCADE` does on PostgreSQL.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{
    Store, StoreError, StoreResult, StoreRole, coerce, insert_columns, validate_identifier,
};
use crate::dataset::{Column, DataType, Dataset, Value};
use crate::schema::{SqlDialect, TableDef};

struct MemoryTable {
    definition: TableDef,
    rows: Vec<Vec<Value>>,
}

/// In-memory store
pub struct MemoryStore {
    role: StoreRole,
    tables: Mutex<HashMap<String, MemoryTable>>,
    run_locked: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new(role: StoreRole) -> Self {
        Self {
            role,
            tables: Mutex::new(HashMap::new()),
            run_locked: AtomicBool::new(false),
        }
    }

    /// Seed a table named after the dataset, with an inferred definition
    ///
    /// Intended for fixtures: source tables keep their original casing in the
    /// name (`Sales.SalesOrderHeader`) and lookups fold case.
    pub fn insert_table(&self, dataset: &Dataset) -> StoreResult<u64> {
        let definition = TableDef::infer(dataset.name(), dataset);
        self.replace_locked(dataset, &definition)
    }

    /// Builder form of [`MemoryStore::insert_table`]
    pub fn with_table(self, dataset: Dataset) -> StoreResult<Self> {
        self.insert_table(&dataset)?;
        Ok(self)
    }

    fn key(table: &str) -> StoreResult<String> {
        Ok(validate_identifier(table)?.to_ascii_lowercase())
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, HashMap<String, MemoryTable>>> {
        self.tables
            .lock()
            .map_err(|e| StoreError::ConnectionFailed(format!("Lock error: {}", e)))
    }

    fn drop_locked(tables: &mut HashMap<String, MemoryTable>, key: &str) {
        if tables.remove(key).is_some() {
            for other in tables.values_mut() {
                other
                    .definition
                    .foreign_keys
                    .retain(|fk| !fk.references_table.eq_ignore_ascii_case(key));
            }
        }
    }

    fn check_references(
        tables: &HashMap<String, MemoryTable>,
        definition: &TableDef,
    ) -> StoreResult<()> {
        for fk in &definition.foreign_keys {
            let target = fk.references_table.to_ascii_lowercase();
            if !tables.contains_key(&target) {
                return Err(StoreError::ConstraintViolation {
                    table: definition.name.clone(),
                    message: format!("referenced table {} does not exist", fk.references_table),
                });
            }
        }
        Ok(())
    }

    /// Materialize rows in definition column order, filling SERIAL columns
    fn build_rows(dataset: &Dataset, definition: &TableDef) -> StoreResult<Vec<Vec<Value>>> {
        let mapping = insert_columns(dataset, definition)?;
        let positions: Vec<Option<usize>> = definition
            .columns
            .iter()
            .map(|col| {
                mapping
                    .iter()
                    .find(|(_, name, _)| name == &col.name)
                    .map(|(i, _, _)| *i)
            })
            .collect();

        dataset
            .rows()
            .iter()
            .enumerate()
            .map(|(n, row)| {
                definition
                    .columns
                    .iter()
                    .zip(&positions)
                    .map(|(col, pos)| match pos {
                        Some(i) => coerce(&row[*i], col.data_type),
                        None if col.data_type == DataType::Serial => Ok(Value::Int(n as i64 + 1)),
                        None => Ok(Value::Null),
                    })
                    .collect()
            })
            .collect()
    }

    fn check_constraints(
        tables: &HashMap<String, MemoryTable>,
        definition: &TableDef,
        rows: &[Vec<Value>],
    ) -> StoreResult<()> {
        let violation = |message: String| StoreError::ConstraintViolation {
            table: definition.name.clone(),
            message,
        };

        if let Some(pk) = definition.primary_key() {
            let idx = definition
                .columns
                .iter()
                .position(|c| c.name == pk.name)
                .unwrap_or_default();
            let mut seen = HashSet::new();
            for row in rows {
                if row[idx].is_null() {
                    return Err(violation(format!("null value in primary key {}", pk.name)));
                }
                let key = row[idx]
                    .as_i64()
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| row[idx].to_string());
                if !seen.insert(key.clone()) {
                    return Err(violation(format!(
                        "duplicate key value {} for {}",
                        key, pk.name
                    )));
                }
            }
        }

        for fk in &definition.foreign_keys {
            let Some(target) = tables.get(&fk.references_table.to_ascii_lowercase()) else {
                return Err(violation(format!(
                    "referenced table {} does not exist",
                    fk.references_table
                )));
            };
            let target_idx = target
                .definition
                .columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(&fk.references_column))
                .ok_or_else(|| violation(format!("no column {}", fk.references_column)))?;
            let keys: HashSet<i64> = target
                .rows
                .iter()
                .filter_map(|r| r[target_idx].as_i64())
                .collect();

            let idx = definition
                .columns
                .iter()
                .position(|c| c.name == fk.column)
                .ok_or_else(|| violation(format!("no column {}", fk.column)))?;
            if let Some(orphan) = rows
                .iter()
                .filter(|r| !r[idx].is_null())
                .find(|r| r[idx].as_i64().is_none_or(|k| !keys.contains(&k)))
            {
                return Err(violation(format!(
                    "{}={} is not present in {}",
                    fk.column, orphan[idx], fk.references_table
                )));
            }
        }
        Ok(())
    }

    fn replace_locked(&self, dataset: &Dataset, definition: &TableDef) -> StoreResult<u64> {
        let key = Self::key(&definition.name)?;
        let rows = Self::build_rows(dataset, definition)?;

        let mut tables = self.lock()?;
        Self::check_constraints(&tables, definition, &rows)?;
        Self::drop_locked(&mut tables, &key);

        let written = rows.len() as u64;
        tables.insert(
            key,
            MemoryTable {
                definition: definition.clone(),
                rows,
            },
        );
        Ok(written)
    }
}

#[async_trait(?Send)]
impl Store for MemoryStore {
    fn role(&self) -> StoreRole {
        self.role
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    async fn read_table(&self, table: &str) -> StoreResult<Dataset> {
        let key = Self::key(table)?;
        let tables = self.lock()?;
        let stored = tables
            .get(&key)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;

        let columns = stored
            .definition
            .columns
            .iter()
            .map(|c| Column::new(c.name.clone(), c.data_type))
            .collect();
        Dataset::with_rows(table, columns, stored.rows.clone())
            .map_err(|e| StoreError::QueryFailed(e.to_string()))
    }

    async fn replace_table(&self, dataset: &Dataset, definition: &TableDef) -> StoreResult<u64> {
        self.replace_locked(dataset, definition)
    }

    async fn create_table(&self, definition: &TableDef) -> StoreResult<()> {
        let key = Self::key(&definition.name)?;
        let mut tables = self.lock()?;
        if tables.contains_key(&key) {
            return Err(StoreError::QueryFailed(format!(
                "relation \"{}\" already exists",
                definition.name
            )));
        }
        Self::check_references(&tables, definition)?;
        tables.insert(
            key,
            MemoryTable {
                definition: definition.clone(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> StoreResult<()> {
        let key = Self::key(table)?;
        let mut tables = self.lock()?;
        Self::drop_locked(&mut tables, &key);
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> StoreResult<bool> {
        let key = Self::key(table)?;
        Ok(self.lock()?.contains_key(&key))
    }

    async fn row_count(&self, table: &str) -> StoreResult<u64> {
        let key = Self::key(table)?;
        self.lock()?
            .get(&key)
            .map(|t| t.rows.len() as u64)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))
    }

    async fn health_check(&self) -> StoreResult<bool> {
        Ok(self.lock().is_ok())
    }

    async fn try_lock_run(&self) -> StoreResult<bool> {
        Ok(!self.run_locked.swap(true, Ordering::SeqCst))
    }

    async fn unlock_run(&self) -> StoreResult<()> {
        self.run_locked.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DIM_PRODUCT, FACT_SALES, StarSchema};

    fn products(ids: &[i64]) -> Dataset {
        Dataset::with_rows(
            DIM_PRODUCT,
            vec![
                Column::new("productid", DataType::Integer),
                Column::new("name", DataType::Text),
            ],
            ids.iter()
                .map(|id| vec![Value::Int(*id), Value::Text(format!("p{}", id))])
                .collect(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_read_missing_table() {
        let store = MemoryStore::new(StoreRole::Source);
        let err = store.read_table("Sales.Customer").await.unwrap_err();
        assert!(matches!(err, StoreError::TableNotFound(ref t) if t == "Sales.Customer"));
    }

    #[tokio::test]
    async fn test_lookup_folds_case() {
        let store = MemoryStore::new(StoreRole::Source);
        let ds = products(&[1, 2]).named("Production.Product");
        store.insert_table(&ds).unwrap();

        assert!(store.table_exists("production.product").await.unwrap());
        let read = store.read_table("PRODUCTION.PRODUCT").await.unwrap();
        assert_eq!(read.row_count(), 2);
        assert_eq!(read.name(), "PRODUCTION.PRODUCT");
    }

    #[tokio::test]
    async fn test_replace_fills_missing_columns() {
        let store = MemoryStore::new(StoreRole::Staging);
        let def = StarSchema::get(DIM_PRODUCT).unwrap();
        assert_eq!(store.replace_table(&products(&[5]), &def).await.unwrap(), 1);

        let read = store.read_table(DIM_PRODUCT).await.unwrap();
        assert_eq!(
            read.column_names(),
            vec!["productid", "name", "color", "size", "weight"]
        );
        assert_eq!(read.value(0, 2), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_column_name_with_space_round_trips() {
        let store = MemoryStore::new(StoreRole::Staging);
        let raw = Dataset::with_rows(
            "raw_salesorderheader",
            vec![
                Column::new("SalesOrderID", DataType::Integer),
                Column::new("Order Date", DataType::Date),
            ],
            vec![vec![Value::Int(1), Value::Null]],
        )
        .unwrap();
        let def = TableDef::infer("raw_salesorderheader", &raw);
        store.replace_table(&raw, &def).await.unwrap();

        let read = store.read_table("raw_salesorderheader").await.unwrap();
        assert_eq!(read.column_names(), vec!["SalesOrderID", "Order Date"]);
        assert_eq!(read.column_index("order date"), Some(1));
        assert_eq!(read.columns()[1].data_type, DataType::Date);
    }

    #[tokio::test]
    async fn test_primary_key_rejects_duplicates() {
        let store = MemoryStore::new(StoreRole::Staging);
        let def = StarSchema::get(DIM_PRODUCT).unwrap();
        let err = store
            .replace_table(&products(&[1, 1]), &def)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn test_foreign_key_enforced_and_cascaded_on_drop() {
        let store = MemoryStore::new(StoreRole::Staging);
        for def in StarSchema::creation_order().unwrap() {
            store.create_table(&def).await.unwrap();
        }
        store
            .replace_table(&products(&[1]), &StarSchema::get(DIM_PRODUCT).unwrap())
            .await
            .unwrap();

        let fact = Dataset::with_rows(
            FACT_SALES,
            vec![Column::new("productid", DataType::Integer)],
            vec![vec![Value::Int(2)]],
        )
        .unwrap();
        let fact_def = StarSchema::get(FACT_SALES).unwrap();
        let err = store.replace_table(&fact, &fact_def).await.unwrap_err();
        assert!(err.to_string().contains("productid=2"));

        // Replacing the dimension strips the fact's constraint, like CASCADE
        store
            .replace_table(&products(&[3]), &StarSchema::get(DIM_PRODUCT).unwrap())
            .await
            .unwrap();
        let tables = store.tables.lock().unwrap();
        let stored = tables.get(FACT_SALES).unwrap();
        assert!(
            !stored
                .definition
                .foreign_keys
                .iter()
                .any(|fk| fk.references_table == DIM_PRODUCT)
        );
    }

    #[tokio::test]
    async fn test_serial_column_is_assigned() {
        let store = MemoryStore::new(StoreRole::Staging);
        let mut def = StarSchema::get(FACT_SALES).unwrap();
        def.foreign_keys.clear();
        let fact = Dataset::with_rows(
            FACT_SALES,
            vec![Column::new("qtyproduct", DataType::Integer)],
            vec![vec![Value::Int(4)], vec![Value::Int(5)]],
        )
        .unwrap();
        store.replace_table(&fact, &def).await.unwrap();
        let read = store.read_table(FACT_SALES).await.unwrap();
        let ids: Vec<i64> = read.rows().iter().map(|r| r[0].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_run_lock_is_exclusive() {
        let store = MemoryStore::new(StoreRole::Staging);
        assert!(store.try_lock_run().await.unwrap());
        assert!(!store.try_lock_run().await.unwrap());
        store.unlock_run().await.unwrap();
        assert!(store.try_lock_run().await.unwrap());
    }
}
