//! Writing datasets into staging and publishing the star schema

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::dataset::Dataset;
use crate::error::{EtlError, EtlResult};
use crate::schema::{StarSchema, TableDef};
use crate::store::Store;

/// Rows written to one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub table: String,
    pub rows: u64,
}

/// Replace `table` in `store` with the rows of `dataset`
///
/// Star tables keep their fixed definition. Any other table gets a
/// constraint-free definition inferred from the dataset.
///
/// # Returns
/// The table and the number of rows written, which always equals the
/// dataset's row count
pub async fn persist(store: &dyn Store, dataset: &Dataset, table: &str) -> EtlResult<LoadReport> {
    let definition =
        StarSchema::get(table).unwrap_or_else(|| TableDef::infer(table, dataset));

    let expected = dataset.row_count() as u64;
    let written = store.replace_table(dataset, &definition).await?;
    if written != expected {
        return Err(EtlError::LoadCountMismatch {
            table: table.to_string(),
            expected,
            written,
        });
    }

    info!(
        store = %store.role(),
        table = %table,
        rows = written,
        "Table written"
    );
    Ok(LoadReport {
        table: table.to_string(),
        rows: written,
    })
}

/// Writes built tables into the staging store
pub struct StagingLoader {
    staging: Arc<dyn Store>,
}

impl StagingLoader {
    pub fn new(staging: Arc<dyn Store>) -> Self {
        Self { staging }
    }

    /// Replace the staging table named after the dataset
    pub async fn load(&self, dataset: &Dataset) -> EtlResult<LoadReport> {
        persist(self.staging.as_ref(), dataset, dataset.name()).await
    }
}

/// Copies the star tables from staging into the warehouse
pub struct WarehouseLoader {
    staging: Arc<dyn Store>,
    warehouse: Arc<dyn Store>,
}

impl WarehouseLoader {
    pub fn new(staging: Arc<dyn Store>, warehouse: Arc<dyn Store>) -> Self {
        Self { staging, warehouse }
    }

    /// Publish every star table, dimensions before the fact
    ///
    /// Each table is replaced wholesale, so publishing twice leaves the
    /// warehouse as it was after the first publish.
    pub async fn publish(&self) -> EtlResult<Vec<LoadReport>> {
        let mut reports = Vec::new();
        for def in StarSchema::creation_order()? {
            debug!(table = %def.name, "Publishing table");
            let dataset = self.staging.read_table(&def.name).await?;
            reports.push(persist(self.warehouse.as_ref(), &dataset, &def.name).await?);
        }
        info!(tables = reports.len(), "Star schema published");
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Column, DataType, Value};
    use crate::schema::{DIM_PRODUCT, FACT_SALES, SchemaManager};
    use crate::store::{MemoryStore, StoreRole};

    #[tokio::test]
    async fn test_persist_infers_definition_for_raw_tables() {
        let store = MemoryStore::new(StoreRole::Staging);
        let ds = Dataset::with_rows(
            "raw_thing",
            vec![Column::new("Id", DataType::Integer)],
            vec![vec![Value::Int(1)], vec![Value::Int(1)]],
        )
        .unwrap();

        let report = persist(&store, &ds, "raw_thing").await.unwrap();
        assert_eq!(report.rows, 2);
        assert_eq!(store.row_count("raw_thing").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_persist_uses_star_definition() {
        let store = MemoryStore::new(StoreRole::Staging);
        let ds = Dataset::with_rows(
            DIM_PRODUCT,
            vec![Column::new("productid", DataType::Integer)],
            vec![vec![Value::Int(1)], vec![Value::Int(1)]],
        )
        .unwrap();

        // productid is the primary key of dim_product
        let err = persist(&store, &ds, DIM_PRODUCT).await.unwrap_err();
        assert!(matches!(err, EtlError::Store(_)));
    }

    #[tokio::test]
    async fn test_publish_copies_all_star_tables() {
        let staging: Arc<dyn Store> = Arc::new(MemoryStore::new(StoreRole::Staging));
        let warehouse: Arc<dyn Store> = Arc::new(MemoryStore::new(StoreRole::Warehouse));
        SchemaManager::new(staging.clone())
            .reset_schema()
            .await
            .unwrap();

        let product = Dataset::with_rows(
            DIM_PRODUCT,
            vec![
                Column::new("productid", DataType::Integer),
                Column::new("name", DataType::Text),
            ],
            vec![vec![Value::Int(42), Value::from("Widget")]],
        )
        .unwrap();
        StagingLoader::new(staging.clone())
            .load(&product)
            .await
            .unwrap();

        let loader = WarehouseLoader::new(staging, warehouse.clone());
        let reports = loader.publish().await.unwrap();
        assert_eq!(reports.len(), 5);
        assert_eq!(reports.last().unwrap().table, FACT_SALES);
        assert_eq!(warehouse.row_count(DIM_PRODUCT).await.unwrap(), 1);

        loader.publish().await.unwrap();
        assert_eq!(warehouse.row_count(DIM_PRODUCT).await.unwrap(), 1);
    }
}
