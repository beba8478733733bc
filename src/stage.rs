//! Copying source tables verbatim into staging

use std::sync::Arc;
use tracing::{error, info};

use crate::error::{EtlError, EtlResult};
use crate::load::{LoadReport, persist};
use crate::schema::{
    RAW_CUSTOMER, RAW_PERSON, RAW_PRODUCT, RAW_PRODUCT_CATEGORY, RAW_PRODUCT_SUBCATEGORY,
    RAW_SALES_ORDER_DETAIL, RAW_SALES_ORDER_HEADER,
};
use crate::store::{Store, StoreError};

/// Source table -> raw staging table
pub const DEFAULT_SOURCE_TABLES: [(&str, &str); 7] = [
    ("Sales.SalesOrderDetail", RAW_SALES_ORDER_DETAIL),
    ("Sales.SalesOrderHeader", RAW_SALES_ORDER_HEADER),
    ("Production.Product", RAW_PRODUCT),
    ("Sales.Customer", RAW_CUSTOMER),
    ("Person.Person", RAW_PERSON),
    ("Production.ProductCategory", RAW_PRODUCT_CATEGORY),
    ("Production.ProductSubcategory", RAW_PRODUCT_SUBCATEGORY),
];

/// Reads source tables and writes them unchanged into staging
pub struct SourceStager {
    source: Arc<dyn Store>,
    staging: Arc<dyn Store>,
}

impl SourceStager {
    pub fn new(source: Arc<dyn Store>, staging: Arc<dyn Store>) -> Self {
        Self { source, staging }
    }

    /// Copy each source table into its raw table, in order
    ///
    /// Every row and column is kept as read. Tables copied before a failure
    /// stay in staging.
    ///
    /// # Arguments
    /// * `tables` - `(source table, raw table)` pairs
    ///
    /// # Returns
    /// One report per raw table written
    pub async fn stage_raw_tables(&self, tables: &[(&str, &str)]) -> EtlResult<Vec<LoadReport>> {
        let mut reports = Vec::with_capacity(tables.len());
        for (source_table, raw_table) in tables {
            let dataset = match self.source.read_table(source_table).await {
                Ok(ds) => ds.named(*raw_table),
                Err(StoreError::ConnectionFailed(msg)) => {
                    return Err(EtlError::Connectivity(msg));
                }
                Err(e) => {
                    error!(table = %source_table, error = %e, "Failed to read source table");
                    return Err(EtlError::SourceUnavailable {
                        table: source_table.to_string(),
                        reason: e.to_string(),
                    });
                }
            };
            reports.push(persist(self.staging.as_ref(), &dataset, raw_table).await?);
        }
        info!(tables = reports.len(), "Raw tables staged");
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Column, DataType, Dataset, Value};
    use crate::store::{MemoryStore, StoreRole};

    fn source() -> MemoryStore {
        let ds = Dataset::with_rows(
            "Sales.Customer",
            vec![
                Column::new("CustomerID", DataType::Integer),
                Column::new("PersonID", DataType::Integer),
                Column::new("rowguid", DataType::Text),
            ],
            vec![
                vec![Value::Int(7), Value::Int(100), Value::from("a")],
                vec![Value::Int(8), Value::Null, Value::from("b")],
            ],
        )
        .unwrap();
        MemoryStore::new(StoreRole::Source).with_table(ds).unwrap()
    }

    #[tokio::test]
    async fn test_raw_copy_keeps_every_column() {
        let staging = Arc::new(MemoryStore::new(StoreRole::Staging));
        let stager = SourceStager::new(Arc::new(source()), staging.clone());

        let reports = stager
            .stage_raw_tables(&[("Sales.Customer", RAW_CUSTOMER)])
            .await
            .unwrap();
        assert_eq!(
            reports,
            vec![LoadReport {
                table: RAW_CUSTOMER.to_string(),
                rows: 2
            }]
        );

        let raw = staging.read_table(RAW_CUSTOMER).await.unwrap();
        assert_eq!(raw.column_names(), vec!["CustomerID", "PersonID", "rowguid"]);
        assert_eq!(raw.value(1, 1), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_missing_source_table_keeps_earlier_copies() {
        let staging = Arc::new(MemoryStore::new(StoreRole::Staging));
        let stager = SourceStager::new(Arc::new(source()), staging.clone());

        let err = stager
            .stage_raw_tables(&[
                ("Sales.Customer", RAW_CUSTOMER),
                ("Person.Person", RAW_PERSON),
            ])
            .await
            .unwrap_err();
        match err {
            EtlError::SourceUnavailable { table, .. } => assert_eq!(table, "Person.Person"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(staging.table_exists(RAW_CUSTOMER).await.unwrap());
        assert!(!staging.table_exists(RAW_PERSON).await.unwrap());
    }
}
