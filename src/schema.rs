//! Star-schema definitions and schema reset
//!
//! Provides table definitions that render to both PostgreSQL and DuckDB DDL.
//! DuckDB does not get FOREIGN KEY clauses: a referenced table could not be
//! dropped and replaced while the fact table exists, so integrity there is
//! checked by [`crate::validate`] instead.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dataset::{DataType, Dataset};
use crate::error::{EtlError, EtlResult};
use crate::store::{Store, quote_column};

pub const DIM_PRODUCT: &str = "dim_product";
pub const DIM_CUSTOMER: &str = "dim_customer";
pub const DIM_CATEGORY: &str = "dim_category";
pub const DIM_DATE: &str = "dim_date";
pub const FACT_SALES: &str = "fact_penjualan";

pub const RAW_SALES_ORDER_DETAIL: &str = "raw_salesorderdetail";
pub const RAW_SALES_ORDER_HEADER: &str = "raw_salesorderheader";
pub const RAW_PRODUCT: &str = "raw_product";
pub const RAW_CUSTOMER: &str = "raw_customer";
pub const RAW_PERSON: &str = "raw_person";
pub const RAW_PRODUCT_CATEGORY: &str = "raw_productcategory";
pub const RAW_PRODUCT_SUBCATEGORY: &str = "raw_productsubcategory";

/// Raw staging tables, in the order they are copied
pub const RAW_TABLES: [&str; 7] = [
    RAW_SALES_ORDER_DETAIL,
    RAW_SALES_ORDER_HEADER,
    RAW_PRODUCT,
    RAW_CUSTOMER,
    RAW_PERSON,
    RAW_PRODUCT_CATEGORY,
    RAW_PRODUCT_SUBCATEGORY,
];

/// SQL dialect for rendering DDL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Postgres,
    DuckDb,
}

impl SqlDialect {
    /// Column type name in this dialect
    pub fn type_name(&self, data_type: DataType) -> &'static str {
        match (self, data_type) {
            (_, DataType::Integer) => "INT",
            (_, DataType::BigInt) => "BIGINT",
            (SqlDialect::Postgres, DataType::Serial) => "SERIAL",
            (SqlDialect::DuckDb, DataType::Serial) => "INTEGER",
            (SqlDialect::Postgres, DataType::Numeric) => "NUMERIC",
            // Bare DECIMAL is (18,3) in DuckDB, too narrow for source prices
            (SqlDialect::DuckDb, DataType::Numeric) => "DECIMAL(38,10)",
            (SqlDialect::Postgres, DataType::Double) => "DOUBLE PRECISION",
            (SqlDialect::DuckDb, DataType::Double) => "DOUBLE",
            (_, DataType::Text) => "TEXT",
            (_, DataType::Date) => "DATE",
            (_, DataType::Timestamp) => "TIMESTAMP",
            (_, DataType::Boolean) => "BOOLEAN",
        }
    }
}

/// Column definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub primary_key: bool,
}

/// Single-column foreign key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

/// Table definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Add a plain column
    pub fn column(mut self, name: &str, data_type: DataType) -> Self {
        self.columns.push(ColumnDef {
            name: name.to_string(),
            data_type,
            primary_key: false,
        });
        self
    }

    /// Add the primary key column
    pub fn key(mut self, name: &str, data_type: DataType) -> Self {
        self.columns.push(ColumnDef {
            name: name.to_string(),
            data_type,
            primary_key: true,
        });
        self
    }

    /// Add a column referencing another table's column
    pub fn reference(mut self, name: &str, data_type: DataType, table: &str, column: &str) -> Self {
        self = self.column(name, data_type);
        self.foreign_keys.push(ForeignKeyDef {
            column: name.to_string(),
            references_table: table.to_string(),
            references_column: column.to_string(),
        });
        self
    }

    /// Infer a constraint-free definition from a dataset
    ///
    /// Used for raw copies, which keep the source column set but none of its
    /// keys or indexes.
    pub fn infer(name: &str, dataset: &Dataset) -> Self {
        dataset
            .columns()
            .iter()
            .fold(Self::new(name), |def, col| def.column(&col.name, col.data_type))
    }

    /// Case-insensitive column lookup
    pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn primary_key(&self) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.primary_key)
    }

    fn serial_sequence(&self, column: &str) -> String {
        let column: String = column
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        format!("{}_{}_seq", self.name, column)
    }

    /// Render CREATE TABLE (plus any sequence it needs) for a dialect
    ///
    /// The output is identical on every call for the same definition.
    pub fn create_sql(&self, dialect: SqlDialect) -> String {
        let mut sql = String::new();

        if dialect == SqlDialect::DuckDb {
            for col in self.columns.iter().filter(|c| c.data_type == DataType::Serial) {
                sql.push_str(&format!(
                    "CREATE OR REPLACE SEQUENCE {};\n",
                    self.serial_sequence(&col.name)
                ));
            }
        }

        let lines: Vec<String> = self
            .columns
            .iter()
            .map(|col| {
                let mut line = format!(
                    "    {} {}",
                    quote_column(&col.name),
                    dialect.type_name(col.data_type)
                );
                if col.primary_key {
                    line.push_str(" PRIMARY KEY");
                }
                if dialect == SqlDialect::DuckDb && col.data_type == DataType::Serial {
                    line.push_str(&format!(
                        " DEFAULT nextval('{}')",
                        self.serial_sequence(&col.name)
                    ));
                }
                if dialect == SqlDialect::Postgres
                    && let Some(fk) = self.foreign_keys.iter().find(|fk| fk.column == col.name)
                {
                    line.push_str(&format!(
                        " REFERENCES {}({})",
                        fk.references_table,
                        quote_column(&fk.references_column)
                    ));
                }
                line
            })
            .collect();

        sql.push_str(&format!(
            "CREATE TABLE {} (\n{}\n);",
            self.name,
            lines.join(",\n")
        ));
        sql
    }

    /// Render DROP TABLE IF EXISTS for a dialect
    pub fn drop_sql(table: &str, dialect: SqlDialect) -> String {
        match dialect {
            SqlDialect::Postgres => format!("DROP TABLE IF EXISTS {} CASCADE;", table),
            SqlDialect::DuckDb => format!("DROP TABLE IF EXISTS {};", table),
        }
    }
}

/// The fixed star schema
pub struct StarSchema;

impl StarSchema {
    /// All star tables, dimensions first
    pub fn tables() -> Vec<TableDef> {
        vec![
            TableDef::new(DIM_PRODUCT)
                .key("productid", DataType::Integer)
                .column("name", DataType::Text)
                .column("color", DataType::Text)
                .column("size", DataType::Text)
                .column("weight", DataType::Numeric),
            TableDef::new(DIM_CUSTOMER)
                .key("customerid", DataType::Integer)
                .column("name", DataType::Text)
                .column("title", DataType::Text)
                .column("demographic", DataType::Text),
            TableDef::new(DIM_CATEGORY)
                .key("categoryid", DataType::Integer)
                .column("productcategoryid", DataType::Integer)
                .column("categoryname", DataType::Text)
                .column("productsubcategoryid", DataType::Integer)
                .column("subcategoryname", DataType::Text),
            TableDef::new(DIM_DATE)
                .key("datekey", DataType::Integer)
                .column("fulldate", DataType::Date)
                .column("day", DataType::Integer)
                .column("month", DataType::Integer)
                .column("year", DataType::Integer),
            TableDef::new(FACT_SALES)
                .key("factid", DataType::Serial)
                .reference("productid", DataType::Integer, DIM_PRODUCT, "productid")
                .reference("customerid", DataType::Integer, DIM_CUSTOMER, "customerid")
                .column("categoryid", DataType::Integer)
                .column("qtyproduct", DataType::Integer)
                .column("unitprice", DataType::Numeric)
                .column("unitpricedisc", DataType::Numeric)
                .column("totalpenjualan", DataType::Numeric)
                .reference("datekey", DataType::Integer, DIM_DATE, "datekey"),
        ]
    }

    /// Definition of one star table
    pub fn get(name: &str) -> Option<TableDef> {
        Self::tables()
            .into_iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Star tables ordered so every table follows the tables it references
    pub fn creation_order() -> EtlResult<Vec<TableDef>> {
        let tables = Self::tables();
        let mut graph = DiGraph::<usize, ()>::new();
        let nodes: Vec<_> = (0..tables.len()).map(|i| graph.add_node(i)).collect();
        let by_name: HashMap<&str, usize> = tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();

        for (i, table) in tables.iter().enumerate() {
            for fk in &table.foreign_keys {
                if let Some(&target) = by_name.get(fk.references_table.as_str()) {
                    graph.add_edge(nodes[target], nodes[i], ());
                }
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            EtlError::Config(format!(
                "Star schema has a reference cycle through {}",
                tables[graph[cycle.node_id()]].name
            ))
        })?;

        Ok(order.into_iter().map(|n| tables[graph[n]].clone()).collect())
    }

    /// Every table a reset removes: star tables dependents-first, then raw
    pub fn drop_order() -> EtlResult<Vec<String>> {
        let mut names: Vec<String> = Self::creation_order()?
            .into_iter()
            .rev()
            .map(|t| t.name)
            .collect();
        names.extend(RAW_TABLES.iter().map(|t| t.to_string()));
        Ok(names)
    }
}

/// Drops and recreates the star schema in the staging store
pub struct SchemaManager {
    staging: Arc<dyn Store>,
}

impl SchemaManager {
    pub fn new(staging: Arc<dyn Store>) -> Self {
        Self { staging }
    }

    /// Drop the raw and star tables if present, then create empty star tables
    ///
    /// Safe on an empty database. Touches structure only.
    ///
    /// # Returns
    /// Names of the star tables created, in creation order
    pub async fn reset_schema(&self) -> EtlResult<Vec<String>> {
        for table in StarSchema::drop_order()? {
            debug!(table = %table, "Dropping table");
            self.staging.drop_table(&table).await?;
        }
        info!("All raw and star schema tables dropped");

        let mut created = Vec::new();
        for def in StarSchema::creation_order()? {
            debug!(table = %def.name, "Creating table");
            self.staging.create_table(&def).await?;
            created.push(def.name);
        }
        info!(tables = created.len(), "Star schema tables created");

        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Column, Value};
    use crate::store::{MemoryStore, StoreRole};

    #[test]
    fn test_creation_order_puts_dimensions_before_fact() {
        let order: Vec<String> = StarSchema::creation_order()
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        let pos = |n: &str| order.iter().position(|t| t == n).unwrap();
        assert_eq!(order.len(), 5);
        assert!(pos(DIM_PRODUCT) < pos(FACT_SALES));
        assert!(pos(DIM_CUSTOMER) < pos(FACT_SALES));
        assert!(pos(DIM_DATE) < pos(FACT_SALES));
    }

    #[test]
    fn test_drop_order_starts_with_fact_and_ends_with_raw() {
        let order = StarSchema::drop_order().unwrap();
        assert_eq!(order.len(), 12);
        assert_eq!(order[0], FACT_SALES);
        assert_eq!(&order[5..], &RAW_TABLES.map(String::from));
    }

    #[test]
    fn test_postgres_ddl_for_fact() {
        let sql = StarSchema::get(FACT_SALES)
            .unwrap()
            .create_sql(SqlDialect::Postgres);
        assert!(sql.starts_with("CREATE TABLE fact_penjualan ("));
        assert!(sql.contains("\"factid\" SERIAL PRIMARY KEY"));
        assert!(sql.contains("\"productid\" INT REFERENCES dim_product(\"productid\")"));
        assert!(sql.contains("\"customerid\" INT REFERENCES dim_customer(\"customerid\")"));
        assert!(sql.contains("\"datekey\" INT REFERENCES dim_date(\"datekey\")"));
        assert!(sql.contains("\"categoryid\" INT,"));
        assert!(sql.contains("\"totalpenjualan\" NUMERIC"));
    }

    #[test]
    fn test_duckdb_ddl_uses_sequence_and_no_references() {
        let sql = StarSchema::get(FACT_SALES)
            .unwrap()
            .create_sql(SqlDialect::DuckDb);
        assert!(sql.starts_with("CREATE OR REPLACE SEQUENCE fact_penjualan_factid_seq;"));
        assert!(sql.contains(
            "\"factid\" INTEGER PRIMARY KEY DEFAULT nextval('fact_penjualan_factid_seq')"
        ));
        assert!(!sql.contains("REFERENCES"));
        assert!(sql.contains("DECIMAL(38,10)"));
    }

    #[test]
    fn test_ddl_quotes_column_names() {
        let ds = Dataset::new(
            "raw_salesorderheader",
            vec![
                Column::new("Order Date", DataType::Timestamp),
                Column::new("Serial \"No\"", DataType::Serial),
            ],
        );
        let def = TableDef::infer("raw_salesorderheader", &ds);
        let sql = def.create_sql(SqlDialect::DuckDb);
        assert!(sql.contains("\"Order Date\" TIMESTAMP"));
        assert!(sql.contains("\"Serial \"\"No\"\"\" INTEGER"));
        assert!(sql.contains("nextval('raw_salesorderheader_serial__no__seq')"));
    }

    #[test]
    fn test_ddl_is_deterministic() {
        for def in StarSchema::tables() {
            assert_eq!(
                def.create_sql(SqlDialect::Postgres),
                def.create_sql(SqlDialect::Postgres)
            );
        }
    }

    #[test]
    fn test_infer_keeps_columns_without_constraints() {
        let ds = Dataset::new(
            "raw",
            vec![
                Column::new("ProductID", DataType::Integer),
                Column::new("Name", DataType::Text),
            ],
        );
        let def = TableDef::infer("raw_product", &ds);
        assert_eq!(def.columns.len(), 2);
        assert!(def.primary_key().is_none());
        assert!(def.foreign_keys.is_empty());
        assert_eq!(def.column_def("productid").unwrap().data_type, DataType::Integer);
    }

    #[tokio::test]
    async fn test_reset_schema_on_empty_store() {
        let staging = Arc::new(MemoryStore::new(StoreRole::Staging));
        let manager = SchemaManager::new(staging.clone());

        let created = manager.reset_schema().await.unwrap();
        assert_eq!(created.len(), 5);
        for table in StarSchema::tables() {
            assert!(staging.table_exists(&table.name).await.unwrap());
            assert_eq!(staging.row_count(&table.name).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_reset_schema_clears_previous_rows_and_raw_tables() {
        let staging = Arc::new(MemoryStore::new(StoreRole::Staging));
        let manager = SchemaManager::new(staging.clone());
        manager.reset_schema().await.unwrap();

        let raw = Dataset::with_rows(
            RAW_PRODUCT,
            vec![Column::new("productid", DataType::Integer)],
            vec![vec![Value::Int(1)]],
        )
        .unwrap();
        staging
            .replace_table(&raw, &TableDef::infer(RAW_PRODUCT, &raw))
            .await
            .unwrap();
        let dims = Dataset::with_rows(
            DIM_PRODUCT,
            vec![Column::new("productid", DataType::Integer)],
            vec![vec![Value::Int(1)]],
        )
        .unwrap();
        staging
            .replace_table(&dims, &StarSchema::get(DIM_PRODUCT).unwrap())
            .await
            .unwrap();

        manager.reset_schema().await.unwrap();
        assert!(!staging.table_exists(RAW_PRODUCT).await.unwrap());
        assert_eq!(staging.row_count(DIM_PRODUCT).await.unwrap(), 0);
    }
}
