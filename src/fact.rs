//! Sales fact builder

use std::sync::Arc;
use tracing::{info, warn};

use crate::dataset::Dataset;
use crate::dimension::{JoinGap, observe_join};
use crate::engine::QueryEngine;
use crate::error::EtlResult;
use crate::schema::{
    DIM_CATEGORY, FACT_SALES, RAW_PRODUCT, RAW_SALES_ORDER_DETAIL, RAW_SALES_ORDER_HEADER,
};
use crate::store::Store;

/// How each fact row's categoryid is filled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CategoryMapping {
    /// productid -> raw_product.productsubcategoryid -> dim_category.categoryid
    #[default]
    Subcategory,
    /// The same id on every row
    Placeholder(i64),
}

/// Built fact rows plus what the build could not resolve
#[derive(Debug, Clone)]
pub struct FactBuild {
    pub dataset: Dataset,
    pub join_gap: JoinGap,
    /// Rows left with a NULL categoryid
    pub unmapped_categories: usize,
}

/// Builds fact_penjualan from staged order tables
pub struct FactBuilder {
    staging: Arc<dyn Store>,
    category_mapping: CategoryMapping,
    strict_joins: bool,
}

impl FactBuilder {
    pub fn new(staging: Arc<dyn Store>) -> Self {
        Self {
            staging,
            category_mapping: CategoryMapping::default(),
            strict_joins: false,
        }
    }

    pub fn category_mapping(mut self, mapping: CategoryMapping) -> Self {
        self.category_mapping = mapping;
        self
    }

    /// Fail instead of warning when detail rows have no header
    pub fn strict_joins(mut self, strict: bool) -> Self {
        self.strict_joins = strict;
        self
    }

    /// Join order detail to header and derive the measures
    ///
    /// `totalpenjualan = qtyproduct * (unitprice - unitpricedisc)` in exact
    /// decimal arithmetic. `datekey` is the order date as `YYYYMMDD`. When
    /// the category mapping is [`CategoryMapping::Subcategory`], dim_category
    /// must already be staged.
    ///
    /// # Returns
    /// Rows with columns productid, customerid, categoryid, qtyproduct,
    /// unitprice, unitpricedisc, totalpenjualan, datekey, in detail order
    pub async fn build_sales_fact(&self) -> EtlResult<FactBuild> {
        let detail = self.staging.read_table(RAW_SALES_ORDER_DETAIL).await?;
        let header = self.staging.read_table(RAW_SALES_ORDER_HEADER).await?;
        let engine = QueryEngine::new();
        engine.register(
            RAW_SALES_ORDER_DETAIL,
            &detail,
            &[
                "salesorderid",
                "productid",
                "orderqty",
                "unitprice",
                "unitpricediscount",
            ],
        )?;
        engine.register(
            RAW_SALES_ORDER_HEADER,
            &header,
            &["salesorderid", "orderdate", "customerid"],
        )?;

        let dropped = engine
            .count(&format!(
                "SELECT COUNT(*) FROM {RAW_SALES_ORDER_DETAIL} d
WHERE NOT EXISTS (
    SELECT 1 FROM {RAW_SALES_ORDER_HEADER} h WHERE h.salesorderid = d.salesorderid
)"
            ))
            .await?;
        let join_gap = observe_join(
            &format!("{} -> {}", RAW_SALES_ORDER_DETAIL, RAW_SALES_ORDER_HEADER),
            detail.row_count(),
            dropped,
            self.strict_joins,
        )?;

        let (category, category_join) = self.category_source(&engine).await?;
        let sql = format!(
            "SELECT d.productid,
       h.customerid,
       {category} AS categoryid,
       d.orderqty AS qtyproduct,
       d.unitprice,
       d.unitpricediscount AS unitpricedisc,
       d.orderqty * (d.unitprice - d.unitpricediscount) AS totalpenjualan,
       CAST(date_part('year', h.orderdate) AS BIGINT) * 10000
           + CAST(date_part('month', h.orderdate) AS BIGINT) * 100
           + CAST(date_part('day', h.orderdate) AS BIGINT) AS datekey
FROM {RAW_SALES_ORDER_DETAIL} d
JOIN {RAW_SALES_ORDER_HEADER} h ON h.salesorderid = d.salesorderid
{category_join}
ORDER BY d._row, h._row"
        );
        let dataset = engine.query(FACT_SALES, &sql).await?;

        let category_idx = dataset.require_column("categoryid")?;
        let unmapped_categories = dataset
            .rows()
            .iter()
            .filter(|r| r[category_idx].is_null())
            .count();
        if unmapped_categories > 0 {
            warn!(
                rows = unmapped_categories,
                "Fact rows have no resolvable category"
            );
        }
        info!(rows = dataset.row_count(), "Built fact_penjualan");

        Ok(FactBuild {
            dataset,
            join_gap,
            unmapped_categories,
        })
    }

    /// The categoryid expression and the joins it needs
    ///
    /// With a subcategory mapping, each productid takes its first raw_product
    /// row's subcategory, then that subcategory's categoryid. The id is NULL
    /// when raw_product carries no subcategory column.
    async fn category_source(&self, engine: &QueryEngine) -> EtlResult<(String, String)> {
        if let CategoryMapping::Placeholder(id) = self.category_mapping {
            return Ok((format!("CAST({} AS BIGINT)", id), String::new()));
        }

        let products = self.staging.read_table(RAW_PRODUCT).await?;
        if !products.has_column("productsubcategoryid") {
            warn!("raw_product has no productsubcategoryid column, categoryid left NULL");
            return Ok(("CAST(NULL AS BIGINT)".to_string(), String::new()));
        }
        engine.register(RAW_PRODUCT, &products, &["productid", "productsubcategoryid"])?;

        let category = self.staging.read_table(DIM_CATEGORY).await?;
        engine.register(
            DIM_CATEGORY,
            &category,
            &["productsubcategoryid", "categoryid"],
        )?;

        let joins = format!(
            "LEFT JOIN (
    SELECT productid, productsubcategoryid
    FROM (
        SELECT productid, productsubcategoryid,
               ROW_NUMBER() OVER (PARTITION BY productid ORDER BY _row) AS _rank
        FROM {RAW_PRODUCT}
    ) ranked
    WHERE _rank = 1
) p ON p.productid = d.productid
LEFT JOIN (
    SELECT productsubcategoryid, MIN(categoryid) AS categoryid
    FROM {DIM_CATEGORY}
    GROUP BY productsubcategoryid
) c ON c.productsubcategoryid = p.productsubcategoryid"
        );
        Ok(("c.categoryid".to_string(), joins))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Column, DataType, Value};
    use crate::error::EtlError;
    use rust_decimal::Decimal;
    use crate::schema::StarSchema;
    use crate::store::{MemoryStore, StoreRole};
    use chrono::NaiveDate;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn order_tables(store: &MemoryStore, header_order_ids: &[i64]) {
        let detail = Dataset::with_rows(
            RAW_SALES_ORDER_DETAIL,
            vec![
                Column::new("SalesOrderID", DataType::Integer),
                Column::new("SalesOrderDetailID", DataType::Integer),
                Column::new("OrderQty", DataType::Integer),
                Column::new("ProductID", DataType::Integer),
                Column::new("UnitPrice", DataType::Numeric),
                Column::new("UnitPriceDiscount", DataType::Numeric),
            ],
            vec![
                vec![
                    Value::Int(1),
                    Value::Int(1),
                    Value::Int(2),
                    Value::Int(42),
                    Value::Decimal(dec("15.00")),
                    Value::Decimal(dec("0.00")),
                ],
                vec![
                    Value::Int(2),
                    Value::Int(2),
                    Value::Int(3),
                    Value::Int(43),
                    Value::Decimal(dec("10.00")),
                    Value::Decimal(dec("1.00")),
                ],
            ],
        )
        .unwrap();
        let ts = NaiveDate::from_ymd_opt(2023, 5, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let header = Dataset::with_rows(
            RAW_SALES_ORDER_HEADER,
            vec![
                Column::new("SalesOrderID", DataType::Integer),
                Column::new("OrderDate", DataType::Timestamp),
                Column::new("CustomerID", DataType::Integer),
            ],
            header_order_ids
                .iter()
                .map(|id| vec![Value::Int(*id), Value::Timestamp(ts), Value::Int(7)])
                .collect(),
        )
        .unwrap();
        store.insert_table(&detail).unwrap();
        store.insert_table(&header).unwrap();
    }

    #[tokio::test]
    async fn test_build_with_placeholder_category() {
        let store = MemoryStore::new(StoreRole::Staging);
        order_tables(&store, &[1, 2]);
        let build = FactBuilder::new(Arc::new(store))
            .category_mapping(CategoryMapping::Placeholder(1))
            .build_sales_fact()
            .await
            .unwrap();

        let ds = &build.dataset;
        assert_eq!(
            ds.column_names(),
            vec![
                "productid",
                "customerid",
                "categoryid",
                "qtyproduct",
                "unitprice",
                "unitpricedisc",
                "totalpenjualan",
                "datekey"
            ]
        );
        assert_eq!(ds.row_count(), 2);
        assert_eq!(ds.value(0, 6).and_then(Value::as_decimal), Some(dec("30.00")));
        assert_eq!(ds.value(1, 6).and_then(Value::as_decimal), Some(dec("27.00")));
        assert_eq!(ds.value(0, 7), Some(&Value::Int(20230501)));
        assert_eq!(ds.value(0, 2), Some(&Value::Int(1)));
        assert_eq!(build.unmapped_categories, 0);
        assert_eq!(build.join_gap.dropped, 0);
    }

    #[tokio::test]
    async fn test_detail_without_header_is_dropped() {
        let store = MemoryStore::new(StoreRole::Staging);
        order_tables(&store, &[1]);
        let staging: Arc<dyn Store> = Arc::new(store);

        let build = FactBuilder::new(staging.clone())
            .category_mapping(CategoryMapping::Placeholder(1))
            .build_sales_fact()
            .await
            .unwrap();
        assert_eq!(build.dataset.row_count(), 1);
        assert_eq!(build.join_gap.dropped, 1);
        assert_eq!(build.join_gap.total, 2);

        let err = FactBuilder::new(staging)
            .strict_joins(true)
            .category_mapping(CategoryMapping::Placeholder(1))
            .build_sales_fact()
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::JoinIntegrityGap { .. }));
    }

    #[tokio::test]
    async fn test_category_resolved_through_subcategory() {
        let store = MemoryStore::new(StoreRole::Staging);
        order_tables(&store, &[1, 2]);
        let products = Dataset::with_rows(
            RAW_PRODUCT,
            vec![
                Column::new("ProductID", DataType::Integer),
                Column::new("ProductSubcategoryID", DataType::Integer),
            ],
            vec![
                vec![Value::Int(42), Value::Int(14)],
                vec![Value::Int(43), Value::Null],
            ],
        )
        .unwrap();
        store.insert_table(&products).unwrap();
        let category = Dataset::with_rows(
            DIM_CATEGORY,
            vec![
                Column::new("categoryid", DataType::Integer),
                Column::new("productsubcategoryid", DataType::Integer),
            ],
            vec![vec![Value::Int(5), Value::Int(14)]],
        )
        .unwrap();
        store
            .replace_table(&category, &StarSchema::get(DIM_CATEGORY).unwrap())
            .await
            .unwrap();

        let build = FactBuilder::new(Arc::new(store))
            .build_sales_fact()
            .await
            .unwrap();
        assert_eq!(build.dataset.value(0, 2), Some(&Value::Int(5)));
        assert_eq!(build.dataset.value(1, 2), Some(&Value::Null));
        assert_eq!(build.unmapped_categories, 1);
    }

    #[tokio::test]
    async fn test_category_left_null_without_subcategory_column() {
        let store = MemoryStore::new(StoreRole::Staging);
        order_tables(&store, &[1, 2]);
        let products = Dataset::with_rows(
            RAW_PRODUCT,
            vec![Column::new("ProductID", DataType::Integer)],
            vec![vec![Value::Int(42)], vec![Value::Int(43)]],
        )
        .unwrap();
        store.insert_table(&products).unwrap();

        let build = FactBuilder::new(Arc::new(store))
            .build_sales_fact()
            .await
            .unwrap();
        assert_eq!(build.unmapped_categories, 2);
    }
}
