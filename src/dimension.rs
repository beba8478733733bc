//! Dimension builders
//!
//! Every build reads raw tables from the staging store only, reshapes them
//! with SQL on a [`QueryEngine`], and returns a dataset shaped like its star
//! table, ready for [`crate::load::StagingLoader`].

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::dataset::{Column, DataType, Dataset, Value};
use crate::engine::QueryEngine;
use crate::error::{EtlError, EtlResult};
use crate::schema::{
    DIM_CATEGORY, DIM_CUSTOMER, DIM_DATE, DIM_PRODUCT, RAW_CUSTOMER, RAW_PERSON, RAW_PRODUCT,
    RAW_PRODUCT_CATEGORY, RAW_PRODUCT_SUBCATEGORY,
};
use crate::store::Store;

/// Rows an inner join left behind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinGap {
    /// Join label, e.g. `raw_customer -> raw_person`
    pub join: String,
    /// Left-side rows without a partner
    pub dropped: usize,
    /// Left-side rows going in
    pub total: usize,
}

/// Record an inner join's dropped rows, failing on any when `strict`
pub(crate) fn observe_join(
    join: &str,
    total: usize,
    dropped: usize,
    strict: bool,
) -> EtlResult<JoinGap> {
    let gap = JoinGap {
        join: join.to_string(),
        dropped,
        total,
    };
    if gap.dropped > 0 {
        warn!(
            join = %gap.join,
            dropped = gap.dropped,
            total = gap.total,
            "Inner join dropped rows"
        );
        if strict {
            return Err(EtlError::JoinIntegrityGap {
                join: gap.join,
                dropped: gap.dropped,
                total: gap.total,
            });
        }
    }
    Ok(gap)
}

/// A built dimension and what was discarded building it
#[derive(Debug, Clone)]
pub struct DimensionBuild {
    pub dataset: Dataset,
    pub join_gap: Option<JoinGap>,
    /// Rows removed because their natural key was already present
    pub duplicates: usize,
}

impl DimensionBuild {
    fn new(dataset: Dataset, join_gap: Option<JoinGap>) -> Self {
        Self {
            dataset,
            join_gap,
            duplicates: 0,
        }
    }

    /// Record how many of `before` rows the natural-key dedup removed
    fn deduplicated(mut self, key: &str, before: usize) -> Self {
        self.duplicates = before.saturating_sub(self.dataset.row_count());
        if self.duplicates > 0 {
            warn!(
                table = %self.dataset.name(),
                key = %key,
                duplicates = self.duplicates,
                "Removed rows with duplicate natural keys"
            );
        }
        self
    }
}

/// Builds the four dimensions from staged raw tables
pub struct DimensionBuilder {
    staging: Arc<dyn Store>,
    strict_joins: bool,
}

impl DimensionBuilder {
    pub fn new(staging: Arc<dyn Store>) -> Self {
        Self {
            staging,
            strict_joins: false,
        }
    }

    /// Fail instead of warning when a join drops rows
    pub fn strict_joins(mut self, strict: bool) -> Self {
        self.strict_joins = strict;
        self
    }

    /// Project raw_product onto dim_product, first row per productid
    pub async fn build_product(&self) -> EtlResult<DimensionBuild> {
        let raw = self.staging.read_table(RAW_PRODUCT).await?;
        let engine = QueryEngine::new();
        engine.register(
            RAW_PRODUCT,
            &raw,
            &["productid", "name", "color", "size", "weight"],
        )?;

        let sql = format!(
            r#"SELECT productid, "name", color, "size", weight
FROM (
    SELECT productid, "name", color, "size", weight,
           ROW_NUMBER() OVER (PARTITION BY productid ORDER BY _row) AS _rank
    FROM {RAW_PRODUCT}
) ranked
WHERE _rank = 1
ORDER BY productid"#
        );
        let dataset = engine.query(DIM_PRODUCT, &sql).await?;

        let build = DimensionBuild::new(dataset, None).deduplicated("productid", raw.row_count());
        info!(rows = build.dataset.row_count(), "Built dim_product");
        Ok(build)
    }

    /// Join raw_customer to raw_person and derive the display name
    ///
    /// Customers without a person record (stores, for instance) have no
    /// partner in the join and are left out. The name is NULL when either
    /// part of it is.
    pub async fn build_customer(&self) -> EtlResult<DimensionBuild> {
        let customers = self.staging.read_table(RAW_CUSTOMER).await?;
        let people = self.staging.read_table(RAW_PERSON).await?;
        let engine = QueryEngine::new();
        engine.register(RAW_CUSTOMER, &customers, &["customerid", "personid"])?;
        engine.register(
            RAW_PERSON,
            &people,
            &[
                "businessentityid",
                "firstname",
                "lastname",
                "title",
                "additionalcontactinfo",
            ],
        )?;

        let dropped = engine
            .count(&format!(
                "SELECT COUNT(*) FROM {RAW_CUSTOMER} c
WHERE NOT EXISTS (SELECT 1 FROM {RAW_PERSON} p WHERE p.businessentityid = c.personid)"
            ))
            .await?;
        let gap = observe_join(
            &format!("{} -> {}", RAW_CUSTOMER, RAW_PERSON),
            customers.row_count(),
            dropped,
            self.strict_joins,
        )?;

        let joined = customers.row_count() - dropped;
        let sql = format!(
            r#"SELECT customerid, "name", title, demographic
FROM (
    SELECT c.customerid,
           p.firstname || ' ' || p.lastname AS "name",
           p.title,
           p.additionalcontactinfo AS demographic,
           ROW_NUMBER() OVER (PARTITION BY c.customerid ORDER BY c._row, p._row) AS _rank
    FROM {RAW_CUSTOMER} c
    JOIN {RAW_PERSON} p ON p.businessentityid = c.personid
) ranked
WHERE _rank = 1
ORDER BY customerid"#
        );
        let dataset = engine.query(DIM_CUSTOMER, &sql).await?;

        let build = DimensionBuild::new(dataset, Some(gap)).deduplicated("customerid", joined);
        info!(rows = build.dataset.row_count(), "Built dim_customer");
        Ok(build)
    }

    /// Join categories to subcategories and number the pairs
    ///
    /// Each (productcategoryid, productsubcategoryid) pair is kept once.
    /// Pairs are numbered from 1 in key order, so the same source data
    /// always gets the same ids whatever order its rows arrive in.
    pub async fn build_category(&self) -> EtlResult<DimensionBuild> {
        let categories = self.staging.read_table(RAW_PRODUCT_CATEGORY).await?;
        let subcategories = self.staging.read_table(RAW_PRODUCT_SUBCATEGORY).await?;
        let engine = QueryEngine::new();
        engine.register(
            RAW_PRODUCT_CATEGORY,
            &categories,
            &["productcategoryid", "name"],
        )?;
        engine.register(
            RAW_PRODUCT_SUBCATEGORY,
            &subcategories,
            &["productcategoryid", "productsubcategoryid", "name"],
        )?;

        let dropped = engine
            .count(&format!(
                "SELECT COUNT(*) FROM {RAW_PRODUCT_CATEGORY} c
WHERE NOT EXISTS (
    SELECT 1 FROM {RAW_PRODUCT_SUBCATEGORY} s WHERE s.productcategoryid = c.productcategoryid
)"
            ))
            .await?;
        let gap = observe_join(
            &format!("{} -> {}", RAW_PRODUCT_CATEGORY, RAW_PRODUCT_SUBCATEGORY),
            categories.row_count(),
            dropped,
            self.strict_joins,
        )?;

        let joined = engine
            .count(&format!(
                "SELECT COUNT(*) FROM {RAW_PRODUCT_CATEGORY} c
JOIN {RAW_PRODUCT_SUBCATEGORY} s ON s.productcategoryid = c.productcategoryid"
            ))
            .await?;
        let sql = format!(
            r#"WITH pairs AS (
    SELECT c.productcategoryid,
           c."name" AS categoryname,
           s.productsubcategoryid,
           s."name" AS subcategoryname,
           ROW_NUMBER() OVER (
               PARTITION BY c.productcategoryid, s.productsubcategoryid
               ORDER BY c._row, s._row
           ) AS _rank
    FROM {RAW_PRODUCT_CATEGORY} c
    JOIN {RAW_PRODUCT_SUBCATEGORY} s ON s.productcategoryid = c.productcategoryid
)
SELECT CAST(ROW_NUMBER() OVER (ORDER BY productcategoryid, productsubcategoryid) AS BIGINT)
           AS categoryid,
       productcategoryid,
       categoryname,
       productsubcategoryid,
       subcategoryname
FROM pairs
WHERE _rank = 1
ORDER BY categoryid"#
        );
        let dataset = engine.query(DIM_CATEGORY, &sql).await?;

        let build = DimensionBuild::new(dataset, Some(gap))
            .deduplicated("productcategoryid, productsubcategoryid", joined);
        info!(rows = build.dataset.row_count(), "Built dim_category");
        Ok(build)
    }

    /// Generate one row per calendar day in `[start, end]`
    pub fn build_date(start: NaiveDate, end: NaiveDate) -> EtlResult<DimensionBuild> {
        if start > end {
            return Err(EtlError::InvalidDateRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }

        let mut dataset = Dataset::new(
            DIM_DATE,
            vec![
                Column::new("datekey", DataType::Integer),
                Column::new("fulldate", DataType::Date),
                Column::new("day", DataType::Integer),
                Column::new("month", DataType::Integer),
                Column::new("year", DataType::Integer),
            ],
        );
        for day in start.iter_days().take_while(|d| *d <= end) {
            dataset.push_row(vec![
                Value::Int(date_key(day)),
                Value::Date(day),
                Value::Int(day.day() as i64),
                Value::Int(day.month() as i64),
                Value::Int(day.year() as i64),
            ])?;
        }

        info!(
            rows = dataset.row_count(),
            start = %start,
            end = %end,
            "Built dim_date"
        );
        Ok(DimensionBuild::new(dataset, None))
    }
}

/// `YYYYMMDD` integer key for a date
pub fn date_key(date: NaiveDate) -> i64 {
    date.year() as i64 * 10_000 + date.month() as i64 * 100 + date.day() as i64
}
