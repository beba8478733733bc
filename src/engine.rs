//! SQL engine for the transform stages
//!
//! Builders register the staged tables they read, then express joins,
//! dedup and ordering as SQL. Results come back as [`Dataset`]s for the
//! loaders. Unquoted identifiers fold to lowercase, and registered field
//! names are lowercased to match.

use std::sync::Arc;

use datafusion::arrow::array::{ArrayRef, Int64Array};
use datafusion::arrow::datatypes::{DataType as ArrowType, Field, Schema};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::datasource::MemTable;
use datafusion::prelude::{SessionConfig, SessionContext};
use tracing::debug;

use crate::dataset::{Dataset, Value};
use crate::error::{EtlError, EtlResult};

/// Ordinal column appended to every registered table
///
/// Holds each row's position in the source dataset, so "first row wins"
/// dedup and source-order output can be written as `ORDER BY _row`.
pub const ROW_ORDINAL: &str = "_row";

/// Single-partition DataFusion session over in-memory tables
pub struct QueryEngine {
    ctx: SessionContext,
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryEngine {
    pub fn new() -> Self {
        let config = SessionConfig::new().with_target_partitions(1);
        Self {
            ctx: SessionContext::new_with_config(config),
        }
    }

    /// Register a dataset under `table`
    ///
    /// Every column in `required` must exist, otherwise the dataset's
    /// schema mismatch is returned before any SQL runs.
    pub fn register(&self, table: &str, dataset: &Dataset, required: &[&str]) -> EtlResult<()> {
        for column in required {
            dataset.require_column(column)?;
        }

        let batch = dataset.to_record_batch()?;
        let ordinals: ArrayRef = Arc::new(Int64Array::from_iter_values(
            0..batch.num_rows() as i64,
        ));
        let mut fields: Vec<Field> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();
        fields.push(Field::new(ROW_ORDINAL, ArrowType::Int64, false));
        let mut columns = batch.columns().to_vec();
        columns.push(ordinals);

        let schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(schema.clone(), columns)?;
        let provider = MemTable::try_new(schema, vec![vec![batch]])?;
        self.ctx.register_table(table, Arc::new(provider))?;

        debug!(table = %table, rows = dataset.row_count(), "Registered table");
        Ok(())
    }

    /// Run a query and collect the result as a dataset called `name`
    pub async fn query(&self, name: &str, sql: &str) -> EtlResult<Dataset> {
        debug!(name = %name, sql = %sql, "Running query");
        let frame = self.ctx.sql(sql).await?;
        let schema = frame.schema().as_arrow().clone();
        let batches = frame.collect().await?;
        Dataset::from_record_batches(name, &schema, &batches)
    }

    /// Run a query returning a single count
    pub async fn count(&self, sql: &str) -> EtlResult<usize> {
        let result = self.query("count", sql).await?;
        result
            .value(0, 0)
            .and_then(Value::as_i64)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| EtlError::Query(format!("Query returned no count: {}", sql)))
    }
}
