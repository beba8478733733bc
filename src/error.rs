//! Pipeline error types

use datafusion::arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use thiserror::Error;

use crate::store::StoreError;

/// Result type for pipeline operations
pub type EtlResult<T> = Result<T, EtlError>;

/// Error raised by a pipeline step
///
/// Any of these aborts the remaining run. Nothing is retried and completed
/// steps are not rolled back.
#[derive(Debug, Error)]
pub enum EtlError {
    /// A store could not be reached
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// A named source table could not be read during raw staging
    #[error("Source table {table} unavailable: {reason}")]
    SourceUnavailable { table: String, reason: String },

    /// An expected column is absent from a source or raw table
    #[error("Schema mismatch: table {table} has no column {column}")]
    SchemaMismatch { table: String, column: String },

    /// An inner join dropped rows while strict joins are enabled
    #[error("Join {join} dropped {dropped} of {total} rows")]
    JoinIntegrityGap {
        join: String,
        dropped: usize,
        total: usize,
    },

    /// Fact rows reference keys missing from a dimension
    #[error(
        "Referential violation: {missing} fact rows reference {column} values absent from {dimension} (e.g. {sample:?})"
    )]
    ReferentialViolation {
        dimension: String,
        column: String,
        missing: usize,
        sample: Vec<i64>,
    },

    /// Order dates fall outside the generated date dimension
    #[error(
        "Date range coverage gap: {missing} fact rows have datekeys outside dim_date (e.g. {sample:?})"
    )]
    RangeCoverageGap { missing: usize, sample: Vec<i64> },

    /// A loader wrote a different number of rows than it was given
    #[error("Load of {table} wrote {written} rows, expected {expected}")]
    LoadCountMismatch {
        table: String,
        expected: u64,
        written: u64,
    },

    /// The requested calendar range is empty or reversed
    #[error("Invalid date range: {start} is after {end}")]
    InvalidDateRange { start: String, end: String },

    /// Another run holds the staging lock
    #[error("Another pipeline run holds the lock on the {0} store")]
    RunLocked(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store operation failed
    #[error("Store error: {0}")]
    Store(StoreError),

    /// A transform query failed to plan or execute
    #[error("Query error: {0}")]
    Query(String),
}

impl From<StoreError> for EtlError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConnectionFailed(msg) => EtlError::Connectivity(msg),
            other => EtlError::Store(other),
        }
    }
}

impl From<DataFusionError> for EtlError {
    fn from(err: DataFusionError) -> Self {
        EtlError::Query(err.to_string())
    }
}

impl From<ArrowError> for EtlError {
    fn from(err: ArrowError) -> Self {
        EtlError::Query(err.to_string())
    }
}

impl EtlError {
    /// Build a schema mismatch error
    pub fn schema_mismatch(table: impl Into<String>, column: impl Into<String>) -> Self {
        EtlError::SchemaMismatch {
            table: table.into(),
            column: column.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_failure_maps_to_connectivity() {
        let err: EtlError = StoreError::ConnectionFailed("refused".to_string()).into();
        assert!(matches!(err, EtlError::Connectivity(ref m) if m == "refused"));
    }

    #[test]
    fn test_other_store_errors_are_wrapped() {
        let err: EtlError = StoreError::TableNotFound("raw_product".to_string()).into();
        assert!(matches!(err, EtlError::Store(StoreError::TableNotFound(_))));
        assert!(err.to_string().contains("raw_product"));
    }

    #[test]
    fn test_datafusion_errors_become_query_errors() {
        let err: EtlError = DataFusionError::Plan("table raw_x not found".to_string()).into();
        assert!(matches!(err, EtlError::Query(ref m) if m.contains("raw_x")));
    }

    #[test]
    fn test_referential_violation_message() {
        let err = EtlError::ReferentialViolation {
            dimension: "dim_product".to_string(),
            column: "productid".to_string(),
            missing: 2,
            sample: vec![42, 43],
        };
        let msg = err.to_string();
        assert!(msg.contains("dim_product"));
        assert!(msg.contains("[42, 43]"));
    }
}
