//! Sales Star ETL - batch loader from an OLTP sales schema into a star schema
//!
//! Provides:
//! - Store backends (PostgreSQL, DuckDB, in-memory) behind one async trait
//! - Raw staging of source tables
//! - Dimension and fact builders written as SQL over an in-process DataFusion session
//! - Referential and date-coverage validation of the fact
//! - Publishing of the star schema into the warehouse
//! - A pipeline runner that ties the stages together under a run lock

pub mod config;
pub mod dataset;
pub mod dimension;
pub mod engine;
pub mod error;
pub mod fact;
pub mod load;
pub mod pipeline;
pub mod schema;
pub mod stage;
pub mod store;
pub mod validate;

#[cfg(feature = "cli")]
pub mod cli;

pub use config::{BackendType, EtlConfig, StoreSection};
pub use dataset::{Column, DataType, Dataset, Value};
pub use dimension::{DimensionBuild, DimensionBuilder, JoinGap, date_key};
pub use engine::QueryEngine;
pub use error::{EtlError, EtlResult};
pub use fact::{CategoryMapping, FactBuild, FactBuilder};
pub use load::{LoadReport, StagingLoader, WarehouseLoader};
pub use pipeline::{Pipeline, PipelineOptions, RunSummary, Stage, StageReport};
pub use schema::{SchemaManager, StarSchema, TableDef};
pub use stage::{DEFAULT_SOURCE_TABLES, SourceStager};
pub use store::{MemoryStore, Store, StoreError, StoreResult, StoreRole};
pub use validate::{DimensionKeys, IntegrityReport, OrphanPolicy};

#[cfg(feature = "duckdb-backend")]
pub use store::DuckDbStore;
#[cfg(feature = "postgres-backend")]
pub use store::PostgresStore;
