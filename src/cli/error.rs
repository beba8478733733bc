//! CLI-specific error types

use crate::error::EtlError;
use std::path::PathBuf;
use thiserror::Error;

/// CLI-specific error type
#[derive(Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    Etl(#[from] EtlError),

    #[error("Failed to write file {0}: {1}")]
    FileWriteError(PathBuf, String),

    #[error("File already exists: {0} (use --force to overwrite)")]
    FileExists(PathBuf),

    #[error("Failed to create runtime: {0}")]
    RuntimeError(String),

    #[error("Failed to serialize output: {0}")]
    SerializationError(String),

    #[error("{0} store failed its health check")]
    Unhealthy(String),
}
