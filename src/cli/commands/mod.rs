//! CLI command implementations

pub mod check;
pub mod config;
pub mod run;

use std::future::Future;
use std::path::Path;

use crate::cli::error::CliError;
use crate::config::EtlConfig;

/// Load the configuration file plus environment overrides
pub(crate) fn load_config(path: Option<&Path>) -> Result<EtlConfig, CliError> {
    Ok(EtlConfig::load(path)?)
}

/// Drive a future to completion on a fresh runtime
pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output, CliError> {
    let rt = tokio::runtime::Runtime::new().map_err(|e| CliError::RuntimeError(e.to_string()))?;
    Ok(rt.block_on(future))
}
