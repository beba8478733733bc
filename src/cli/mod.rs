//! Command-line front end for the pipeline

pub mod commands;
pub mod error;

pub use error::CliError;
