//! Pipeline run CLI commands

use std::path::PathBuf;

use crate::cli::commands::{block_on, load_config};
use crate::cli::error::CliError;
use crate::config::EtlConfig;
use crate::pipeline::{Pipeline, RunSummary, Stage};
use crate::store::StoreRole;

/// Run command arguments
#[derive(Debug, Clone)]
pub struct RunArgs {
    /// Configuration file, `sales-etl.toml` when absent
    pub config: Option<PathBuf>,
    /// Only this stage, every stage when absent
    pub stage: Option<Stage>,
    /// Print the run summary as JSON
    pub json: bool,
}

async fn open_pipeline(config: &EtlConfig) -> Result<Pipeline, CliError> {
    let source = config.source.open(StoreRole::Source).await?;
    let staging = config.staging.open(StoreRole::Staging).await?;
    let warehouse = config.warehouse.open(StoreRole::Warehouse).await?;
    Ok(Pipeline::new(
        source,
        staging,
        warehouse,
        config.pipeline_options(),
    ))
}

/// Run the full pipeline or a single stage
pub fn handle_run(args: &RunArgs) -> Result<(), CliError> {
    let config = load_config(args.config.as_deref())?;

    let summary = block_on(async {
        let pipeline = open_pipeline(&config).await?;
        let summary = match args.stage {
            Some(stage) => pipeline.run_stage(stage).await?,
            None => pipeline.run().await?,
        };
        Ok::<_, CliError>(summary)
    })??;

    if args.json {
        let json = serde_json::to_string_pretty(&summary)
            .map_err(|e| CliError::SerializationError(e.to_string()))?;
        println!("{}", json);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("Run {} ({} ms)", summary.run_id, summary.duration_ms);
    for report in &summary.stages {
        println!("  {} ({} ms)", report.stage, report.duration_ms);
        for table in &report.tables {
            println!("    {:<24} {:>10} rows", table.table, table.rows);
        }
        for gap in report.join_gaps.iter().filter(|g| g.dropped > 0) {
            println!(
                "    join {} dropped {} of {} rows",
                gap.join, gap.dropped, gap.total
            );
        }
        if let Some(integrity) = &report.integrity
            && integrity.dropped_rows > 0
        {
            println!("    dropped {} orphaned fact rows", integrity.dropped_rows);
        }
    }
    if let Some(total) = summary.fact_total {
        println!("Total sales published: {}", total);
    }
}
