//! CLI binary entry point for sales-etl

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use sales_star_etl::cli::commands::check::{CheckArgs, handle_check};
#[cfg(feature = "cli")]
use sales_star_etl::cli::commands::config::{
    default_sample_path, handle_config_sample, handle_config_show,
};
#[cfg(feature = "cli")]
use sales_star_etl::cli::commands::run::{RunArgs, handle_run};
#[cfg(feature = "cli")]
use sales_star_etl::pipeline::Stage;
#[cfg(feature = "cli")]
use std::path::PathBuf;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "sales-etl")]
#[command(about = "Load the sales star schema from the OLTP database via staging")]
#[command(version)]
struct Cli {
    /// Configuration file (default: ./sales-etl.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Commands {
    /// Run every stage: reset, stage raw, dimensions, facts, validate, publish
    Run {
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a single stage against the current store contents
    Stage {
        /// reset-schema, stage-raw, dimensions, facts, validate or publish
        stage: Stage,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check that every configured store is reachable
    Check,
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a commented sample configuration
    Sample {
        /// Output path, '-' for stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Print the effective configuration (passwords omitted)
    Show,
}

#[cfg(feature = "cli")]
fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(feature = "cli")]
fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Run { json } => handle_run(&RunArgs {
            config: cli.config,
            stage: None,
            json,
        }),
        Commands::Stage { stage, json } => handle_run(&RunArgs {
            config: cli.config,
            stage: Some(stage),
            json,
        }),
        Commands::Check => handle_check(&CheckArgs { config: cli.config }),
        Commands::Config { command } => match command {
            ConfigCommands::Sample { output, force } => {
                handle_config_sample(&output.unwrap_or_else(default_sample_path), force)
            }
            ConfigCommands::Show => handle_config_show(cli.config),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature is not enabled. Build with --features cli");
    std::process::exit(1);
}
