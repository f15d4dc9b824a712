mod output;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use prism_core::error::PrismError;
use prism_core::{Prism, PrismConfig};

#[derive(Parser)]
#[command(
    name = "prism",
    about = "Split/merge tool for partitioned geospatial datasets",
    version,
    propagate_version = true
)]
struct Cli {
    /// Work-package configuration file
    #[arg(short, long, value_name = "PATH", default_value = "prism.yml")]
    config: PathBuf,

    /// Workspace directory holding base/ and input/ (output/ and tmp/ are rebuilt)
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    workspace: PathBuf,

    /// Output results as JSON
    #[arg(long)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Enable verbose/debug output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge work-package edits into the master and regenerate all packages
    Run,

    /// Validate the workspace and configuration without modifying anything
    Check,
}

fn main() {
    let cli = Cli::parse();

    // Set up logging (suppress when JSON output is requested)
    let filter = if cli.json {
        "error"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .without_time()
        .init();

    if let Err(e) = run(cli) {
        print_error(&e);
        process::exit(exit_code(&e));
    }
}

/// Map error types to differentiated exit codes.
fn exit_code(error: &PrismError) -> i32 {
    match error {
        PrismError::ConfigError(_) => 2,
        PrismError::WorkspaceInvariant(_) => 3,
        PrismError::UnsupportedSchema { .. } => 4,
        PrismError::StorageError(_) => 5,
        PrismError::ChangesetError(_) => 6,
        _ => 1,
    }
}

fn run(cli: Cli) -> Result<(), PrismError> {
    let config = PrismConfig::load(&cli.config)?;
    let prism = Prism::new(config);

    match cli.command {
        Commands::Run => {
            let report = prism.run(&cli.workspace)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report).unwrap());
            } else {
                output::print_run_summary(&report);
            }
        }
        Commands::Check => {
            let report = prism.check(&cli.workspace)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report).unwrap());
            } else {
                output::print_check_report(&report);
            }
            if !report.issues.is_empty() {
                process::exit(1);
            }
        }
    }

    Ok(())
}

fn print_error(error: &PrismError) {
    eprintln!("{} {}", "ERROR:".red().bold(), error);

    // Provide actionable guidance
    match error {
        PrismError::ConfigError(_) => {
            eprintln!(
                "{}",
                "Hint: Check your prism.yml — every table needs a method, and filter-column tables need a filter-column-name."
                    .dimmed()
            );
        }
        PrismError::WorkspaceInvariant(_) => {
            eprintln!(
                "{}",
                "Hint: base/ must hold the previous run's outputs unchanged — package files and remap.db travel together."
                    .dimmed()
            );
        }
        PrismError::UnsupportedSchema { .. } => {
            eprintln!(
                "{}",
                "Hint: Configured tables need a single-column integer primary key.".dimmed()
            );
        }
        _ => {}
    }
}
