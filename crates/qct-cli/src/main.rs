//! qct: command-line front end for QCT mesh fitting.
//!
//! Fits a labelled reference mesh to a CT volume and inspects the inputs.
//!
//! # Logging
//!
//! Set the `RUST_LOG` environment variable to control log output:
//! - `RUST_LOG=qct_fit=info` - Basic operation logging
//! - `RUST_LOG=qct_fit=debug` - Per-iteration fit state
//! - `RUST_LOG=qct_fit::timing=debug` - Performance timing
//! - `RUST_LOG=qct_fit::arap=trace` - Inner deformation iterations
//!
//! # Example
//!
//! ```bash
//! # Fit and print every iteration
//! qct fit femur.toml scan.toml -o fitted.ply --trace-iterations
//!
//! # Inspect a measurement model as JSON
//! qct --format json info model femur_model.toml
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod commands;
mod output;

use commands::{fit, info};

/// qct - Fit reference meshes to quantitative CT volumes.
#[derive(Parser)]
#[command(name = "qct")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format for results
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Suppress all non-error output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Increase output verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the configured reference mesh to a volume
    Fit {
        /// Fit configuration (TOML)
        config: PathBuf,

        /// Volume descriptor (TOML)
        volume: PathBuf,

        /// Output mesh path (format determined by extension)
        #[arg(short, long)]
        output: PathBuf,

        /// Override the configured iteration limit
        #[arg(long)]
        max_iterations: Option<usize>,

        /// Print the state after every iteration
        #[arg(long)]
        trace_iterations: bool,
    },

    /// Summarize an input file
    Info {
        #[command(subcommand)]
        target: InfoTarget,
    },
}

#[derive(Subcommand)]
pub enum InfoTarget {
    /// Measurement model descriptor
    Model { path: PathBuf },
    /// Volume descriptor
    Volume { path: PathBuf },
    /// Mesh file (OBJ, PLY, STL)
    Mesh { path: PathBuf },
    /// Fit configuration
    Config { path: PathBuf },
}

/// Initialize the tracing subscriber based on verbosity level.
fn init_tracing(verbose: u8, quiet: bool) {
    if quiet {
        return;
    }

    // RUST_LOG wins over -v flags
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match verbose {
            0 => "warn",
            1 => "qct_fit=info",
            2 => "qct_fit=debug",
            _ => "trace",
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    #[cfg(debug_assertions)]
    miette::set_panic_hook();

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let result = match &cli.command {
        Commands::Fit {
            config,
            volume,
            output,
            max_iterations,
            trace_iterations,
        } => fit::run(config, volume, output, *max_iterations, *trace_iterations, &cli),
        Commands::Info { target } => info::run(target, &cli),
    };

    if let Err(e) = &result {
        if !cli.quiet {
            if let Some(qct_err) = e.downcast_ref::<qct_fit::QctError>() {
                eprintln!("{}: {}", "Error".red().bold(), qct_err);
                eprintln!("  {}: {}", "Code".cyan(), qct_err.code());
                eprintln!(
                    "  {}: {}",
                    "Suggestion".green(),
                    qct_err.recovery_suggestion()
                );
                if let Some(location) = qct_err.location() {
                    eprintln!("  {}: {}", "Location".yellow(), location);
                }
            } else {
                eprintln!("{}: {}", "Error".red().bold(), e);
                for cause in e.chain().skip(1) {
                    eprintln!("  {}: {}", "Caused by".yellow(), cause);
                }
            }
        }
        std::process::exit(1);
    }

    Ok(())
}
