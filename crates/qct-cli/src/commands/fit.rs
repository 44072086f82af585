//! qct fit command - fit the reference mesh to a volume.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use qct_fit::{Configuration, MeshFitter, VoxelVolume, save_mesh};
use serde::Serialize;

use crate::{Cli, OutputFormat, output};

#[derive(Serialize)]
struct IterationRecord {
    iteration: usize,
    log_likelihood: f64,
    best_log_likelihood: f64,
    non_decreasing: usize,
    sigma: f64,
    zero_weights: usize,
}

#[derive(Serialize)]
struct FitSummary {
    config: String,
    volume: String,
    output: String,
    success: bool,
    iterations: usize,
    log_likelihood: f64,
    min_displacement_norm: f64,
    vertices: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    history: Vec<IterationRecord>,
}

pub fn run(
    config_path: &Path,
    volume_path: &Path,
    output_path: &Path,
    max_iterations: Option<usize>,
    trace_iterations: bool,
    cli: &Cli,
) -> Result<()> {
    let mut config = Configuration::load(config_path)
        .with_context(|| format!("Failed to load configuration from {:?}", config_path))?;
    if let Some(max) = max_iterations {
        config.max_iterations = max;
    }
    let volume = VoxelVolume::load(volume_path)
        .with_context(|| format!("Failed to load volume from {:?}", volume_path))?;

    output::info(
        &format!(
            "Fitting {} vertices to a {}x{}x{} volume...",
            config.reference_mesh.vertex_count(),
            volume.size()[0],
            volume.size()[1],
            volume.size()[2]
        ),
        cli.format,
        cli.quiet,
    );

    let fitter = MeshFitter::new(config)?;
    let mut state = fitter.init(&volume)?;
    let mut history = Vec::new();
    while !state.is_done() {
        fitter.iterate(&mut state)?;
        if trace_iterations {
            let record = IterationRecord {
                iteration: state.iteration(),
                log_likelihood: state.log_likelihood(),
                best_log_likelihood: state.best_log_likelihood(),
                non_decreasing: state.non_decreasing(),
                sigma: state.effective_sigma(),
                zero_weights: state.weights().iter().filter(|w| **w == 0.0).count(),
            };
            if matches!(cli.format, OutputFormat::Text) && !cli.quiet {
                println!(
                    "  {} {:>4}  ll {:>14.4}  best {:>14.4}  stalled {:>2}  sigma {:.4}",
                    "iter".dimmed(),
                    record.iteration,
                    record.log_likelihood,
                    record.best_log_likelihood,
                    record.non_decreasing,
                    record.sigma
                );
            }
            history.push(record);
        }
    }

    save_mesh(state.deformed_mesh(), output_path)
        .with_context(|| format!("Failed to save fitted mesh to {:?}", output_path))?;

    let summary = FitSummary {
        config: config_path.display().to_string(),
        volume: volume_path.display().to_string(),
        output: output_path.display().to_string(),
        success: state.success(),
        iterations: state.iteration(),
        log_likelihood: state.log_likelihood(),
        min_displacement_norm: state.min_displacement_norm(),
        vertices: state.deformed_mesh().vertex_count(),
        history,
    };

    match cli.format {
        OutputFormat::Json => {
            output::print(&summary, cli.format, cli.quiet);
        }
        OutputFormat::Text => {
            if !cli.quiet {
                if summary.success {
                    output::success(
                        &format!("Converged; fitted mesh saved to {}", output_path.display()),
                        cli.format,
                        cli.quiet,
                    );
                } else {
                    println!(
                        "{} Iteration limit reached; last state saved to {}",
                        "!".yellow().bold(),
                        output_path.display()
                    );
                }
                println!("  {}: {}", "Iterations".cyan(), summary.iterations);
                println!(
                    "  {}: {:.4}",
                    "Log-likelihood".cyan(),
                    summary.log_likelihood
                );
                println!(
                    "  {}: {:.4}",
                    "Min displacement norm".cyan(),
                    summary.min_displacement_norm
                );
            }
        }
    }

    Ok(())
}
