//! qct info command - summarize models, volumes, meshes and configurations.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use qct_fit::{Configuration, DiscreteRange, MeasurementModel, Mesh, Placement, VoxelVolume, load_mesh};
use serde::Serialize;

use crate::{Cli, InfoTarget, OutputFormat, output};

#[derive(Serialize)]
struct RangeInfo {
    min: f64,
    max: f64,
    stride: f64,
    elements: usize,
}

impl From<DiscreteRange> for RangeInfo {
    fn from(r: DiscreteRange) -> Self {
        Self {
            min: r.min,
            max: r.max,
            stride: r.stride,
            elements: r.element_count(),
        }
    }
}

#[derive(Serialize)]
struct LabelInfo {
    label: u32,
    scale: f64,
}

#[derive(Serialize)]
struct ModelInfo {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    sampling: RangeInfo,
    density: RangeInfo,
    angle: RangeInfo,
    labels: Vec<LabelInfo>,
}

#[derive(Serialize)]
struct VolumeInfo {
    path: String,
    size: [usize; 3],
    voxel_size: [f64; 3],
    extent: [f64; 3],
    min_value: f32,
    max_value: f32,
}

#[derive(Serialize)]
struct MeshInfo {
    path: String,
    vertices: usize,
    faces: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    bounds: Option<BoundsInfo>,
    has_colors: bool,
}

#[derive(Serialize)]
struct BoundsInfo {
    min: [f64; 3],
    max: [f64; 3],
    dimensions: [f64; 3],
}

#[derive(Serialize)]
struct ConfigInfo {
    path: String,
    model_labels: Vec<u32>,
    vertices: usize,
    faces: usize,
    rigidity_sigma: f64,
    prior_sigma: f64,
    prior_decay: f64,
    min_non_decreasing: usize,
    max_non_decreasing: usize,
    max_iterations: usize,
    placement: Placement,
}

fn bounds_of(mesh: &Mesh) -> Option<BoundsInfo> {
    mesh.bounds().map(|(min, max)| {
        let dims = max - min;
        BoundsInfo {
            min: [min.x, min.y, min.z],
            max: [max.x, max.y, max.z],
            dimensions: [dims.x, dims.y, dims.z],
        }
    })
}

fn print_range(name: &str, r: &RangeInfo) {
    println!(
        "  {}: {} to {} step {} ({} samples)",
        name.cyan(),
        r.min,
        r.max,
        r.stride,
        r.elements
    );
}

pub fn run(target: &InfoTarget, cli: &Cli) -> Result<()> {
    match target {
        InfoTarget::Model { path } => model(path, cli),
        InfoTarget::Volume { path } => volume(path, cli),
        InfoTarget::Mesh { path } => mesh(path, cli),
        InfoTarget::Config { path } => config(path, cli),
    }
}

fn model(path: &Path, cli: &Cli) -> Result<()> {
    let model = MeasurementModel::load(path)
        .with_context(|| format!("Failed to load model from {:?}", path))?;
    let info = ModelInfo {
        path: path.display().to_string(),
        name: model.name.clone(),
        sampling: model.sampling_range.into(),
        density: model.density_range.into(),
        angle: model.angle_range.into(),
        labels: model
            .tables()
            .map(|(label, table)| LabelInfo {
                label,
                scale: table.scale,
            })
            .collect(),
    };

    match cli.format {
        OutputFormat::Json => output::print(&info, cli.format, cli.quiet),
        OutputFormat::Text => {
            if !cli.quiet {
                println!("{}", "Measurement Model".bold().underline());
                println!("  {}: {}", "File".cyan(), info.path);
                if let Some(name) = &info.name {
                    println!("  {}: {}", "Name".cyan(), name);
                }
                print_range("Offsets", &info.sampling);
                print_range("Densities", &info.density);
                print_range("Angles", &info.angle);
                for l in &info.labels {
                    println!("  {} {}: scale {}", "Label".cyan(), l.label, l.scale);
                }
            }
        }
    }
    Ok(())
}

fn volume(path: &Path, cli: &Cli) -> Result<()> {
    let volume =
        VoxelVolume::load(path).with_context(|| format!("Failed to load volume from {:?}", path))?;
    let extent = volume.extent();
    let (min_value, max_value) = volume.value_range();
    let info = VolumeInfo {
        path: path.display().to_string(),
        size: volume.size(),
        voxel_size: volume.voxel_size(),
        extent: [extent.x, extent.y, extent.z],
        min_value,
        max_value,
    };

    match cli.format {
        OutputFormat::Json => output::print(&info, cli.format, cli.quiet),
        OutputFormat::Text => {
            if !cli.quiet {
                println!("{}", "Volume".bold().underline());
                println!("  {}: {}", "File".cyan(), info.path);
                println!(
                    "  {}: {} x {} x {}",
                    "Voxels".cyan(),
                    info.size[0],
                    info.size[1],
                    info.size[2]
                );
                println!(
                    "  {}: {} x {} x {}",
                    "Voxel size".cyan(),
                    info.voxel_size[0],
                    info.voxel_size[1],
                    info.voxel_size[2]
                );
                println!(
                    "  {}: {:.2} x {:.2} x {:.2}",
                    "Extent".cyan(),
                    info.extent[0],
                    info.extent[1],
                    info.extent[2]
                );
                println!(
                    "  {}: {} to {}",
                    "Values".cyan(),
                    info.min_value,
                    info.max_value
                );
            }
        }
    }
    Ok(())
}

fn mesh(path: &Path, cli: &Cli) -> Result<()> {
    let mesh = load_mesh(path).with_context(|| format!("Failed to load mesh from {:?}", path))?;
    let info = MeshInfo {
        path: path.display().to_string(),
        vertices: mesh.vertex_count(),
        faces: mesh.face_count(),
        bounds: bounds_of(&mesh),
        has_colors: mesh.vertices.iter().all(|v| v.color.is_some()),
    };

    match cli.format {
        OutputFormat::Json => output::print(&info, cli.format, cli.quiet),
        OutputFormat::Text => {
            if !cli.quiet {
                println!("{}", "Mesh".bold().underline());
                println!("  {}: {}", "File".cyan(), info.path);
                println!("  {}: {}", "Vertices".cyan(), info.vertices);
                println!("  {}: {}", "Faces".cyan(), info.faces);
                if let Some(b) = &info.bounds {
                    println!(
                        "  {}: {:.2} x {:.2} x {:.2}",
                        "Dimensions".cyan(),
                        b.dimensions[0],
                        b.dimensions[1],
                        b.dimensions[2]
                    );
                }
                println!(
                    "  {}: {}",
                    "Vertex colors".cyan(),
                    if info.has_colors { "yes" } else { "no" }
                );
            }
        }
    }
    Ok(())
}

fn config(path: &Path, cli: &Cli) -> Result<()> {
    let config = Configuration::load(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))?;
    let info = ConfigInfo {
        path: path.display().to_string(),
        model_labels: config.model.labels(),
        vertices: config.reference_mesh.vertex_count(),
        faces: config.reference_mesh.face_count(),
        rigidity_sigma: config.rigidity_sigma,
        prior_sigma: config.prior_sigma,
        prior_decay: config.prior_decay,
        min_non_decreasing: config.min_non_decreasing,
        max_non_decreasing: config.max_non_decreasing,
        max_iterations: config.max_iterations,
        placement: config.placement,
    };

    match cli.format {
        OutputFormat::Json => output::print(&info, cli.format, cli.quiet),
        OutputFormat::Text => {
            if !cli.quiet {
                println!("{}", "Fit Configuration".bold().underline());
                println!("  {}: {}", "File".cyan(), info.path);
                println!("  {}: {:?}", "Model labels".cyan(), info.model_labels);
                println!(
                    "  {}: {} vertices, {} faces",
                    "Reference".cyan(),
                    info.vertices,
                    info.faces
                );
                println!(
                    "  {}: rigidity {}, prior {} (decay {})",
                    "Sigmas".cyan(),
                    info.rigidity_sigma,
                    info.prior_sigma,
                    info.prior_decay
                );
                println!(
                    "  {}: anneal after {}, converge after {}, at most {} iterations",
                    "Schedule".cyan(),
                    info.min_non_decreasing,
                    info.max_non_decreasing,
                    info.max_iterations
                );
                println!("  {}: {:?}", "Placement".cyan(), info.placement.origin);
            }
        }
    }
    Ok(())
}
