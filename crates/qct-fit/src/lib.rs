//! Fitting of labelled reference surface meshes to quantitative CT volumes.
//!
//! Given a reference mesh whose vertices carry tissue labels, a measurement
//! model giving the likelihood of observing a density at an offset along the
//! surface normal, and a voxel volume, this crate deforms the mesh so that it
//! follows the tissue interfaces found in the volume.
//!
//! # Features
//!
//! - **Sampling**: trilinear sampling of volumes and likelihood tables
//!   through one [`GridSampler`] trait
//! - **Displacement estimation**: per-vertex MAP shift along the normal under
//!   an annealed Gaussian prior, with a confidence weight
//! - **Deformation**: weighted as-rigid-as-possible fitting with a cotangent
//!   Laplacian and point-to-plane data terms
//! - **Orchestration**: a resumable stage machine with convergence tracking
//! - **File I/O**: OBJ, PLY and STL meshes, TOML descriptors for volumes,
//!   models and fit configurations
//!
//! # Units and Coordinates
//!
//! Mesh coordinates are physical (typically mm). Volumes map voxel index `i`
//! to the physical position `i * voxel_size` along each axis, so the first
//! voxel centre sits at the origin. Normals follow counter-clockwise winding.
//!
//! # Quick Start
//!
//! ```no_run
//! use qct_fit::{Configuration, MeshFitter, VoxelVolume, save_mesh};
//!
//! let config = Configuration::load("femur.toml").unwrap();
//! let volume = VoxelVolume::load("scan.toml").unwrap();
//!
//! let fitter = MeshFitter::new(config).unwrap();
//! let result = fitter.fit(&volume).unwrap();
//! println!(
//!     "success: {} after {} iterations, log-likelihood {:.3}",
//!     result.success, result.iterations, result.log_likelihood
//! );
//! save_mesh(&result.deformed_mesh, "fitted.ply").unwrap();
//! ```
//!
//! # Stepping
//!
//! ```no_run
//! use qct_fit::{Configuration, FitStage, MeshFitter, VoxelVolume};
//!
//! let fitter = MeshFitter::new(Configuration::load("femur.toml").unwrap()).unwrap();
//! let volume = VoxelVolume::load("scan.toml").unwrap();
//! let mut state = fitter.init(&volume).unwrap();
//!
//! while state.stage() != FitStage::Done {
//!     fitter.iterate(&mut state).unwrap();
//!     println!(
//!         "iteration {}: ll {:.3}, sigma {:.3}",
//!         state.iteration(),
//!         state.log_likelihood(),
//!         state.effective_sigma()
//!     );
//! }
//! ```
//!
//! # Error Handling
//!
//! Fallible operations return `QctResult<T>`, which is `Result<T, QctError>`.
//! Every error has a stable [`ErrorCode`] and a [`RecoverySuggestion`].
//!
//! ```
//! use qct_fit::{ErrorCode, MeasurementModel};
//!
//! match MeasurementModel::load("missing.toml") {
//!     Ok(_) => println!("loaded"),
//!     Err(e) => {
//!         assert_eq!(e.code(), ErrorCode::IoRead);
//!         println!("{}", e);
//!     }
//! }
//! ```
//!
//! # Supported Formats
//!
//! | Format | Extension | Load | Save | Labels |
//! |--------|-----------|------|------|--------|
//! | OBJ    | `.obj`    | ✓    | ✓    | vertex colours |
//! | PLY    | `.ply`    | ✓    | ✓    | vertex colours |
//! | STL    | `.stl`    | ✓    | ✓    | ✗ |

mod error;
pub mod tracing_ext;
mod types;

#[cfg(test)]
mod test_support;

pub mod arap;
pub mod color_map;
pub mod config;
pub mod discrete_range;
pub mod fitter;
pub mod io;
pub mod model;
pub mod optimizer;
pub mod sampler;
pub mod volume;

// Re-export core types at crate root
pub use error::{ErrorCode, ErrorLocation, QctError, QctResult, RecoverySuggestion};
pub use types::{Label, Mesh, Triangle, Vertex, VertexColor};

pub use arap::{ArapFit, ArapParams, WeightedArapSolver, cotangent_laplacian};
pub use color_map::{ColorTable, ColorToLabelMap};
pub use config::{Configuration, Placement, PlacementOrigin};
pub use discrete_range::DiscreteRange;
pub use fitter::{FitResult, FitStage, FitState, MeshFitter};
pub use io::{
    MeshFormat, apply_labels, load_labels, load_mesh, load_mesh_with_labels, save_mesh,
};
pub use model::{LabelTable, MeasurementModel};
pub use optimizer::{DisplacementEstimate, DisplacementOptimizer};
pub use sampler::{
    GridSampler, LabelTableSampler, LatticeSampler, ModelSampler, SamplingPosition,
    VolumeSampler,
};
pub use volume::{ByteOrder, SampleType, VolumeDescriptor, VoxelVolume};
