//! Fit configuration and its TOML loader.
//!
//! A [`Configuration`] bundles the measurement model, the labelled reference
//! mesh, the prior and rigidity scales, the stopping rules and the policy for
//! placing the reference mesh inside a volume. It is immutable once built
//! and can drive any number of fits.
//!
//! # File format
//!
//! ```toml
//! model = "femur_model.toml"
//! mesh = "femur_reference.ply"
//! labels = "femur_labels.txt"     # or a [color_map] table
//!
//! rigidity_sigma = 1.0
//! prior_sigma = 1.0
//! prior_decay = 0.9
//! min_non_decreasing = 3
//! max_non_decreasing = 10
//! max_iterations = 100
//!
//! [placement]
//! origin = { type = "relative", xyz = [0.5, 0.5, 0.25] }
//! scale = 1.0
//! rotation_degrees = [0.0, 0.0, 90.0]
//!
//! [arap]
//! patience = 5
//! max_iterations = 100
//! ```
//!
//! Relative paths resolve against the directory of the configuration file.

use std::path::Path;
use std::sync::Arc;

use nalgebra::{Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::arap::ArapParams;
use crate::color_map::{ColorTable, ColorToLabelMap};
use crate::error::{QctError, QctResult};
use crate::io::{apply_labels, load_labels, load_mesh, load_mesh_with_labels};
use crate::model::MeasurementModel;
use crate::tracing_ext::{OperationTimer, log_io_operation};
use crate::types::Mesh;
use crate::volume::{VoxelVolume, resolve_relative};

/// Where the reference mesh's bounding-box centre is moved before fitting.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlacementOrigin {
    /// Keep the mesh where it is.
    #[default]
    Untouched,
    /// Centre of the volume.
    Centered,
    /// Physical coordinate.
    Absolute { xyz: [f64; 3] },
    /// Fraction of the volume extent per axis.
    Relative { xyz: [f64; 3] },
}

/// How the reference mesh is positioned inside a volume.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Placement {
    pub origin: PlacementOrigin,
    /// Uniform scale about the bounding-box centre.
    pub scale: Option<f64>,
    /// Euler XYZ rotation in degrees about the bounding-box centre.
    pub rotation_degrees: Option<[f64; 3]>,
}

impl Placement {
    /// Centre the mesh in the volume.
    pub fn centered() -> Self {
        Self {
            origin: PlacementOrigin::Centered,
            ..Default::default()
        }
    }

    /// Target point for the mesh centre, `None` to leave it in place.
    pub fn target(&self, volume: &VoxelVolume) -> Option<Point3<f64>> {
        match self.origin {
            PlacementOrigin::Untouched => None,
            PlacementOrigin::Centered => Some(volume.center()),
            PlacementOrigin::Absolute { xyz } => Some(Point3::from(xyz)),
            PlacementOrigin::Relative { xyz } => {
                Some(Point3::from(Vector3::from(xyz).component_mul(&volume.extent())))
            }
        }
    }

    /// Place `mesh` in `volume`: scale and rotate about the bounding-box
    /// centre, then move that centre to the target.
    pub fn apply(&self, mesh: &mut Mesh, volume: &VoxelVolume) {
        let Some(pivot) = mesh.center() else {
            return;
        };
        if let Some(scale) = self.scale {
            mesh.scale_about(pivot, scale);
        }
        if let Some([rx, ry, rz]) = self.rotation_degrees {
            let rotation =
                Rotation3::from_euler_angles(rx.to_radians(), ry.to_radians(), rz.to_radians());
            mesh.rotate_about(pivot, &rotation);
        }
        if let Some(target) = self.target(volume) {
            mesh.translate(target - pivot);
        }
    }

    fn validate(&self) -> QctResult<()> {
        if let Some(scale) = self.scale {
            if !(scale.is_finite() && scale > 0.0) {
                return Err(QctError::invalid_input(format!(
                    "placement scale must be positive, got {}",
                    scale
                )));
            }
        }
        Ok(())
    }
}

/// Everything a fit needs besides the volume.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub model: Arc<MeasurementModel>,
    pub reference_mesh: Arc<Mesh>,
    /// Rigidity scale σ_E.
    pub rigidity_sigma: f64,
    /// Displacement prior scale σ_S.
    pub prior_sigma: f64,
    /// Per-iteration shrink factor of the prior variance once the fit stalls.
    pub prior_decay: f64,
    /// Non-decreasing iterations before the prior starts to anneal.
    pub min_non_decreasing: usize,
    /// Non-decreasing iterations after which the fit counts as converged.
    pub max_non_decreasing: usize,
    pub max_iterations: usize,
    /// Smallest log-likelihood gain that counts as progress.
    pub log_likelihood_tolerance: f64,
    pub placement: Placement,
    /// Density read for positions outside the volume.
    pub volume_outside_value: f64,
    /// Inner solver settings. `rigidity_sigma` here is ignored in favour of
    /// the field above.
    pub arap: ArapParams,
}

impl Configuration {
    /// Configuration with default parameters.
    pub fn new(model: MeasurementModel, reference_mesh: Mesh) -> Self {
        Self::from_shared(Arc::new(model), Arc::new(reference_mesh))
    }

    /// Configuration over an already shared model and mesh.
    pub fn from_shared(model: Arc<MeasurementModel>, reference_mesh: Arc<Mesh>) -> Self {
        Self {
            model,
            reference_mesh,
            rigidity_sigma: 1.0,
            prior_sigma: 1.0,
            prior_decay: 0.9,
            min_non_decreasing: 3,
            max_non_decreasing: 10,
            max_iterations: 100,
            log_likelihood_tolerance: 1e-6,
            placement: Placement::default(),
            volume_outside_value: f64::NAN,
            arap: ArapParams::default(),
        }
    }

    pub fn with_rigidity_sigma(mut self, sigma: f64) -> Self {
        self.rigidity_sigma = sigma;
        self
    }

    pub fn with_prior_sigma(mut self, sigma: f64) -> Self {
        self.prior_sigma = sigma;
        self
    }

    pub fn with_prior_decay(mut self, decay: f64) -> Self {
        self.prior_decay = decay;
        self
    }

    /// Annealing start and convergence patience.
    pub fn with_non_decreasing(mut self, min: usize, max: usize) -> Self {
        self.min_non_decreasing = min;
        self.max_non_decreasing = max;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn with_volume_outside_value(mut self, value: f64) -> Self {
        self.volume_outside_value = value;
        self
    }

    pub fn with_arap(mut self, arap: ArapParams) -> Self {
        self.arap = arap;
        self
    }

    /// Solver parameters with this configuration's rigidity scale.
    pub fn arap_params(&self) -> ArapParams {
        ArapParams {
            rigidity_sigma: self.rigidity_sigma,
            ..self.arap
        }
    }

    /// Check parameters and that every mesh label exists in the model.
    pub fn validate(&self) -> QctResult<()> {
        for (name, value) in [
            ("rigidity_sigma", self.rigidity_sigma),
            ("prior_sigma", self.prior_sigma),
            ("prior_decay", self.prior_decay),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(QctError::invalid_input(format!(
                    "{} must be positive and finite, got {}",
                    name, value
                )));
            }
        }
        if self.prior_decay > 1.0 {
            return Err(QctError::invalid_input(format!(
                "prior_decay must not exceed 1, got {}",
                self.prior_decay
            )));
        }
        if self.max_non_decreasing < self.min_non_decreasing {
            return Err(QctError::invalid_input(format!(
                "max_non_decreasing ({}) is below min_non_decreasing ({})",
                self.max_non_decreasing, self.min_non_decreasing
            )));
        }
        if !(self.log_likelihood_tolerance >= 0.0) {
            return Err(QctError::invalid_input(
                "log_likelihood_tolerance must be non-negative",
            ));
        }
        self.placement.validate()?;

        self.reference_mesh.validate()?;
        let labels = self.reference_mesh.labels().ok_or_else(|| {
            QctError::invalid_input("every reference mesh vertex needs a label")
        })?;
        self.model.validate_labels(&labels)
    }

    /// Load a configuration file, its model and its reference mesh.
    pub fn load(path: impl AsRef<Path>) -> QctResult<Self> {
        let path = path.as_ref();
        let _timer = OperationTimer::new("load_configuration");
        let text = std::fs::read_to_string(path).map_err(|e| QctError::io_read(path, e))?;
        let file: ConfigFile =
            toml::from_str(&text).map_err(|e| QctError::parse_error(path, e.to_string()))?;

        let model = MeasurementModel::load(resolve_relative(path, &file.model))?;
        let mesh_path = resolve_relative(path, &file.mesh);
        let mesh = match (&file.labels, &file.color_map) {
            (Some(_), Some(_)) => {
                return Err(QctError::invalid_file(
                    path,
                    "give either 'labels' or [color_map], not both",
                ));
            }
            (Some(labels), None) => {
                let mut mesh = load_mesh(&mesh_path)?;
                apply_labels(&mut mesh, &load_labels(resolve_relative(path, labels))?)?;
                mesh
            }
            (None, Some(section)) => load_mesh_with_labels(&mesh_path, &section.resolve(path)?)?,
            (None, None) => load_mesh_with_labels(&mesh_path, &ColorToLabelMap::Packed)?,
        };

        let defaults = ArapParams::default();
        let arap = file.arap.unwrap_or_default();
        let mut config = Self::new(model, mesh);
        config.rigidity_sigma = file.rigidity_sigma.unwrap_or(config.rigidity_sigma);
        config.prior_sigma = file.prior_sigma.unwrap_or(config.prior_sigma);
        config.prior_decay = file.prior_decay.unwrap_or(config.prior_decay);
        config.min_non_decreasing = file.min_non_decreasing.unwrap_or(config.min_non_decreasing);
        config.max_non_decreasing = file.max_non_decreasing.unwrap_or(config.max_non_decreasing);
        config.max_iterations = file.max_iterations.unwrap_or(config.max_iterations);
        config.log_likelihood_tolerance = file
            .log_likelihood_tolerance
            .unwrap_or(config.log_likelihood_tolerance);
        config.volume_outside_value = file
            .volume_outside_value
            .unwrap_or(config.volume_outside_value);
        config.placement = file.placement.unwrap_or_default();
        config.arap = ArapParams {
            rigidity_sigma: config.rigidity_sigma,
            patience: arap.patience.unwrap_or(defaults.patience),
            max_iterations: arap.max_iterations.unwrap_or(defaults.max_iterations),
            cg_tolerance: arap.cg_tolerance.unwrap_or(defaults.cg_tolerance),
            cg_max_iterations: arap.cg_max_iterations.unwrap_or(defaults.cg_max_iterations),
        };

        config.validate()?;
        log_io_operation("load", path, "configuration", true);
        info!(
            target: "qct_fit::io",
            labels = config.model.label_count(),
            vertices = config.reference_mesh.vertex_count(),
            "Configuration loaded"
        );
        Ok(config)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    model: String,
    mesh: String,
    labels: Option<String>,
    color_map: Option<ColorMapSection>,
    rigidity_sigma: Option<f64>,
    prior_sigma: Option<f64>,
    prior_decay: Option<f64>,
    min_non_decreasing: Option<usize>,
    max_non_decreasing: Option<usize>,
    max_iterations: Option<usize>,
    log_likelihood_tolerance: Option<f64>,
    volume_outside_value: Option<f64>,
    placement: Option<Placement>,
    arap: Option<ArapSection>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ArapSection {
    patience: Option<usize>,
    max_iterations: Option<usize>,
    cg_tolerance: Option<f64>,
    cg_max_iterations: Option<usize>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ColorMapSection {
    Packed,
    Standard,
    Table { file: String },
}

impl ColorMapSection {
    fn resolve(&self, config_path: &Path) -> QctResult<ColorToLabelMap> {
        Ok(match self {
            Self::Packed => ColorToLabelMap::Packed,
            Self::Standard => ColorToLabelMap::Table(ColorTable::standard()),
            Self::Table { file } => {
                ColorToLabelMap::Table(ColorTable::load(resolve_relative(config_path, file))?)
            }
        })
    }
}
