//! Iterative fitting of a labelled reference mesh to a volume.
//!
//! Each iteration runs five stages in a fixed order:
//!
//! 1. **Volume sampling**: recompute normals, read densities along each
//!    normal at the model's sample offsets
//! 2. **Optimal displacement**: per-vertex MAP shift and confidence weight
//! 3. **Optimal deformation**: weighted ARAP towards the shifted targets
//! 4. **Log-likelihood update**: aggregate the per-vertex posteriors
//! 5. **Convergence check**: update the non-decreasing counter, stop or loop
//!
//! [`MeshFitter::fit`] runs the whole loop. Callers that want to inspect or
//! log intermediate state drive [`MeshFitter::step`] themselves:
//!
//! ```rust,ignore
//! let fitter = MeshFitter::new(config)?;
//! let mut state = fitter.init(&volume)?;
//! while state.stage() != FitStage::Done {
//!     fitter.step(&mut state)?;
//! }
//! ```

use std::sync::Arc;

use nalgebra::{DVector, Point3, Vector3};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::arap::WeightedArapSolver;
use crate::config::Configuration;
use crate::error::{QctError, QctResult};
use crate::optimizer::DisplacementOptimizer;
use crate::sampler::{GridSampler, SamplingPosition, VolumeSampler};
use crate::tracing_ext::{OperationTimer, log_iteration, log_mesh_stats};
use crate::types::{Label, Mesh};
use crate::volume::VoxelVolume;

/// Stage the next [`MeshFitter::step`] call will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStage {
    Init,
    VolumeSampling,
    OptimalDisplacement,
    OptimalDeformation,
    LogLikelihoodUpdate,
    ConvergenceCheck,
    Done,
}

impl FitStage {
    /// Stage following this one. `finished` only matters after the
    /// convergence check.
    pub fn next(self, finished: bool) -> Self {
        match self {
            Self::Init => Self::VolumeSampling,
            Self::VolumeSampling => Self::OptimalDisplacement,
            Self::OptimalDisplacement => Self::OptimalDeformation,
            Self::OptimalDeformation => Self::LogLikelihoodUpdate,
            Self::LogLikelihoodUpdate => Self::ConvergenceCheck,
            Self::ConvergenceCheck if finished => Self::Done,
            Self::ConvergenceCheck => Self::VolumeSampling,
            Self::Done => Self::Done,
        }
    }

    /// Human-readable stage name, used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::VolumeSampling => "volume sampling",
            Self::OptimalDisplacement => "optimal displacement",
            Self::OptimalDeformation => "optimal deformation",
            Self::LogLikelihoodUpdate => "log-likelihood update",
            Self::ConvergenceCheck => "convergence check",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for FitStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of a complete fit.
#[derive(Debug, Clone)]
pub struct FitResult {
    /// Converged before the iteration limit.
    pub success: bool,
    pub deformed_mesh: Mesh,
    pub iterations: usize,
    /// Log-likelihood of the final iteration.
    pub log_likelihood: f64,
}

/// Mutable state of one fitting session over one volume.
#[derive(Debug)]
pub struct FitState<'v> {
    volume: &'v VoxelVolume,
    reference_mesh: Arc<Mesh>,
    deformed_mesh: Mesh,
    solver: WeightedArapSolver,
    labels: Vec<Label>,
    stage: FitStage,

    normals: Vec<Vector3<f64>>,
    volume_samples: Vec<f64>,
    sampling_positions: Vec<SamplingPosition>,
    displacements: Vec<f64>,
    weights: Vec<f64>,
    pending_log_likelihoods: Vec<f64>,
    log_likelihoods: Vec<f64>,
    log_likelihood_ready: bool,

    log_likelihood: f64,
    best_log_likelihood: f64,
    effective_sigma: f64,
    min_displacement_norm: f64,
    iteration: usize,
    non_decreasing: usize,
    converged: bool,
    success: bool,
}

impl<'v> FitState<'v> {
    /// Volume being fitted.
    pub fn volume(&self) -> &'v VoxelVolume {
        self.volume
    }

    /// Mesh in its current deformed configuration.
    pub fn deformed_mesh(&self) -> &Mesh {
        &self.deformed_mesh
    }

    /// Placed reference mesh, the rest shape of the deformation.
    pub fn reference_mesh(&self) -> &Mesh {
        &self.reference_mesh
    }

    pub fn displacements(&self) -> &[f64] {
        &self.displacements
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Per-vertex posterior log-likelihoods of the last update.
    pub fn log_likelihoods(&self) -> &[f64] {
        &self.log_likelihoods
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn best_log_likelihood(&self) -> f64 {
        self.best_log_likelihood
    }

    /// Prior standard deviation of the last displacement estimate.
    pub fn effective_sigma(&self) -> f64 {
        self.effective_sigma
    }

    /// Completed convergence checks.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn non_decreasing(&self) -> usize {
        self.non_decreasing
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn sampling_positions(&self) -> &[SamplingPosition] {
        &self.sampling_positions
    }

    /// Densities of the last sampling pass, vertex-major.
    pub fn volume_samples(&self) -> &[f64] {
        &self.volume_samples
    }

    /// Smallest norm of the full displacement vector seen so far.
    pub fn min_displacement_norm(&self) -> f64 {
        self.min_displacement_norm
    }

    pub fn stage(&self) -> FitStage {
        self.stage
    }

    pub fn is_done(&self) -> bool {
        self.stage == FitStage::Done
    }

    /// Consume the state into a result.
    pub fn into_result(self) -> FitResult {
        FitResult {
            success: self.success,
            deformed_mesh: self.deformed_mesh,
            iterations: self.iteration,
            log_likelihood: self.log_likelihood,
        }
    }

    fn vertex_count(&self) -> usize {
        self.deformed_mesh.vertex_count()
    }
}

/// Fits a reference mesh to volumes under one configuration.
#[derive(Debug, Clone)]
pub struct MeshFitter {
    config: Configuration,
}

impl MeshFitter {
    /// Fitter over a validated configuration.
    pub fn new(config: Configuration) -> QctResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    fn optimizer(&self) -> DisplacementOptimizer<'_> {
        DisplacementOptimizer::new(
            &self.config.model,
            self.config.prior_sigma,
            self.config.prior_decay,
            self.config.min_non_decreasing,
        )
    }

    /// Start a session: place the reference and build the deformation solver.
    pub fn init<'v>(&self, volume: &'v VoxelVolume) -> QctResult<FitState<'v>> {
        let mut placed = (*self.config.reference_mesh).clone();
        self.config.placement.apply(&mut placed, volume);
        placed.compute_vertex_normals();
        log_mesh_stats(&placed, "placed reference");

        let labels = placed
            .labels()
            .ok_or_else(|| QctError::invalid_input("every reference mesh vertex needs a label"))?;
        let solver = WeightedArapSolver::new(&placed, self.config.arap_params())?;
        let effective_sigma = self.optimizer().effective_sigma(0);

        if let Some((lo, hi)) = placed.bounds() {
            let (vlo, vhi) = volume.bounds();
            if lo.coords.inf(&vlo.coords) != vlo.coords || hi.coords.sup(&vhi.coords) != vhi.coords {
                warn!(
                    target: "qct_fit::fit",
                    "Placed reference extends outside the volume"
                );
            }
        }

        Ok(FitState {
            volume,
            reference_mesh: Arc::new(placed.clone()),
            deformed_mesh: placed,
            solver,
            labels,
            stage: FitStage::Init.next(false),
            normals: Vec::new(),
            volume_samples: Vec::new(),
            sampling_positions: Vec::new(),
            displacements: Vec::new(),
            weights: Vec::new(),
            pending_log_likelihoods: Vec::new(),
            log_likelihoods: Vec::new(),
            log_likelihood_ready: false,
            log_likelihood: f64::NEG_INFINITY,
            best_log_likelihood: f64::NEG_INFINITY,
            effective_sigma,
            min_displacement_norm: f64::INFINITY,
            iteration: 0,
            non_decreasing: 0,
            converged: false,
            success: false,
        })
    }

    /// Read densities along each vertex normal of the deformed mesh.
    pub fn volume_sampling_step(&self, state: &mut FitState<'_>) -> QctResult<()> {
        state.deformed_mesh.compute_vertex_normals();
        let normals = state.deformed_mesh.normals();
        let offsets = self.optimizer().sampling_offsets();

        let points: Vec<Point3<f64>> = state
            .deformed_mesh
            .vertices
            .iter()
            .zip(&normals)
            .flat_map(|(v, n)| offsets.iter().map(move |t| v.position + *t * n))
            .collect();

        let sampler =
            VolumeSampler::new(state.volume).with_outside_value(self.config.volume_outside_value);
        let samples = sampler.sample_all(&points);
        let positions = self
            .optimizer()
            .sampling_positions(&normals, &state.labels, &samples)?;

        debug!(
            target: "qct_fit::fit",
            samples = samples.len(),
            outside = samples.iter().filter(|s| s.is_nan()).count(),
            "Volume sampled"
        );

        state.normals = normals;
        state.volume_samples = samples;
        state.sampling_positions = positions;
        state.stage = FitStage::VolumeSampling.next(false);
        Ok(())
    }

    /// Estimate per-vertex displacements and confidence weights.
    pub fn optimal_displacement_step(&self, state: &mut FitState<'_>) -> QctResult<()> {
        let n = state.vertex_count();
        let optimizer = self.optimizer();
        if state.normals.len() != n
            || state.volume_samples.len() != n * optimizer.samples_per_vertex()
        {
            return Err(QctError::stage_order(
                FitStage::OptimalDisplacement.name(),
                "volume samples",
            ));
        }

        let estimate = optimizer.optimize(
            &state.normals,
            &state.labels,
            &state.volume_samples,
            state.non_decreasing,
        )?;

        let norm = DVector::from_column_slice(&estimate.displacements).norm();
        state.min_displacement_norm = state.min_displacement_norm.min(norm);
        state.effective_sigma = estimate.effective_sigma;
        state.displacements = estimate.displacements;
        state.weights = estimate.weights;
        state.pending_log_likelihoods = estimate.log_likelihoods;
        state.sampling_positions = estimate.positions;
        state.stage = FitStage::OptimalDisplacement.next(false);
        Ok(())
    }

    /// Deform the reference towards the displaced targets.
    pub fn optimal_deformation_step(&self, state: &mut FitState<'_>) -> QctResult<()> {
        let n = state.vertex_count();
        if state.displacements.len() != n || state.weights.len() != n || state.normals.len() != n {
            return Err(QctError::stage_order(
                FitStage::OptimalDeformation.name(),
                "displacements",
            ));
        }

        let targets: Vec<Point3<f64>> = state
            .deformed_mesh
            .vertices
            .iter()
            .zip(&state.normals)
            .zip(&state.displacements)
            .map(|((v, normal), s)| v.position + *s * normal)
            .collect();

        let fit = state.solver.fit(&targets, &state.normals, &state.weights)?;
        state.deformed_mesh.set_positions(&fit.positions)?;

        debug!(
            target: "qct_fit::fit",
            energy = format!("{:.6e}", fit.energy),
            rounds = fit.iterations,
            cg_iterations = fit.cg_iterations,
            "Mesh deformed"
        );
        state.stage = FitStage::OptimalDeformation.next(false);
        Ok(())
    }

    /// Sum the per-vertex posteriors of the last displacement estimate.
    pub fn log_likelihood_step(&self, state: &mut FitState<'_>) -> QctResult<()> {
        if state.pending_log_likelihoods.len() != state.vertex_count() {
            return Err(QctError::stage_order(
                FitStage::LogLikelihoodUpdate.name(),
                "per-vertex log-likelihoods",
            ));
        }

        state.log_likelihoods = std::mem::take(&mut state.pending_log_likelihoods);
        state.log_likelihood = state
            .log_likelihoods
            .iter()
            .filter(|l| l.is_finite())
            .sum();
        state.log_likelihood_ready = true;
        state.stage = FitStage::LogLikelihoodUpdate.next(false);
        Ok(())
    }

    /// Update the non-decreasing counter and decide whether to stop.
    pub fn convergence_test_step(&self, state: &mut FitState<'_>) -> QctResult<()> {
        if !state.log_likelihood_ready {
            return Err(QctError::stage_order(
                FitStage::ConvergenceCheck.name(),
                "log-likelihood",
            ));
        }

        if state.log_likelihood > state.best_log_likelihood + self.config.log_likelihood_tolerance {
            state.best_log_likelihood = state.log_likelihood;
            state.non_decreasing = 0;
        } else {
            state.non_decreasing += 1;
        }
        state.iteration += 1;

        log_iteration(
            state.iteration,
            state.log_likelihood,
            state.best_log_likelihood,
            state.non_decreasing,
            state.effective_sigma,
        );

        let finished = if state.non_decreasing > self.config.max_non_decreasing {
            state.converged = true;
            state.success = true;
            true
        } else if state.iteration >= self.config.max_iterations {
            state.converged = false;
            state.success = false;
            true
        } else {
            false
        };

        // The next check needs a fresh update.
        state.log_likelihood_ready = false;
        state.stage = FitStage::ConvergenceCheck.next(finished);
        Ok(())
    }

    /// Run the stage named by `state.stage()` and return the next one.
    pub fn step(&self, state: &mut FitState<'_>) -> QctResult<FitStage> {
        match state.stage {
            FitStage::Init => state.stage = FitStage::Init.next(false),
            FitStage::VolumeSampling => self.volume_sampling_step(state)?,
            FitStage::OptimalDisplacement => self.optimal_displacement_step(state)?,
            FitStage::OptimalDeformation => self.optimal_deformation_step(state)?,
            FitStage::LogLikelihoodUpdate => self.log_likelihood_step(state)?,
            FitStage::ConvergenceCheck => self.convergence_test_step(state)?,
            FitStage::Done => {}
        }
        Ok(state.stage)
    }

    /// Run stages until the current iteration's convergence check is done.
    pub fn iterate(&self, state: &mut FitState<'_>) -> QctResult<()> {
        loop {
            let ran = state.stage;
            self.step(state)?;
            if ran == FitStage::ConvergenceCheck || state.is_done() {
                return Ok(());
            }
        }
    }

    /// Fit the reference mesh to `volume`.
    pub fn fit(&self, volume: &VoxelVolume) -> QctResult<FitResult> {
        let mesh = &self.config.reference_mesh;
        let _timer = OperationTimer::with_context("fit", mesh.vertex_count(), mesh.face_count());
        let span = crate::fit_span!("mesh_fit", mesh, max_iterations = self.config.max_iterations);
        let _enter = span.enter();

        let mut state = self.init(volume)?;
        while !state.is_done() {
            self.iterate(&mut state)?;
        }

        info!(
            target: "qct_fit::fit",
            success = state.success,
            iterations = state.iteration,
            log_likelihood = format!("{:.6}", state.log_likelihood),
            min_displacement_norm = format!("{:.4}", state.min_displacement_norm),
            "Fit finished"
        );
        Ok(state.into_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;
    use crate::config::{Placement, PlacementOrigin};
    use crate::test_support::{hexagon_patch, step_model, step_volume};
    use approx::assert_relative_eq;

    fn step_config(height: f64) -> Configuration {
        Configuration::new(
            step_model(),
            hexagon_patch(Point3::new(10.0, 10.0, height), 2.0),
        )
        .with_prior_sigma(2.0)
        .with_non_decreasing(2, 4)
        .with_max_iterations(200)
    }

    #[test]
    fn test_stage_transitions() {
        assert_eq!(FitStage::Init.next(false), FitStage::VolumeSampling);
        assert_eq!(FitStage::VolumeSampling.next(true), FitStage::OptimalDisplacement);
        assert_eq!(FitStage::ConvergenceCheck.next(false), FitStage::VolumeSampling);
        assert_eq!(FitStage::ConvergenceCheck.next(true), FitStage::Done);
        assert_eq!(FitStage::Done.next(false), FitStage::Done);
    }

    #[test]
    fn test_new_validates() {
        let config = step_config(10.5).with_prior_sigma(0.0);
        let err = MeshFitter::new(config).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }

    #[test]
    fn test_init_state() {
        let volume = step_volume();
        let fitter = MeshFitter::new(step_config(10.5)).unwrap();
        let state = fitter.init(&volume).unwrap();

        assert_eq!(state.stage(), FitStage::VolumeSampling);
        assert_eq!(state.iteration(), 0);
        assert_eq!(state.best_log_likelihood(), f64::NEG_INFINITY);
        assert_eq!(state.deformed_mesh().vertex_count(), 7);
        assert_relative_eq!(state.effective_sigma(), 2.0);
        assert!(!state.converged());
    }

    #[test]
    fn test_init_applies_placement() {
        let volume = step_volume();
        let config = step_config(0.0).with_placement(Placement {
            origin: PlacementOrigin::Absolute {
                xyz: [5.0, 6.0, 7.0],
            },
            ..Placement::default()
        });
        let fitter = MeshFitter::new(config).unwrap();
        let state = fitter.init(&volume).unwrap();

        let center = state.reference_mesh().center().unwrap();
        assert_relative_eq!(center, Point3::new(5.0, 6.0, 7.0), epsilon = 1e-12);
        assert_eq!(
            state.reference_mesh().positions(),
            state.deformed_mesh().positions()
        );
    }

    #[test]
    fn test_stages_require_inputs() {
        let volume = step_volume();
        let fitter = MeshFitter::new(step_config(10.5)).unwrap();
        let mut state = fitter.init(&volume).unwrap();

        for result in [
            fitter.optimal_displacement_step(&mut state),
            fitter.optimal_deformation_step(&mut state),
            fitter.log_likelihood_step(&mut state),
            fitter.convergence_test_step(&mut state),
        ] {
            assert_eq!(result.unwrap_err().code(), ErrorCode::StageOrder);
        }
        assert_eq!(state.stage(), FitStage::VolumeSampling);
    }

    #[test]
    fn test_volume_sampling_layout() {
        let volume = step_volume();
        let fitter = MeshFitter::new(step_config(10.5)).unwrap();
        let mut state = fitter.init(&volume).unwrap();
        fitter.volume_sampling_step(&mut state).unwrap();

        // 13 offsets from -3 to 3 per vertex.
        assert_eq!(state.volume_samples().len(), 7 * 13);
        assert_eq!(state.sampling_positions().len(), 7 * 13);
        // Offset -1 of the centre vertex lands at z = 9.5.
        assert_relative_eq!(state.volume_samples()[4], 500.0, epsilon = 1e-9);
        assert_relative_eq!(state.sampling_positions()[0].angle, 0.0, epsilon = 1e-9);
        assert_eq!(state.stage(), FitStage::OptimalDisplacement);
    }

    #[test]
    fn test_first_iteration_moves_to_interface() {
        let volume = step_volume();
        let fitter = MeshFitter::new(step_config(10.5)).unwrap();
        let mut state = fitter.init(&volume).unwrap();
        fitter.iterate(&mut state).unwrap();

        assert_eq!(state.iteration(), 1);
        assert_eq!(state.non_decreasing(), 0);
        assert_eq!(state.stage(), FitStage::VolumeSampling);
        for s in state.displacements() {
            assert_relative_eq!(*s, -1.0);
        }
        assert!(state.weights().iter().all(|w| *w > 0.0));
        assert_relative_eq!(state.min_displacement_norm(), 7f64.sqrt(), epsilon = 1e-12);
        for p in state.deformed_mesh().positions() {
            assert_relative_eq!(p.z, 9.5, epsilon = 1e-6);
        }
        assert_eq!(state.best_log_likelihood(), state.log_likelihood());
    }

    #[test]
    fn test_fit_converges_on_step() {
        let volume = step_volume();
        let fitter = MeshFitter::new(step_config(10.5)).unwrap();
        let result = fitter.fit(&volume).unwrap();

        assert!(result.success);
        assert!(result.iterations < 200);
        assert!(result.log_likelihood.is_finite());
        for p in result.deformed_mesh.positions() {
            assert!((p.z - 9.5).abs() < 0.1, "vertex ended at z = {}", p.z);
        }
    }

    #[test]
    fn test_iteration_limit_is_not_success() {
        let volume = step_volume();
        let fitter = MeshFitter::new(step_config(10.5).with_max_iterations(2)).unwrap();
        let result = fitter.fit(&volume).unwrap();

        assert!(!result.success);
        assert_eq!(result.iterations, 2);
    }

    #[test]
    fn test_step_reports_next_stage() {
        let volume = step_volume();
        let fitter = MeshFitter::new(step_config(10.5)).unwrap();
        let mut state = fitter.init(&volume).unwrap();

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(fitter.step(&mut state).unwrap());
        }
        assert_eq!(
            seen,
            vec![
                FitStage::OptimalDisplacement,
                FitStage::OptimalDeformation,
                FitStage::LogLikelihoodUpdate,
                FitStage::ConvergenceCheck,
                FitStage::VolumeSampling,
            ]
        );
    }
}
