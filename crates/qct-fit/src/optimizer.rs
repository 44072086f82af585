//! Per-vertex displacement estimation along surface normals.
//!
//! For every vertex the optimizer scores a grid of candidate shifts `s`
//! (twice the model's sampling range, same stride) by how well the
//! observed density profile, read at offsets `t_k + s`, matches the label's
//! measurement model. A Gaussian prior `-s² / 2σ²` keeps shifts small and
//! tightens as the fit stalls:
//!
//! ```text
//! σ² = σ_S² · decay^max(non_decreasing - min_non_decreasing, 0)
//! ```
//!
//! The posterior over the grid is normalized with a Riemann sum over the
//! stride. Its maximizing candidate gives the displacement (negated: a
//! profile that matches at `+s` means the surface sits at `-s`) and its
//! exponentiated value, divided by the label scale, gives the confidence
//! weight.
//!
//! Sampling positions and density samples are vertex-major: observation
//! `k` of vertex `v` is row `v * K + k`, with `K` the number of offsets in
//! the model's sampling range.

use nalgebra::{DMatrix, Vector3};
use rayon::prelude::*;
use tracing::debug;

use crate::discrete_range::DiscreteRange;
use crate::error::{QctError, QctResult};
use crate::model::MeasurementModel;
use crate::sampler::{ModelSampler, SamplingPosition};
use crate::tracing_ext::log_perf_section;
use crate::types::Label;

/// Result of one displacement estimation.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementEstimate {
    /// Signed shift along each vertex normal.
    pub displacements: Vec<f64>,
    /// Confidence weight γ per vertex, non-negative.
    pub weights: Vec<f64>,
    /// Posterior log-likelihood at the chosen displacement, per vertex.
    pub log_likelihoods: Vec<f64>,
    /// Prior standard deviation used for this estimate.
    pub effective_sigma: f64,
    /// Observations the estimate was computed from, vertex-major.
    pub positions: Vec<SamplingPosition>,
}

impl DisplacementEstimate {
    /// Sum of the finite per-vertex log-likelihoods.
    pub fn total_log_likelihood(&self) -> f64 {
        self.log_likelihoods.iter().filter(|v| v.is_finite()).sum()
    }
}

/// Chooses per-vertex displacements under the measurement model.
#[derive(Debug, Clone)]
pub struct DisplacementOptimizer<'a> {
    model: &'a MeasurementModel,
    sampler: ModelSampler<'a>,
    prior_sigma: f64,
    decay: f64,
    min_non_decreasing: usize,
}

/// Outcome for one posterior row.
struct RowChoice {
    displacement: f64,
    weight: f64,
    log_likelihood: f64,
}

impl<'a> DisplacementOptimizer<'a> {
    /// Create an optimizer with prior scale σ_S, decay factor and the
    /// non-decreasing count at which annealing starts.
    pub fn new(
        model: &'a MeasurementModel,
        prior_sigma: f64,
        decay: f64,
        min_non_decreasing: usize,
    ) -> Self {
        Self {
            model,
            sampler: ModelSampler::new(model),
            prior_sigma,
            decay,
            min_non_decreasing,
        }
    }

    /// Candidate displacement grid.
    pub fn displacement_range(&self) -> DiscreteRange {
        self.model.sampling_range.scaled(2.0)
    }

    /// Offsets along the normal at which densities are sampled.
    pub fn sampling_offsets(&self) -> Vec<f64> {
        self.model.sampling_range.elements()
    }

    /// Samples per vertex.
    pub fn samples_per_vertex(&self) -> usize {
        self.model.sampling_range.element_count()
    }

    /// Prior variance after `non_decreasing` stalled iterations.
    pub fn effective_variance(&self, non_decreasing: usize) -> f64 {
        let k = non_decreasing.saturating_sub(self.min_non_decreasing);
        self.prior_sigma * self.prior_sigma * self.decay.powi(k as i32)
    }

    /// Prior standard deviation after `non_decreasing` stalled iterations.
    pub fn effective_sigma(&self, non_decreasing: usize) -> f64 {
        self.effective_variance(non_decreasing).sqrt()
    }

    /// Build observations from normals, labels and density samples.
    ///
    /// The incidence angle is the angle between the normal and the z axis,
    /// folded into `[0, 90]` degrees.
    pub fn sampling_positions(
        &self,
        normals: &[Vector3<f64>],
        labels: &[Label],
        densities: &[f64],
    ) -> QctResult<Vec<SamplingPosition>> {
        let n = normals.len();
        let offsets = self.sampling_offsets();
        QctError::check_len("labels", n, labels.len())?;
        QctError::check_len("density samples", n * offsets.len(), densities.len())?;

        let positions = normals
            .par_iter()
            .zip(labels.par_iter())
            .zip(densities.par_chunks(offsets.len()))
            .flat_map_iter(|((normal, &label), samples)| {
                let angle = normal.z.abs().min(1.0).acos().to_degrees();
                offsets
                    .iter()
                    .zip(samples)
                    .map(move |(&offset, &density)| SamplingPosition {
                        offset,
                        density,
                        angle,
                        label,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        Ok(positions)
    }

    /// Estimate displacements and weights for every vertex.
    pub fn optimize(
        &self,
        normals: &[Vector3<f64>],
        labels: &[Label],
        densities: &[f64],
        non_decreasing: usize,
    ) -> QctResult<DisplacementEstimate> {
        let positions = self.sampling_positions(normals, labels, densities)?;
        let n = normals.len();
        let k = self.samples_per_vertex();
        let range = self.displacement_range();
        let grid = range.elements();

        // Evidence matrix: rows are vertices, columns are candidate shifts.
        let section = log_perf_section("displacement_evidence");
        let columns: Vec<Vec<f64>> = grid
            .par_iter()
            .map(|&shift| {
                self.sampler
                    .sample_positions(&positions, shift)
                    .chunks(k)
                    .map(|c| c.iter().sum())
                    .collect()
            })
            .collect();
        let evidence = DMatrix::from_fn(n, grid.len(), |r, c| columns[c][r]);
        drop(section);

        let variance = self.effective_variance(non_decreasing);
        let prior: Vec<f64> = grid.iter().map(|s| -0.5 * s * s / variance).collect();

        let choices: Vec<RowChoice> = (0..n)
            .into_par_iter()
            .map(|v| {
                let numerator: Vec<f64> = evidence
                    .row(v)
                    .iter()
                    .zip(&prior)
                    .map(|(e, p)| e + p)
                    .collect();
                self.choose(&numerator, &grid, range.stride, labels[v])
            })
            .collect();

        let estimate = DisplacementEstimate {
            displacements: choices.iter().map(|c| c.displacement).collect(),
            weights: choices.iter().map(|c| c.weight).collect(),
            log_likelihoods: choices.iter().map(|c| c.log_likelihood).collect(),
            effective_sigma: variance.sqrt(),
            positions,
        };

        debug!(
            target: "qct_fit::optimizer",
            vertices = n,
            candidates = grid.len(),
            sigma = format!("{:.4}", estimate.effective_sigma),
            zero_weights = estimate.weights.iter().filter(|w| **w == 0.0).count(),
            log_likelihood = format!("{:.6}", estimate.total_log_likelihood()),
            "Displacements estimated"
        );
        Ok(estimate)
    }

    /// Normalize one posterior row and pick its first maximum.
    fn choose(&self, numerator: &[f64], grid: &[f64], stride: f64, label: Label) -> RowChoice {
        let row_max = numerator
            .iter()
            .copied()
            .filter(|x| !x.is_nan())
            .fold(f64::NEG_INFINITY, f64::max);
        if !row_max.is_finite() {
            return RowChoice {
                displacement: 0.0,
                weight: 0.0,
                log_likelihood: f64::NEG_INFINITY,
            };
        }

        let mass: f64 = numerator
            .iter()
            .map(|x| x - row_max)
            .filter(|x| !x.is_nan())
            .map(f64::exp)
            .sum();
        let denominator = (stride * mass).ln();

        let mut best = 0;
        let mut best_value = f64::NEG_INFINITY;
        for (j, x) in numerator.iter().enumerate() {
            let posterior = (x - row_max) - denominator;
            if posterior > best_value {
                best = j;
                best_value = posterior;
            }
        }

        let gamma = best_value.exp();
        let gamma = if gamma.is_finite() { gamma } else { 0.0 };
        let scale = self.model.scale(label);
        let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };

        RowChoice {
            displacement: -grid[best],
            weight: gamma / scale,
            log_likelihood: best_value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discrete_range::DiscreteRange;
    use crate::test_support::{indexed_model, step_model};
    use approx::assert_relative_eq;

    fn up(n: usize) -> Vec<Vector3<f64>> {
        vec![Vector3::z(); n]
    }

    /// Densities of the step profile seen from a vertex `depth` above the
    /// interface.
    fn step_profile(model: &MeasurementModel, depth: f64) -> Vec<f64> {
        model
            .sampling_range
            .elements()
            .iter()
            .map(|t| (500.0 - 1000.0 * (t + depth)).clamp(0.0, 1000.0))
            .collect()
    }

    #[test]
    fn test_annealing_formula() {
        let model = indexed_model();
        let opt = DisplacementOptimizer::new(&model, 1.5, 0.8, 3);
        for nd in 0..=3 {
            assert_eq!(opt.effective_variance(nd), 1.5 * 1.5);
        }
        for k in 1..6 {
            assert_relative_eq!(
                opt.effective_variance(3 + k),
                2.25 * 0.8f64.powi(k as i32),
                max_relative = 1e-15
            );
        }
        assert_relative_eq!(opt.effective_sigma(4), (2.25f64 * 0.8).sqrt());
    }

    #[test]
    fn test_displacement_range_doubles_sampling_range() {
        let model = step_model();
        let opt = DisplacementOptimizer::new(&model, 1.0, 0.9, 3);
        assert_eq!(opt.displacement_range(), DiscreteRange::new(-6.0, 6.0, 0.5));
        assert_eq!(opt.displacement_range().element_count(), 25);
        assert_eq!(opt.samples_per_vertex(), 13);
    }

    #[test]
    fn test_sampling_positions_layout_and_angle() {
        let model = indexed_model();
        let opt = DisplacementOptimizer::new(&model, 1.0, 0.9, 3);
        let tilted = Vector3::new(0.0, (60f64).to_radians().sin(), -(60f64).to_radians().cos());
        let normals = vec![Vector3::z(), tilted];
        let densities = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let positions = opt.sampling_positions(&normals, &[0, 5], &densities).unwrap();

        assert_eq!(positions.len(), 6);
        assert_eq!(positions[0].offset, -4.0);
        assert_eq!(positions[2].offset, 4.0);
        assert_eq!(positions[4].density, 5.0);
        assert_eq!(positions[4].label, 5);
        assert_relative_eq!(positions[0].angle, 0.0);
        assert_relative_eq!(positions[3].angle, 60.0, epsilon = 1e-9);
        assert_eq!(positions[3].to_row(), [-4.0, 4.0, positions[3].angle, 5.0]);
    }

    #[test]
    fn test_length_mismatch_is_an_error() {
        let model = indexed_model();
        let opt = DisplacementOptimizer::new(&model, 1.0, 0.9, 3);
        let err = opt.optimize(&up(2), &[0, 0], &[0.0; 5], 0).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::LengthMismatch);
        assert!(opt.optimize(&up(2), &[0], &[0.0; 6], 0).is_err());
    }

    #[test]
    fn test_finds_interface_below_vertex() {
        let model = step_model();
        let opt = DisplacementOptimizer::new(&model, 2.0, 0.9, 3);
        // vertex one unit above the interface: surface is at -1 along the normal
        let densities = step_profile(&model, 1.0);
        let est = opt.optimize(&up(1), &[0], &densities, 0).unwrap();
        assert_relative_eq!(est.displacements[0], -1.0);
        assert!(est.weights[0] > 0.0);
        assert!(est.log_likelihoods[0].is_finite());
        assert_relative_eq!(est.effective_sigma, 2.0);
    }

    #[test]
    fn test_on_interface_stays_put() {
        let model = step_model();
        let opt = DisplacementOptimizer::new(&model, 2.0, 0.9, 3);
        let mut densities = step_profile(&model, 0.0);
        densities.extend(step_profile(&model, -1.5));
        let est = opt.optimize(&up(2), &[0, 0], &densities, 0).unwrap();
        assert_relative_eq!(est.displacements[0], 0.0);
        assert_relative_eq!(est.displacements[1], 1.5);
        assert!(est.total_log_likelihood().is_finite());
    }

    #[test]
    fn test_posterior_normalizes_to_one() {
        let model = step_model();
        let opt = DisplacementOptimizer::new(&model, 2.0, 0.9, 3);
        let densities = step_profile(&model, 0.5);
        let est = opt.optimize(&up(1), &[0], &densities, 0).unwrap();
        // the maximum of a normalized density over a stride-0.5 grid cannot
        // exceed 1 / stride
        assert!(est.weights[0] <= 2.0 + 1e-12);
        assert!(est.log_likelihoods[0] <= 2f64.ln() + 1e-12);
    }

    #[test]
    fn test_nan_samples_floor_weight_to_zero() {
        let model = step_model();
        let opt = DisplacementOptimizer::new(&model, 2.0, 0.9, 3);
        let densities = vec![f64::NAN; 13];
        let est = opt.optimize(&up(1), &[0], &densities, 0).unwrap();
        assert_eq!(est.weights[0], 0.0);
        assert_eq!(est.displacements[0], 0.0);
        assert_eq!(est.log_likelihoods[0], f64::NEG_INFINITY);
        assert_eq!(est.total_log_likelihood(), 0.0);
    }

    #[test]
    fn test_weight_divided_by_label_scale() {
        let mut model = step_model();
        let table = model.table(0).unwrap().values.clone();
        model.insert_label(1, table.clone(), 4.0).unwrap();
        model.insert_label(2, table, f64::NAN).unwrap();
        let opt = DisplacementOptimizer::new(&model, 2.0, 0.9, 3);

        let mut densities = step_profile(&model, 0.0);
        densities.extend(step_profile(&model, 0.0));
        densities.extend(step_profile(&model, 0.0));
        let est = opt.optimize(&up(3), &[0, 1, 2], &densities, 0).unwrap();
        assert_relative_eq!(est.weights[1], est.weights[0] / 4.0);
        assert_relative_eq!(est.weights[2], est.weights[0]);
    }

    #[test]
    fn test_ties_pick_lowest_index() {
        let model = step_model();
        let opt = DisplacementOptimizer::new(&model, 2.0, 0.9, 3);
        let choice = opt.choose(&[0.0, 1.0, 1.0, 0.5], &[-1.0, -0.5, 0.0, 0.5], 0.5, 0);
        assert_eq!(choice.displacement, 0.5);
    }
}
