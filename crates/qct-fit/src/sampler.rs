//! Trilinear sampling over implicit regular lattices.
//!
//! [`GridSampler`] is the capability set a lattice provides: how to turn a
//! cell coordinate into a storage index, which cells lie outside, what an
//! outside cell reads as, and optional coordinate and value transforms.
//! Sampling itself is a provided method shared by every lattice:
//!
//! 1. map the position through [`GridSampler::coord_transform`]
//! 2. read the 8 surrounding cells (floor/ceil per axis), each passed
//!    through [`GridSampler::inverse_value_transform`], or
//!    [`GridSampler::outside_value`] for cells outside the lattice
//! 3. blend trilinearly and apply [`GridSampler::value_transform`]
//!
//! At integer lattice coordinates floor and ceil coincide, so the stored
//! value comes back unchanged. Outside values (NaN for volumes) propagate
//! through the blend instead of panicking.
//!
//! Three lattices are provided:
//!
//! - [`LatticeSampler`]: an owned dense lattice, NaN outside
//! - [`VolumeSampler`]: a [`VoxelVolume`] addressed in physical coordinates
//! - [`LabelTableSampler`]: one label table of a [`MeasurementModel`],
//!   addressed by `(offset, density, angle)` and returning log-likelihoods
//!
//! [`ModelSampler`] dispatches sampling positions to the table of their label.
//!
//! # Example
//!
//! ```
//! use nalgebra::Point3;
//! use qct_fit::{GridSampler, LatticeSampler};
//!
//! let cube = LatticeSampler::new([2, 2, 2], vec![1.0, 2.0, 11.0, 12.0, 101.0, 102.0, 111.0, 112.0])
//!     .unwrap();
//! assert_eq!(cube.sample(&Point3::new(0.5, 0.5, 0.5)), 56.5);
//! assert!(cube.sample(&Point3::new(1.001, 0.0, 0.0)).is_nan());
//! ```

use hashbrown::HashMap;
use nalgebra::Point3;
use rayon::prelude::*;

use crate::discrete_range::DiscreteRange;
use crate::error::{QctError, QctResult};
use crate::model::MeasurementModel;
use crate::types::Label;
use crate::volume::VoxelVolume;

/// A regular lattice that can be sampled trilinearly.
///
/// Cell coordinates are signed so that neighbours of boundary positions can
/// be represented before [`GridSampler::is_outside`] rejects them.
pub trait GridSampler: Sync {
    /// Lattice extent per axis.
    fn dims(&self) -> [usize; 3];

    /// Stored value at a storage index.
    fn cell_value(&self, index: usize) -> f64;

    /// Storage index of a cell, x fastest.
    fn to_linear_index(&self, cell: [i64; 3]) -> usize {
        let [w, h, _] = self.dims();
        cell[2] as usize * w * h + cell[1] as usize * w + cell[0] as usize
    }

    /// Whether a cell lies outside the stored lattice.
    fn is_outside(&self, cell: [i64; 3]) -> bool {
        let dims = self.dims();
        cell.iter()
            .zip(dims)
            .any(|(&c, n)| c < 0 || c >= n as i64)
    }

    /// Value read for cells outside the lattice.
    fn outside_value(&self) -> f64 {
        f64::NAN
    }

    /// Applied to the blended value.
    fn value_transform(&self, value: f64) -> f64 {
        value
    }

    /// Applied to each cell value before blending.
    fn inverse_value_transform(&self, value: f64) -> f64 {
        value
    }

    /// Maps a query position to continuous lattice coordinates.
    fn coord_transform(&self, position: &Point3<f64>) -> Point3<f64> {
        *position
    }

    /// Value of one cell after the outside check and inverse transform.
    fn lattice_value(&self, cell: [i64; 3]) -> f64 {
        if self.is_outside(cell) {
            self.outside_value()
        } else {
            self.inverse_value_transform(self.cell_value(self.to_linear_index(cell)))
        }
    }

    /// Trilinearly interpolated value at a position.
    fn sample(&self, position: &Point3<f64>) -> f64 {
        let p = self.coord_transform(position);
        let lo = [p.x.floor(), p.y.floor(), p.z.floor()];
        let frac = [p.x - lo[0], p.y - lo[1], p.z - lo[2]];
        let c0 = [lo[0] as i64, lo[1] as i64, lo[2] as i64];
        let c1 = [p.x.ceil() as i64, p.y.ceil() as i64, p.z.ceil() as i64];

        let corner = |x: i64, y: i64, z: i64| self.lattice_value([x, y, z]);
        let lerp = |a: f64, b: f64, t: f64| a * (1.0 - t) + b * t;

        let c00 = lerp(corner(c0[0], c0[1], c0[2]), corner(c1[0], c0[1], c0[2]), frac[0]);
        let c10 = lerp(corner(c0[0], c1[1], c0[2]), corner(c1[0], c1[1], c0[2]), frac[0]);
        let c01 = lerp(corner(c0[0], c0[1], c1[2]), corner(c1[0], c0[1], c1[2]), frac[0]);
        let c11 = lerp(corner(c0[0], c1[1], c1[2]), corner(c1[0], c1[1], c1[2]), frac[0]);

        let c0_ = lerp(c00, c10, frac[1]);
        let c1_ = lerp(c01, c11, frac[1]);

        self.value_transform(lerp(c0_, c1_, frac[2]))
    }

    /// Sample every position, in parallel.
    fn sample_all(&self, positions: &[Point3<f64>]) -> Vec<f64>
    where
        Self: Sized,
    {
        positions.par_iter().map(|p| self.sample(p)).collect()
    }

    /// Sample every position into an existing buffer, in parallel.
    fn sample_into(&self, positions: &[Point3<f64>], out: &mut [f64]) -> QctResult<()>
    where
        Self: Sized,
    {
        QctError::check_len("sample buffer", positions.len(), out.len())?;
        out.par_iter_mut()
            .zip(positions.par_iter())
            .for_each(|(o, p)| *o = self.sample(p));
        Ok(())
    }
}

/// An owned dense lattice, x fastest, NaN outside.
#[derive(Debug, Clone, PartialEq)]
pub struct LatticeSampler {
    dims: [usize; 3],
    values: Vec<f64>,
}

impl LatticeSampler {
    /// Create a lattice, checking that `values` fills `dims`.
    pub fn new(dims: [usize; 3], values: Vec<f64>) -> QctResult<Self> {
        QctError::check_len("lattice values", dims.iter().product(), values.len())?;
        Ok(Self { dims, values })
    }
}

impl GridSampler for LatticeSampler {
    fn dims(&self) -> [usize; 3] {
        self.dims
    }

    fn cell_value(&self, index: usize) -> f64 {
        self.values[index]
    }
}

/// Samples a voxel volume at physical positions.
#[derive(Debug, Clone, Copy)]
pub struct VolumeSampler<'a> {
    volume: &'a VoxelVolume,
    outside: f64,
}

impl<'a> VolumeSampler<'a> {
    /// Sampler returning NaN outside the volume.
    pub fn new(volume: &'a VoxelVolume) -> Self {
        Self {
            volume,
            outside: f64::NAN,
        }
    }

    /// Use a different value outside the volume.
    pub fn with_outside_value(mut self, outside: f64) -> Self {
        self.outside = outside;
        self
    }

    /// The sampled volume.
    pub fn volume(&self) -> &'a VoxelVolume {
        self.volume
    }
}

impl GridSampler for VolumeSampler<'_> {
    fn dims(&self) -> [usize; 3] {
        self.volume.size()
    }

    fn cell_value(&self, index: usize) -> f64 {
        self.volume.data()[index] as f64
    }

    fn outside_value(&self) -> f64 {
        self.outside
    }

    fn coord_transform(&self, position: &Point3<f64>) -> Point3<f64> {
        let s = self.volume.voxel_size();
        Point3::new(position.x / s[0], position.y / s[1], position.z / s[2])
    }
}

/// Samples one label table of a measurement model.
///
/// Positions are `(offset, density, angle)` in axis units. Queries beyond
/// the table clamp to its border. The result is the natural log of the
/// interpolated likelihood.
#[derive(Debug, Clone, Copy)]
pub struct LabelTableSampler<'a> {
    axes: [DiscreteRange; 3],
    dims: [usize; 3],
    values: &'a [f64],
}

impl<'a> LabelTableSampler<'a> {
    /// Sampler over the table of `label`, `None` if the model lacks it.
    pub fn new(model: &'a MeasurementModel, label: Label) -> Option<Self> {
        let table = model.table(label)?;
        Some(Self {
            axes: [model.sampling_range, model.density_range, model.angle_range],
            dims: model.dims(),
            values: &table.values,
        })
    }

    fn clamp(c: i64, n: usize) -> usize {
        c.clamp(0, n as i64 - 1) as usize
    }
}

impl GridSampler for LabelTableSampler<'_> {
    fn dims(&self) -> [usize; 3] {
        self.dims
    }

    fn cell_value(&self, index: usize) -> f64 {
        self.values[index]
    }

    fn to_linear_index(&self, cell: [i64; 3]) -> usize {
        let [nt, nd, na] = self.dims;
        let t = Self::clamp(cell[0], nt);
        let d = Self::clamp(cell[1], nd);
        let a = Self::clamp(cell[2], na);
        a * nt * nd + d * nt + t
    }

    fn is_outside(&self, _cell: [i64; 3]) -> bool {
        false
    }

    fn value_transform(&self, value: f64) -> f64 {
        value.ln()
    }

    fn coord_transform(&self, position: &Point3<f64>) -> Point3<f64> {
        Point3::new(
            self.axes[0].index_of(position.x),
            self.axes[1].index_of(position.y),
            self.axes[2].index_of(position.z),
        )
    }
}

/// One observation: offset along the normal, sampled density, incidence
/// angle in degrees, and the vertex label.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingPosition {
    pub offset: f64,
    pub density: f64,
    pub angle: f64,
    pub label: Label,
}

impl SamplingPosition {
    /// Row form `[offset, density, angle, label]`.
    pub fn to_row(&self) -> [f64; 4] {
        [self.offset, self.density, self.angle, self.label as f64]
    }
}

/// Evaluates observations under the table selected by their label.
#[derive(Debug, Clone)]
pub struct ModelSampler<'a> {
    tables: HashMap<Label, LabelTableSampler<'a>>,
}

impl<'a> ModelSampler<'a> {
    /// Build samplers for every label of the model.
    pub fn new(model: &'a MeasurementModel) -> Self {
        let tables = model
            .labels()
            .into_iter()
            .filter_map(|label| LabelTableSampler::new(model, label).map(|s| (label, s)))
            .collect();
        Self { tables }
    }

    /// Sampler for one label.
    pub fn table(&self, label: Label) -> Option<&LabelTableSampler<'a>> {
        self.tables.get(&label)
    }

    /// Log-likelihood of one observation shifted by `displacement`.
    ///
    /// Unknown labels read as NaN.
    pub fn sample_position(&self, position: &SamplingPosition, displacement: f64) -> f64 {
        match self.tables.get(&position.label) {
            Some(table) => table.sample(&Point3::new(
                position.offset + displacement,
                position.density,
                position.angle,
            )),
            None => f64::NAN,
        }
    }

    /// Log-likelihood of every observation shifted by `displacement`.
    pub fn sample_positions(&self, positions: &[SamplingPosition], displacement: f64) -> Vec<f64> {
        positions
            .par_iter()
            .map(|p| self.sample_position(p, displacement))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{corner_cube, indexed_model};
    use approx::assert_relative_eq;

    #[test]
    fn test_exact_lattice_recovery() {
        let cube = corner_cube();
        let expected = [1.0, 2.0, 11.0, 12.0, 101.0, 102.0, 111.0, 112.0];
        let mut i = 0;
        for z in 0..2 {
            for y in 0..2 {
                for x in 0..2 {
                    let v = cube.sample(&Point3::new(x as f64, y as f64, z as f64));
                    assert_eq!(v, expected[i], "corner ({}, {}, {})", x, y, z);
                    i += 1;
                }
            }
        }
    }

    #[test]
    fn test_trilinear_midpoints() {
        let cube = corner_cube();
        assert_eq!(cube.sample(&Point3::new(0.5, 0.0, 0.0)), 1.5);
        assert_eq!(cube.sample(&Point3::new(0.5, 0.5, 0.5)), 56.5);
        assert_relative_eq!(cube.sample(&Point3::new(0.0, 0.25, 0.0)), 3.5);
    }

    #[test]
    fn test_outside_is_nan() {
        let cube = corner_cube();
        for p in [
            Point3::new(1.001, 0.0, 0.0),
            Point3::new(-0.001, 0.0, 0.0),
            Point3::new(0.5, 1.5, 0.5),
            Point3::new(0.0, 0.0, -3.0),
        ] {
            assert!(!cube.sample(&p).is_finite(), "{:?} should be outside", p);
        }
    }

    #[test]
    fn test_nan_position_propagates() {
        let cube = corner_cube();
        assert!(cube.sample(&Point3::new(f64::NAN, 0.0, 0.0)).is_nan());
    }

    #[test]
    fn test_sample_all_matches_sample() {
        let cube = corner_cube();
        let positions = vec![
            Point3::new(0.1, 0.2, 0.3),
            Point3::new(0.9, 0.0, 1.0),
            Point3::new(2.0, 0.0, 0.0),
        ];
        let all = cube.sample_all(&positions);
        for (p, v) in positions.iter().zip(&all) {
            let single = cube.sample(p);
            assert!(single == *v || (single.is_nan() && v.is_nan()));
        }

        let mut out = vec![0.0; 2];
        assert!(cube.sample_into(&positions, &mut out).is_err());
    }

    #[test]
    fn test_volume_sampler_uses_voxel_spacing() {
        let vol = VoxelVolume::from_fn([4, 4, 4], [0.5, 2.0, 1.0], |x, y, z| {
            (x + 10 * y + 100 * z) as f32
        })
        .unwrap();
        let sampler = VolumeSampler::new(&vol);
        // physical (0.5, 2.0, 1.0) is voxel (1, 1, 1)
        assert_eq!(sampler.sample(&Point3::new(0.5, 2.0, 1.0)), 111.0);
        assert_relative_eq!(sampler.sample(&Point3::new(0.25, 0.0, 0.0)), 0.5);
        assert!(sampler.sample(&Point3::new(1.75, 0.0, 0.0)).is_nan());

        let zero_outside = VolumeSampler::new(&vol).with_outside_value(0.0);
        assert_eq!(zero_outside.sample(&Point3::new(-10.0, 0.0, 0.0)), 0.0);
    }

    #[test]
    fn test_label_table_axis_order() {
        let model = indexed_model();
        let sampler = LabelTableSampler::new(&model, 0).unwrap();
        // second offset, fourth density, third angle (1-based)
        let v = sampler.sample(&Point3::new(0.0, 1300.0, 46.0));
        assert_relative_eq!(v, (2.0 + 0.4 + 0.03f64).ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_label_table_interpolates_then_logs() {
        let model = indexed_model();
        let sampler = LabelTableSampler::new(&model, 0).unwrap();
        let v = sampler.sample(&Point3::new(0.0, 350.0, 14.5));
        let y = 1.0 + 850.0 / 600.0;
        let z = 1.0 + 4.5 / 18.0;
        assert_relative_eq!(v, (2.0f64 + 0.1 * y + 0.01 * z).ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_label_table_clamps_at_border() {
        let model = indexed_model();
        let sampler = LabelTableSampler::new(&model, 0).unwrap();
        let inside = sampler.sample(&Point3::new(4.0, -500.0, 10.0));
        let beyond = sampler.sample(&Point3::new(12.0, -900.0, 0.0));
        assert_relative_eq!(inside, 3.11f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(beyond, inside, epsilon = 1e-12);
    }

    #[test]
    fn test_model_sampler_applies_displacement() {
        let model = indexed_model();
        let sampler = ModelSampler::new(&model);
        let positions = [
            SamplingPosition {
                offset: -4.0,
                density: 100.0,
                angle: 10.0,
                label: 0,
            },
            SamplingPosition {
                offset: 0.0,
                density: 100.0,
                angle: 10.0,
                label: 7,
            },
        ];
        let values = sampler.sample_positions(&positions, 4.0);
        assert_relative_eq!(values[0], 2.21f64.ln(), epsilon = 1e-12);
        assert!(values[1].is_nan());
    }
}
