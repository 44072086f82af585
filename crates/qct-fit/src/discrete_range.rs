//! Closed intervals sampled at a fixed stride.
//!
//! A [`DiscreteRange`] defines one axis of the measurement model: the
//! signed offset along the normal, tissue density, or incidence angle.
//! Element `n` (1-based) sits at `min + (n - 1) * stride`.

use serde::{Deserialize, Serialize};

use crate::error::{QctError, QctResult};

/// Tolerance absorbing floating point error when counting elements.
const COUNT_EPSILON: f64 = 1e-5;

/// A regular 1-D sampling grid `[min, max]` with spacing `stride`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiscreteRange {
    pub min: f64,
    pub max: f64,
    pub stride: f64,
}

impl DiscreteRange {
    /// Create a range without validation.
    pub const fn new(min: f64, max: f64, stride: f64) -> Self {
        Self { min, max, stride }
    }

    /// Check stride and bounds, naming the range in the error.
    pub fn validate(&self, name: &str) -> QctResult<()> {
        let ok = self.min.is_finite()
            && self.max.is_finite()
            && self.stride.is_finite()
            && self.stride > 0.0
            && self.max >= self.min;
        if ok {
            Ok(())
        } else {
            Err(QctError::InvalidRange {
                name: name.to_string(),
                min: self.min,
                max: self.max,
                stride: self.stride,
            })
        }
    }

    /// Number of grid points, both endpoints included.
    ///
    /// Equal to `ceil((max - min + stride) / stride)` whenever `max - min`
    /// is a multiple of the stride, but immune to the rounding that makes
    /// `(2 - -2 + 0.1) / 0.1` land just above 41.
    pub fn element_count(&self) -> usize {
        ((self.max - self.min) / self.stride + COUNT_EPSILON).floor() as usize + 1
    }

    /// The `n`-th element, 1-based.
    #[inline]
    pub fn nth_element(&self, n: usize) -> f64 {
        self.min + (n as f64 - 1.0) * self.stride
    }

    /// All elements in ascending order.
    pub fn elements(&self) -> Vec<f64> {
        (1..=self.element_count())
            .map(|n| self.nth_element(n))
            .collect()
    }

    /// Continuous 0-based grid coordinate of a value.
    #[inline]
    pub fn index_of(&self, value: f64) -> f64 {
        (value - self.min) / self.stride
    }

    /// Same stride over `[min * factor, max * factor]`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(self.min * factor, self.max * factor, self.stride)
    }
}
