//! Tracing extensions for fitting operations.
//!
//! Structured logging and timing for the fit pipeline on top of `tracing`:
//!
//! - **Timing guards**: [`OperationTimer`] logs elapsed time when dropped
//! - **Structured fields**: mesh sizes, iteration counters, likelihoods
//! - **I/O events**: every loader and writer reports what it touched
//!
//! The library never installs a subscriber. Applications do:
//!
//! ```rust,ignore
//! use tracing_subscriber::{fmt, prelude::*, EnvFilter};
//!
//! tracing_subscriber::registry()
//!     .with(fmt::layer())
//!     .with(EnvFilter::from_default_env())
//!     .init();
//!
//! // RUST_LOG=qct_fit=debug for per-iteration output
//! ```
//!
//! # Targets
//!
//! - `qct_fit::timing`: operation durations
//! - `qct_fit::fit`: per-iteration state
//! - `qct_fit::optimizer`: displacement estimation summaries
//! - `qct_fit::arap`: inner deformation iterations (TRACE)
//! - `qct_fit::io`: file loading and saving

use std::time::Instant;
use tracing::{Span, debug, info, trace, warn};

use crate::Mesh;

/// Drop guard logging the wall time of an operation at INFO.
///
/// ```rust,ignore
/// use qct_fit::tracing_ext::OperationTimer;
///
/// fn load_inputs() {
///     let _timer = OperationTimer::new("load_inputs");
///     // logged on scope exit
/// }
/// ```
pub struct OperationTimer {
    name: &'static str,
    start: Instant,
    span: Span,
}

impl OperationTimer {
    /// Start timing `name`.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::info_span!("qct_operation", operation = name);
        debug!(target: "qct_fit::timing", operation = name, "Starting operation");
        Self {
            name,
            start: Instant::now(),
            span,
        }
    }

    /// Create a timer carrying mesh size fields.
    pub fn with_context(name: &'static str, vertex_count: usize, face_count: usize) -> Self {
        let span = tracing::info_span!(
            "qct_operation",
            operation = name,
            vertices = vertex_count,
            faces = face_count
        );
        debug!(
            target: "qct_fit::timing",
            operation = name,
            vertices = vertex_count,
            faces = face_count,
            "Starting operation"
        );
        Self {
            name,
            start: Instant::now(),
            span,
        }
    }

    /// Elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Span for this timer.
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        let elapsed_ms = self.elapsed_ms();
        info!(
            target: "qct_fit::timing",
            operation = self.name,
            elapsed_ms = format!("{:.2}", elapsed_ms),
            "Operation completed"
        );
    }
}

/// Log mesh statistics at debug level.
pub fn log_mesh_stats(mesh: &Mesh, context: &str) {
    let (min_bounds, max_bounds) = mesh.bounds().unwrap_or_default();
    let dims = max_bounds - min_bounds;
    let labelled = mesh.vertices.iter().filter(|v| v.label.is_some()).count();

    debug!(
        target: "qct_fit::mesh_state",
        context = context,
        vertices = mesh.vertex_count(),
        faces = mesh.face_count(),
        labelled_vertices = labelled,
        dimensions = format!("{:.2} x {:.2} x {:.2}", dims.x, dims.y, dims.z),
        "Mesh state"
    );
}

/// Log the outcome of one fit iteration.
pub fn log_iteration(
    iteration: usize,
    log_likelihood: f64,
    best_log_likelihood: f64,
    non_decreasing: usize,
    effective_sigma: f64,
) {
    debug!(
        target: "qct_fit::fit",
        iteration = iteration,
        log_likelihood = format!("{:.6}", log_likelihood),
        best = format!("{:.6}", best_log_likelihood),
        non_decreasing = non_decreasing,
        sigma = format!("{:.4}", effective_sigma),
        "Iteration finished"
    );
}

/// Log one inner iteration of the deformation solver.
pub fn log_arap_iteration(iteration: usize, energy: f64, cg_iterations: usize, patience: usize) {
    trace!(
        target: "qct_fit::arap",
        iteration = iteration,
        energy = format!("{:.6e}", energy),
        cg_iterations = cg_iterations,
        patience = patience,
        "ARAP iteration"
    );
}

/// Log a file I/O operation.
pub fn log_io_operation(operation: &str, path: &std::path::Path, kind: &str, success: bool) {
    if success {
        info!(
            target: "qct_fit::io",
            operation = operation,
            path = path.display().to_string(),
            kind = kind,
            "I/O operation completed"
        );
    } else {
        warn!(
            target: "qct_fit::io",
            operation = operation,
            path = path.display().to_string(),
            kind = kind,
            "I/O operation failed"
        );
    }
}

/// Log a performance-critical section.
///
/// Returns a guard that logs when dropped.
#[must_use]
pub fn log_perf_section(name: &'static str) -> impl Drop {
    struct PerfGuard {
        name: &'static str,
        start: Instant,
    }
    impl Drop for PerfGuard {
        fn drop(&mut self) {
            let elapsed = self.start.elapsed();
            trace!(
                target: "qct_fit::perf",
                section = self.name,
                elapsed_us = elapsed.as_micros(),
                "Performance section completed"
            );
        }
    }
    PerfGuard {
        name,
        start: Instant::now(),
    }
}

/// Create an info span carrying mesh size fields.
#[macro_export]
macro_rules! fit_span {
    ($name:expr, $mesh:expr) => {
        tracing::info_span!(
            $name,
            vertices = $mesh.vertex_count(),
            faces = $mesh.face_count()
        )
    };
    ($name:expr, $mesh:expr, $($field:tt)*) => {
        tracing::info_span!(
            $name,
            vertices = $mesh.vertex_count(),
            faces = $mesh.face_count(),
            $($field)*
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_timer() {
        let timer = OperationTimer::new("test_operation");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.elapsed_ms() >= 10.0);
    }

    #[test]
    fn test_logging_helpers_on_empty_mesh() {
        let mesh = Mesh::new();
        log_mesh_stats(&mesh, "test");
        log_iteration(0, f64::NEG_INFINITY, f64::NEG_INFINITY, 0, 1.0);
        log_arap_iteration(1, 0.0, 3, 0);
        let _guard = log_perf_section("test");
        let _span = fit_span!("test_span", mesh);
    }
}
