//! Error types for fitting operations with rich diagnostics.
//!
//! Errors carry:
//! - Machine-readable error codes for programmatic handling
//! - Context (which file, which vertex, which label)
//! - Recovery suggestions for common issues
//! - Terminal display via miette
//!
//! # Error Codes
//!
//! Each error has a unique code in the format `QCT-XXXX`:
//! - `QCT-1xxx`: I/O errors (file reading, writing, parsing)
//! - `QCT-2xxx`: Invalid input (malformed models, unknown labels, bad ranges)
//! - `QCT-3xxx`: Out-of-range queries
//! - `QCT-4xxx`: Fit state violations (stage called without its inputs)
//! - `QCT-5xxx`: Numerical failures in the deformation solver
//!
//! Per-vertex numerical anomalies (a NaN density sample, a non-finite
//! posterior weight) are not errors. They are floored inside the
//! optimizer and only show up as zero confidence weights.
//!
//! # Example
//!
//! ```
//! use qct_fit::{ErrorCode, QctError};
//!
//! let err = QctError::unknown_label(7, 12);
//! assert_eq!(err.code(), ErrorCode::UnknownLabel);
//! assert_eq!(err.code().as_str(), "QCT-2003");
//! ```

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for fitting operations.
pub type QctResult<T> = Result<T, QctError>;

/// Machine-readable error codes.
///
/// Codes follow the pattern `QCT-XXXX` where:
/// - 1xxx = I/O errors
/// - 2xxx = Invalid input
/// - 3xxx = Out-of-range queries
/// - 4xxx = Fit state violations
/// - 5xxx = Solver failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // I/O errors (1xxx)
    /// QCT-1001: Failed to read file
    IoRead = 1001,
    /// QCT-1002: Failed to write file
    IoWrite = 1002,
    /// QCT-1003: Failed to parse file contents
    ParseError = 1003,

    // Invalid input (2xxx)
    /// QCT-2001: Unsupported file format
    UnsupportedFormat = 2001,
    /// QCT-2002: Required field missing or malformed
    InvalidInput = 2002,
    /// QCT-2003: Vertex label not defined by the measurement model
    UnknownLabel = 2003,
    /// QCT-2004: Sample block size disagrees with the model ranges
    InconsistentModel = 2004,
    /// QCT-2005: Discrete range with non-positive stride or inverted bounds
    InvalidRange = 2005,
    /// QCT-2006: Mesh has no vertices or faces
    EmptyMesh = 2006,

    // Out-of-range (3xxx)
    /// QCT-3001: Triangle index outside the mesh
    TriangleOutOfRange = 3001,

    // Fit state (4xxx)
    /// QCT-4001: Vector lengths disagree with the vertex count
    LengthMismatch = 4001,
    /// QCT-4002: Stage invoked before its inputs were produced
    StageOrder = 4002,

    // Solver (5xxx)
    /// QCT-5001: Linear system could not be solved
    SolverFailed = 5001,
}

impl ErrorCode {
    /// Returns the error code as a string in the format `QCT-XXXX`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::IoRead => "QCT-1001",
            ErrorCode::IoWrite => "QCT-1002",
            ErrorCode::ParseError => "QCT-1003",
            ErrorCode::UnsupportedFormat => "QCT-2001",
            ErrorCode::InvalidInput => "QCT-2002",
            ErrorCode::UnknownLabel => "QCT-2003",
            ErrorCode::InconsistentModel => "QCT-2004",
            ErrorCode::InvalidRange => "QCT-2005",
            ErrorCode::EmptyMesh => "QCT-2006",
            ErrorCode::TriangleOutOfRange => "QCT-3001",
            ErrorCode::LengthMismatch => "QCT-4001",
            ErrorCode::StageOrder => "QCT-4002",
            ErrorCode::SolverFailed => "QCT-5001",
        }
    }

    /// True for errors raised while loading inputs.
    pub fn is_invalid_input(&self) -> bool {
        (*self as u32) / 1000 <= 2
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recovery suggestions for fitting errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySuggestion {
    /// Check a file on disk.
    CheckFile { checks: Vec<String> },
    /// Use a different file format.
    UseDifferentFormat { suggested: Vec<String> },
    /// Regenerate or fix the measurement model.
    CheckModel { checks: Vec<String> },
    /// Adjust configuration parameters.
    AdjustParameters { parameters: Vec<(String, String)> },
    /// Call the fit stages in order.
    FollowStageOrder { expected: String },
    /// No automatic recovery available.
    None,
}

impl std::fmt::Display for RecoverySuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoverySuggestion::CheckFile { checks } => {
                write!(f, "Check the file for: {}", checks.join(", "))
            }
            RecoverySuggestion::UseDifferentFormat { suggested } => {
                write!(f, "Try using a different format: {}", suggested.join(", "))
            }
            RecoverySuggestion::CheckModel { checks } => {
                write!(f, "Check the measurement model for: {}", checks.join(", "))
            }
            RecoverySuggestion::AdjustParameters { parameters } => {
                let params: Vec<String> = parameters
                    .iter()
                    .map(|(k, v)| format!("{} = {}", k, v))
                    .collect();
                write!(f, "Try adjusting: {}", params.join(", "))
            }
            RecoverySuggestion::FollowStageOrder { expected } => {
                write!(f, "Run the {} stage first", expected)
            }
            RecoverySuggestion::None => write!(f, "No automatic recovery available"),
        }
    }
}

/// Location information for errors.
#[derive(Debug, Clone)]
pub enum ErrorLocation {
    /// Error in a file.
    File { path: PathBuf },
    /// Error at a specific vertex.
    Vertex { index: usize },
    /// Error at a specific triangle.
    Triangle { index: usize },
    /// Error tied to one model label.
    Label { label: u32 },
}

impl std::fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorLocation::File { path } => write!(f, "{}", path.display()),
            ErrorLocation::Vertex { index } => write!(f, "vertex {}", index),
            ErrorLocation::Triangle { index } => write!(f, "triangle {}", index),
            ErrorLocation::Label { label } => write!(f, "label {}", label),
        }
    }
}

/// Errors that can occur while loading inputs or running a fit.
#[derive(Debug, Error, Diagnostic)]
pub enum QctError {
    /// Error reading from a file.
    #[error("failed to read {path}")]
    #[diagnostic(
        code(qct::io::read),
        help("Check that the file exists and is readable")
    )]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error writing to a file.
    #[error("failed to write {path}")]
    #[diagnostic(
        code(qct::io::write),
        help("Check that the directory exists and is writable")
    )]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error parsing file contents.
    #[error("failed to parse {path}: {details}")]
    #[diagnostic(code(qct::parse::error))]
    ParseError { path: PathBuf, details: String },

    /// Unsupported file format.
    #[error("unsupported {kind} format: {extension:?}")]
    #[diagnostic(
        code(qct::format::unsupported),
        help("Meshes: OBJ, PLY, STL. Volumes, models and configurations: TOML descriptors")
    )]
    UnsupportedFormat {
        kind: &'static str,
        extension: Option<String>,
    },

    /// Missing or malformed input field.
    #[error("invalid input: {details}")]
    #[diagnostic(code(qct::input::invalid))]
    InvalidInput {
        details: String,
        path: Option<PathBuf>,
    },

    /// Vertex label not present in the measurement model.
    #[error("vertex {vertex} has label {label}, which the measurement model does not define")]
    #[diagnostic(
        code(qct::input::label),
        help("Check the color-to-label mapping or the labels file against the model's [[labels]] entries")
    )]
    UnknownLabel { vertex: usize, label: u32 },

    /// Model data block size disagrees with the axis ranges.
    #[error(
        "label {label} has {actual} samples, expected {expected} from the sampling/density/angle ranges"
    )]
    #[diagnostic(code(qct::model::inconsistent))]
    InconsistentModel {
        label: u32,
        expected: usize,
        actual: usize,
    },

    /// Discrete range with bad parameters.
    #[error("invalid range {name}: min={min}, max={max}, stride={stride}")]
    #[diagnostic(
        code(qct::input::range),
        help("Stride must be positive and finite, and max must not be below min")
    )]
    InvalidRange {
        name: String,
        min: f64,
        max: f64,
        stride: f64,
    },

    /// Empty mesh.
    #[error("mesh is empty: {details}")]
    #[diagnostic(code(qct::input::empty_mesh))]
    EmptyMesh { details: String },

    /// Triangle index outside the mesh.
    #[error("triangle {index} out of range, mesh has {count} triangles")]
    #[diagnostic(code(qct::query::triangle))]
    TriangleOutOfRange { index: usize, count: usize },

    /// Per-vertex vector with the wrong length.
    #[error("{what} has length {actual}, expected {expected}")]
    #[diagnostic(code(qct::state::length))]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Stage invoked before its inputs exist.
    #[error("cannot run {stage}: {missing} not available")]
    #[diagnostic(
        code(qct::state::order),
        help("Stages run in order: volume sampling, displacement, deformation, log-likelihood, convergence")
    )]
    StageOrder {
        stage: &'static str,
        missing: &'static str,
    },

    /// Linear solve failed.
    #[error("deformation solver failed: {details}")]
    #[diagnostic(code(qct::solver::failed))]
    SolverFailed { details: String },
}

impl QctError {
    /// Returns the machine-readable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            QctError::IoRead { .. } => ErrorCode::IoRead,
            QctError::IoWrite { .. } => ErrorCode::IoWrite,
            QctError::ParseError { .. } => ErrorCode::ParseError,
            QctError::UnsupportedFormat { .. } => ErrorCode::UnsupportedFormat,
            QctError::InvalidInput { .. } => ErrorCode::InvalidInput,
            QctError::UnknownLabel { .. } => ErrorCode::UnknownLabel,
            QctError::InconsistentModel { .. } => ErrorCode::InconsistentModel,
            QctError::InvalidRange { .. } => ErrorCode::InvalidRange,
            QctError::EmptyMesh { .. } => ErrorCode::EmptyMesh,
            QctError::TriangleOutOfRange { .. } => ErrorCode::TriangleOutOfRange,
            QctError::LengthMismatch { .. } => ErrorCode::LengthMismatch,
            QctError::StageOrder { .. } => ErrorCode::StageOrder,
            QctError::SolverFailed { .. } => ErrorCode::SolverFailed,
        }
    }

    /// Returns a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self {
            QctError::IoRead { .. } => RecoverySuggestion::CheckFile {
                checks: vec!["file exists".into(), "file permissions".into()],
            },
            QctError::IoWrite { .. } => RecoverySuggestion::CheckFile {
                checks: vec!["directory exists".into(), "write permissions".into()],
            },
            QctError::ParseError { .. } | QctError::InvalidInput { .. } => {
                RecoverySuggestion::CheckFile {
                    checks: vec!["required fields".into(), "value types".into()],
                }
            }
            QctError::UnsupportedFormat { .. } => RecoverySuggestion::UseDifferentFormat {
                suggested: vec!["OBJ".into(), "PLY".into(), "STL".into(), "TOML".into()],
            },
            QctError::UnknownLabel { .. } => RecoverySuggestion::CheckModel {
                checks: vec!["label set".into(), "color map".into()],
            },
            QctError::InconsistentModel { .. } => RecoverySuggestion::CheckModel {
                checks: vec!["axis ranges".into(), "sample block byte length".into()],
            },
            QctError::InvalidRange { .. } => RecoverySuggestion::AdjustParameters {
                parameters: vec![("stride".into(), "a positive value".into())],
            },
            QctError::EmptyMesh { .. } => RecoverySuggestion::CheckFile {
                checks: vec!["mesh has geometry".into()],
            },
            QctError::TriangleOutOfRange { .. } | QctError::LengthMismatch { .. } => {
                RecoverySuggestion::None
            }
            QctError::StageOrder { missing, .. } => RecoverySuggestion::FollowStageOrder {
                expected: format!("stage producing {}", missing),
            },
            QctError::SolverFailed { .. } => RecoverySuggestion::AdjustParameters {
                parameters: vec![
                    ("rigidity_sigma".into(), "try a larger value".into()),
                    ("arap.cg_max_iterations".into(), "try a larger value".into()),
                ],
            },
        }
    }

    /// Returns location information if available.
    pub fn location(&self) -> Option<ErrorLocation> {
        match self {
            QctError::IoRead { path, .. }
            | QctError::IoWrite { path, .. }
            | QctError::ParseError { path, .. } => Some(ErrorLocation::File { path: path.clone() }),
            QctError::InvalidInput {
                path: Some(path), ..
            } => Some(ErrorLocation::File { path: path.clone() }),
            QctError::UnknownLabel { vertex, .. } => Some(ErrorLocation::Vertex { index: *vertex }),
            QctError::InconsistentModel { label, .. } => {
                Some(ErrorLocation::Label { label: *label })
            }
            QctError::TriangleOutOfRange { index, .. } => {
                Some(ErrorLocation::Triangle { index: *index })
            }
            _ => None,
        }
    }

    // Constructor helpers

    /// Create an IoRead error.
    pub fn io_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        QctError::IoRead {
            path: path.into(),
            source,
        }
    }

    /// Create an IoWrite error.
    pub fn io_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        QctError::IoWrite {
            path: path.into(),
            source,
        }
    }

    /// Create a ParseError.
    pub fn parse_error(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        QctError::ParseError {
            path: path.into(),
            details: details.into(),
        }
    }

    /// Create an UnsupportedFormat error from a path's extension.
    pub fn unsupported_format(kind: &'static str, path: &std::path::Path) -> Self {
        QctError::UnsupportedFormat {
            kind,
            extension: path.extension().and_then(|e| e.to_str()).map(String::from),
        }
    }

    /// Create an InvalidInput error without a file location.
    pub fn invalid_input(details: impl Into<String>) -> Self {
        QctError::InvalidInput {
            details: details.into(),
            path: None,
        }
    }

    /// Create an InvalidInput error pointing at a file.
    pub fn invalid_file(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        QctError::InvalidInput {
            details: details.into(),
            path: Some(path.into()),
        }
    }

    /// Create an UnknownLabel error.
    pub fn unknown_label(vertex: usize, label: u32) -> Self {
        QctError::UnknownLabel { vertex, label }
    }

    /// Create an InconsistentModel error.
    pub fn inconsistent_model(label: u32, expected: usize, actual: usize) -> Self {
        QctError::InconsistentModel {
            label,
            expected,
            actual,
        }
    }

    /// Create an EmptyMesh error.
    pub fn empty_mesh(details: impl Into<String>) -> Self {
        QctError::EmptyMesh {
            details: details.into(),
        }
    }

    /// Create a TriangleOutOfRange error.
    pub fn triangle_out_of_range(index: usize, count: usize) -> Self {
        QctError::TriangleOutOfRange { index, count }
    }

    /// Create a LengthMismatch error.
    pub fn length_mismatch(what: &'static str, expected: usize, actual: usize) -> Self {
        QctError::LengthMismatch {
            what,
            expected,
            actual,
        }
    }

    /// Create a StageOrder error.
    pub fn stage_order(stage: &'static str, missing: &'static str) -> Self {
        QctError::StageOrder { stage, missing }
    }

    /// Create a SolverFailed error.
    pub fn solver_failed(details: impl Into<String>) -> Self {
        QctError::SolverFailed {
            details: details.into(),
        }
    }

    /// Check a per-vertex vector length.
    pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> QctResult<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(QctError::length_mismatch(what, expected, actual))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = QctError::triangle_out_of_range(12, 4);
        assert_eq!(err.code(), ErrorCode::TriangleOutOfRange);
        assert_eq!(err.code().as_str(), "QCT-3001");
        assert!(!err.code().is_invalid_input());
        assert!(QctError::unknown_label(0, 9).code().is_invalid_input());
    }

    #[test]
    fn test_recovery_suggestions() {
        let err = QctError::inconsistent_model(3, 100, 99);
        match err.recovery_suggestion() {
            RecoverySuggestion::CheckModel { checks } => assert!(!checks.is_empty()),
            other => panic!("Expected CheckModel suggestion, got {:?}", other),
        }
    }

    #[test]
    fn test_location_info() {
        let err = QctError::unknown_label(42, 9);
        match err.location() {
            Some(ErrorLocation::Vertex { index }) => assert_eq!(index, 42),
            other => panic!("Expected Vertex location, got {:?}", other),
        }
        assert!(QctError::solver_failed("nan").location().is_none());
    }

    #[test]
    fn test_error_display() {
        let err = QctError::length_mismatch("weights", 10, 9);
        let display = format!("{}", err);
        assert!(display.contains("weights"));
        assert!(display.contains("10"));

        let err = QctError::stage_order("optimal deformation", "displacements");
        assert!(err.to_string().contains("displacements"));
        assert!(err.recovery_suggestion().to_string().contains("displacements"));
    }

    #[test]
    fn test_check_len() {
        assert!(QctError::check_len("normals", 3, 3).is_ok());
        assert_eq!(
            QctError::check_len("normals", 3, 2).unwrap_err().code(),
            ErrorCode::LengthMismatch
        );
    }
}
