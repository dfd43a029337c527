//! Error types for phenostream.
//!
//! Uses thiserror for structured errors with context. Errors are designed to:
//! - Name the stage, argument or file that caused them
//! - Carry a tag telling the runner whether a frame can be skipped
//! - Support error chaining for context

use crate::core::types::PortType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for phenostream.
///
/// This enum encompasses all error categories and enables automatic
/// conversion between specific error types.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Timestream error: {0}")]
    Timestream(#[from] TimestreamError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("Pot error: {0}")]
    Pot(#[from] PotError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors raised by the on-disk timestream store.
#[derive(Error, Debug)]
pub enum TimestreamError {
    #[error("archive not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("manifest invalid ({}): {reason}", path.display())]
    ManifestInvalid { path: PathBuf, reason: String },

    #[error("too many images at timepoint {timestamp}")]
    TooManyImages { timestamp: String },

    #[error("invalid overwrite mode '{0}'")]
    InvalidOverwriteMode(String),

    #[error("image already exists: {}", path.display())]
    ImageExists { path: PathBuf },

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("no image at timepoint {0}")]
    NoImage(String),

    #[error("image record has no pixels and no path")]
    NoPixels,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("data encoding error: {0}")]
    Data(#[from] DataError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the array/data encoding layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("unsupported dtype '{0}'")]
    UnsupportedDtype(String),

    #[error("array payload has {got} bytes, shape {shape:?} of {dtype} needs {expected}")]
    SizeMismatch {
        dtype: String,
        shape: Vec<usize>,
        expected: usize,
        got: usize,
    },

    #[error("invalid base64 payload: {0}")]
    Base64(String),

    #[error("malformed array object: {0}")]
    Malformed(String),
}

/// Errors from loading, querying or mutating the configuration tree.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("cannot parse configuration: {0}")]
    Parse(String),

    #[error("missing configuration key '{0}'")]
    MissingKey(String),

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("configuration is locked; cannot set '{0}'")]
    Locked(String),

    #[error("unknown configuration section '{0}'")]
    UnknownSection(String),

    #[error("invalid override '{0}', expected key=value")]
    InvalidOverride(String),

    #[error("cannot read configuration file {path}: {reason}")]
    Read { path: String, reason: String },
}

/// Errors from the startup validation phase.
///
/// Validation errors are caught before any frame is processed, so a broken
/// pipeline never touches the output timestreams.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("Pipeline has no stages")]
    EmptyPipeline,

    #[error("Unknown stage '{name}' at position {index}")]
    UnknownStage { index: usize, name: String },

    #[error("Missing required argument '{argument}' for stage '{stage}'")]
    MissingRequiredArgument { stage: String, argument: String },

    #[error("Invalid argument '{argument}' for stage '{stage}': {error}")]
    ConstraintViolation {
        stage: String,
        argument: String,
        error: String,
    },

    #[error("Stage '{stage}' (position {index}) expects {}, previous stage returns {}", PortType::list_display(expected), PortType::list_display(got))]
    TypeMismatch {
        index: usize,
        stage: String,
        expected: Vec<PortType>,
        got: Vec<PortType>,
    },

    #[error("First stage '{stage}' must take an image first, expects {}", PortType::list_display(expects))]
    FirstStageInput { stage: String, expects: Vec<PortType> },

    #[error("Resource not found: {resource} (referenced by stage '{stage}')")]
    ResourceNotFound { stage: String, resource: String },

    #[error("Unknown output timestream '{name}' (referenced by stage '{stage}')")]
    UnknownOutstream { stage: String, name: String },

    #[error("Stage '{stage}' failed to prepare: {error}")]
    Preparation { stage: String, error: String },

    #[error("{0}")]
    Other(String),
}

/// Tag describing how a per-frame failure affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameErrorKind {
    /// The timepoint has no image.
    Missing,
    /// The image could not be decoded.
    Corrupt,
    /// A stage decided to skip the frame.
    Skipped,
    /// The frame already has results in every output.
    AlreadyComputed,
    /// A template match scored below its threshold.
    LowScore,
    /// The frame cannot be processed (e.g. a tray is missing).
    Fatal,
    /// Any other stage failure.
    Failed,
}

impl FrameErrorKind {
    /// Recoverable kinds are routine and logged quietly.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FrameErrorKind::Fatal | FrameErrorKind::Failed)
    }
}

impl fmt::Display for FrameErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameErrorKind::Missing => "missing",
            FrameErrorKind::Corrupt => "corrupt",
            FrameErrorKind::Skipped => "skipped",
            FrameErrorKind::AlreadyComputed => "already-computed",
            FrameErrorKind::LowScore => "low-score",
            FrameErrorKind::Fatal => "fatal",
            FrameErrorKind::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A per-frame failure raised by a stage (or by the runner on its behalf).
#[derive(Error, Debug, Clone)]
#[error("[{stage}] {kind}: {message}")]
pub struct StageError {
    /// Name of the stage that raised the error.
    pub stage: String,
    /// Effect on the run.
    pub kind: FrameErrorKind,
    /// User-readable message.
    pub message: String,
}

impl StageError {
    /// Create a new stage error.
    pub fn new(stage: impl Into<String>, kind: FrameErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a generic failure.
    pub fn failed(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(stage, FrameErrorKind::Failed, message)
    }

    /// Shorthand for a low template-match score.
    pub fn low_score(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(stage, FrameErrorKind::LowScore, message)
    }

    /// Shorthand for a frame that must be dropped.
    pub fn fatal(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(stage, FrameErrorKind::Fatal, message)
    }

    /// Whether the runner may log this quietly.
    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }
}

/// Errors from pot rectangles, handlers and matrices.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PotError {
    #[error("rectangle overflows image: [{x0}, {y0}, {x1}, {y1}] in {width}x{height}")]
    RectangleOverflow {
        x0: i64,
        y0: i64,
        x1: i64,
        y1: i64,
        width: u32,
        height: u32,
    },

    #[error("pot id {0} already belongs to a different pot")]
    DuplicateId(u32),

    #[error("pot {0} not found")]
    NotFound(u32),

    #[error("mask is {got_width}x{got_height}, pot {id} rectangle is {width}x{height}")]
    MaskShape {
        id: u32,
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },

    #[error("unknown feature '{0}'")]
    UnknownFeature(String),

    #[error("segmentation of pot {id} failed: {reason}")]
    Segmentation { id: u32, reason: String },

    #[error("pot matrix has no image attached")]
    NoImage,

    #[error("malformed pot description: {0}")]
    Malformed(String),
}

// ============================================================================
// Error Utilities
// ============================================================================

impl ValidationError {
    /// Check if this is a fatal error that should stop validation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ValidationError::EmptyPipeline | ValidationError::UnknownStage { .. }
        )
    }

    /// Get suggestion for fixing this error.
    pub fn suggested_fix(&self) -> Option<String> {
        match self {
            ValidationError::TypeMismatch { expected, .. } => Some(format!(
                "Insert or reorder stages so the previous stage returns {}",
                PortType::list_display(expected)
            )),
            ValidationError::MissingRequiredArgument { argument, .. } => {
                Some(format!("Add '{}' to the stage entry in the pipeline configuration", argument))
            }
            ValidationError::ResourceNotFound { resource, .. } => {
                Some(format!("Check that the file '{}' exists", resource))
            }
            ValidationError::UnknownOutstream { name, .. } => {
                Some(format!("Declare '{}' under 'outstreams'", name))
            }
            ValidationError::ConstraintViolation { argument, error, .. } => {
                Some(format!("Adjust '{}': {}", argument, error))
            }
            _ => None,
        }
    }

    /// Name of the stage this error refers to, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            ValidationError::MissingRequiredArgument { stage, .. }
            | ValidationError::ConstraintViolation { stage, .. }
            | ValidationError::TypeMismatch { stage, .. }
            | ValidationError::FirstStageInput { stage, .. }
            | ValidationError::ResourceNotFound { stage, .. }
            | ValidationError::UnknownOutstream { stage, .. }
            | ValidationError::Preparation { stage, .. } => Some(stage),
            ValidationError::UnknownStage { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Result type alias for top-level operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Result type alias for timestream operations.
pub type TimestreamResult<T> = Result<T, TimestreamError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type alias for pot operations.
pub type PotResult<T> = Result<T, PotError>;

// ============================================================================
// Validation Report
// ============================================================================

/// Comprehensive validation report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Whether validation passed without errors.
    pub success: bool,
    /// List of errors found.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<ValidationWarning>,
    /// Time taken for validation in milliseconds.
    pub duration_ms: u64,
}

/// Non-fatal validation warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationWarning {
    /// Warning message.
    pub message: String,
    /// Stage that triggered the warning, if applicable.
    pub stage: Option<String>,
    /// Suggestion for addressing the warning.
    pub suggestion: Option<String>,
}

impl ValidationReport {
    /// Create a new empty report (success).
    pub fn new() -> Self {
        Self {
            success: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Add an error to the report.
    pub fn add_error(&mut self, error: ValidationError) {
        self.success = false;
        self.errors.push(error);
    }

    /// Add a warning to the report.
    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Check if the pipeline can run.
    pub fn can_execute(&self) -> bool {
        self.success
    }

    /// Get a human-readable summary.
    pub fn summary(&self) -> String {
        if self.success {
            if self.warnings.is_empty() {
                "Pipeline is valid".to_string()
            } else {
                format!("Pipeline is valid with {} warning(s)", self.warnings.len())
            }
        } else {
            format!("Validation failed with {} error(s)", self.errors.len())
        }
    }

    /// Get detailed error messages with suggestions.
    pub fn detailed_errors(&self) -> Vec<String> {
        self.errors
            .iter()
            .enumerate()
            .map(|(i, error)| {
                let mut msg = format!("{}. {}", i + 1, error);
                if let Some(fix) = error.suggested_fix() {
                    msg.push_str(&format!("\n   -> Suggestion: {}", fix));
                }
                msg
            })
            .collect()
    }

    /// Convert a failed report into its first error.
    pub fn into_result(self) -> Result<Vec<ValidationWarning>, ValidationError> {
        match self.errors.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(self.warnings),
        }
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_suggestions() {
        let error = ValidationError::MissingRequiredArgument {
            stage: "colorcarddetect".to_string(),
            argument: "colorcardFile".to_string(),
        };
        assert!(error.suggested_fix().unwrap().contains("colorcardFile"));
        assert_eq!(error.stage(), Some("colorcarddetect"));
    }

    #[test]
    fn test_validation_report() {
        let mut report = ValidationReport::new();
        assert!(report.can_execute());

        report.add_error(ValidationError::EmptyPipeline);
        assert!(!report.can_execute());
        assert_eq!(report.errors.len(), 1);
        assert!(report.into_result().is_err());
    }

    #[test]
    fn test_frame_error_kinds() {
        assert!(FrameErrorKind::Missing.is_recoverable());
        assert!(FrameErrorKind::LowScore.is_recoverable());
        assert!(!FrameErrorKind::Fatal.is_recoverable());

        let err = StageError::fatal("traydetect", "tray 3 scored 0.12");
        assert_eq!(err.to_string(), "[traydetect] fatal: tray 3 scored 0.12");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_timestream_error_messages() {
        let err = TimestreamError::TooManyImages {
            timestamp: "2013_10_30_03_00_00".to_string(),
        };
        assert!(err.to_string().starts_with("too many images at timepoint"));
        let err = TimestreamError::InvalidOverwriteMode("clobber".to_string());
        assert!(err.to_string().contains("invalid overwrite mode"));
    }
}
