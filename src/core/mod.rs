//! Core types and traits for the phenostream pipeline.
//!
//! This module contains the foundational types that make up the processing
//! pipeline including:
//! - Value types passed between stages
//! - Stage argument schemas and constraints
//! - The stage trait and its metadata
//! - Error types
//! - Execution and validation contexts
//! - The structured data model and array encoding

pub mod types;
pub mod port;
pub mod error;
pub mod context;
pub mod node;
pub mod data;

// Re-export commonly used types
pub use types::{Value, PortType, TrayLocation, PotLocation};
pub use port::{ArgType, Constraint, ParameterDefinition};
pub use error::{
    ConfigError, DataError, FrameErrorKind, PipelineError, PotError, StageError, TimestreamError,
    ValidationError,
};
pub use context::{ExecutionContext, FrameArtifact, PipelineContext, ValidationContext};
pub use node::{Category, PipelineStage, StageMetadata};
pub use data::{DataValue, Dtype, NdArray};
