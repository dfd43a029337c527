//! Validation module for pre-execution checking.
//!
//! The validation pipeline runs before the first frame to catch
//! configuration errors early.

pub mod pipeline;
pub mod plan;
pub mod stages;

pub use pipeline::ValidationPipeline;
pub use plan::{bind_arguments, check_adjacency, PipelinePlan, PlannedStage};
pub use stages::{ArgumentValidation, ResourceValidation, StructuralValidation, TypeValidation, ValidationStage};
