//! Pipeline stages.
//!
//! Contains the stage registry and the built-in stage implementations.

pub mod builtin;
pub mod registry;

pub use registry::{StageFactory, StageRegistry};
