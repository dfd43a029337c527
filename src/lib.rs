//! # Phenostream - plant phenotyping over image timestreams
//!
//! Phenostream runs a configured chain of stages over every frame of an
//! on-disk image timestream: lens undistortion, colour-card correction,
//! tray and pot detection, plant segmentation and per-pot feature
//! extraction, writing corrected images, pot data and feature tables.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use phenostream::prelude::*;
//!
//! let config = PipelineConfig::from_config(&Config::load("pipeline.yml")?)?;
//! let input = Timestream::load("/data/BVZ0036-GC02L-C01~fullres-orig")?;
//! let registry = StageRegistry::with_builtins();
//!
//! let mut runner = PipelineRunner::build(&config, &registry, &input)?;
//! let summary = runner.run(&input, &RunOptions::new())?;
//! println!("{} frames processed", summary.processed);
//! ```
//!
//! ## Architecture
//!
//! - [`timestream`]: archive layout, manifests, iteration by timepoint
//! - [`geometry`]: undistortion, template matching, colour-card fitting
//! - [`pots`]: pot rectangles, handlers, matrices, segmentation, features
//! - [`stages`]: the stage registry and built-in stages
//! - [`validation`]: checks run on a configuration before any frame
//! - [`execution`]: the pipeline runner, progress and segmentation workers
//! - [`config`]: the YAML configuration tree and its typed views
//! - [`core`]: shared types, contexts, errors and data encoding
//!
//! ## Writing a stage
//!
//! ```rust,ignore
//! use phenostream::prelude::*;
//!
//! #[derive(Debug, Default)]
//! struct Passthrough;
//!
//! impl PipelineStage for Passthrough {
//!     fn metadata(&self) -> StageMetadata {
//!         StageMetadata::builder("passthrough")
//!             .expects(&[PortType::Image])
//!             .returns(&[PortType::Image])
//!             .build()
//!     }
//!
//!     fn prepare(&mut self, _ctx: &ValidationContext) -> Result<(), ValidationError> {
//!         Ok(())
//!     }
//!
//!     fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), StageError> {
//!         let image = ctx.take_image()?;
//!         ctx.push_output(Value::Image(image));
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = StageRegistry::with_builtins();
//! registry.register(|| Box::new(Passthrough));
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod core;
pub mod execution;
pub mod geometry;
pub mod pots;
pub mod stages;
pub mod timestream;
pub mod validation;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use phenostream::prelude::*;
/// ```
pub mod prelude {
    // Configuration
    pub use crate::config::{Config, GeneralConfig, OutstreamSpec, PipelineConfig, StageSpec};

    // Core types
    pub use crate::core::data::{DataValue, NdArray};
    pub use crate::core::types::{PortType, Value};
    pub use crate::core::node::{Category, PipelineStage, StageMetadata};
    pub use crate::core::port::{ArgType, Constraint, ParameterDefinition};
    pub use crate::core::context::{ExecutionContext, FrameArtifact, PipelineContext, ValidationContext};

    // Errors
    pub use crate::core::error::{
        ConfigError, FrameErrorKind, PipelineError, PipelineResult, PotError, StageError, TimestreamError,
        ValidationError, ValidationReport, ValidationWarning,
    };

    // Timestreams
    pub use crate::timestream::{FrameSlot, OverwriteMode, TimepointQuery, Timestream, TimestreamImage};

    // Pots
    pub use crate::pots::{FeatureValue, KMeansSegmenter, PotHandler, PotMatrix, PotRect, Segmenter};

    // Stages
    pub use crate::stages::registry::StageRegistry;

    // Validation
    pub use crate::validation::{PipelinePlan, ValidationPipeline};

    // Execution
    pub use crate::execution::{PipelineRunner, ProgressTracker, ProgressUpdate, RunOptions, RunSummary};
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
