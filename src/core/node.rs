//! PipelineStage trait and stage metadata.
//!
//! The PipelineStage trait is the core abstraction for all per-frame
//! processing. It uses a two-phase design: preparation (once per run, before
//! the first frame) and execution (once per frame).

use crate::core::context::{ExecutionContext, ValidationContext};
use crate::core::error::{StageError, ValidationError};
use crate::core::port::ParameterDefinition;
use crate::core::types::PortType;
use serde::{Deserialize, Serialize};

/// Category for grouping stages in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Geometric correction (undistortion, rotation)
    Geometry,
    /// Colour calibration
    Color,
    /// Tray and pot localisation
    Detection,
    /// Plant segmentation and feature extraction
    Analyze,
    /// Writers
    Output,
}

impl Category {
    /// Get the display name for this category.
    pub fn display_name(&self) -> &'static str {
        match self {
            Category::Geometry => "Geometry",
            Category::Color => "Color",
            Category::Detection => "Detection",
            Category::Analyze => "Analyze",
            Category::Output => "Output",
        }
    }
}

/// Metadata describing a stage.
///
/// This is the stage's whole contract: the runner type-checks a pipeline and
/// fills argument defaults from metadata alone, without running anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMetadata {
    /// Unique name used in the pipeline YAML (e.g. "traydetect")
    pub id: String,
    /// Category for listings
    pub category: Category,
    /// Detailed description
    pub description: String,
    /// Ordered input types
    pub expects: Vec<PortType>,
    /// Ordered output types
    pub returns: Vec<PortType>,
    /// Ordered argument schema
    pub parameters: Vec<ParameterDefinition>,
}

impl StageMetadata {
    /// Create a new metadata builder.
    pub fn builder(id: impl Into<String>) -> StageMetadataBuilder {
        StageMetadataBuilder::new(id)
    }

    /// Get all parameter names.
    pub fn parameter_names(&self) -> Vec<&str> {
        self.parameters.iter().map(|p| p.name.as_str()).collect()
    }

    /// Find a parameter by name.
    pub fn get_parameter(&self, name: &str) -> Option<&ParameterDefinition> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Builder for StageMetadata.
pub struct StageMetadataBuilder {
    id: String,
    category: Category,
    description: String,
    expects: Vec<PortType>,
    returns: Vec<PortType>,
    parameters: Vec<ParameterDefinition>,
}

impl StageMetadataBuilder {
    /// Create a new builder with the stage name.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category: Category::Analyze,
            description: String::new(),
            expects: Vec::new(),
            returns: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Set the category.
    pub fn category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    /// Set the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the input signature.
    pub fn expects(mut self, types: &[PortType]) -> Self {
        self.expects = types.to_vec();
        self
    }

    /// Set the output signature.
    pub fn returns(mut self, types: &[PortType]) -> Self {
        self.returns = types.to_vec();
        self
    }

    /// Add a parameter.
    pub fn parameter(mut self, param: ParameterDefinition) -> Self {
        self.parameters.push(param);
        self
    }

    /// Build the metadata.
    pub fn build(self) -> StageMetadata {
        StageMetadata {
            id: self.id,
            category: self.category,
            description: self.description,
            expects: self.expects,
            returns: self.returns,
            parameters: self.parameters,
        }
    }
}

/// The core trait for pipeline stages.
///
/// # Design
///
/// 1. **Preparation Phase** (`prepare`): called once after the argument
///    schema has been checked. Reads typed arguments and loads anything that
///    is fixed for the whole run (reference pyramids, undistortion maps).
///
/// 2. **Execution Phase** (`execute`): called once per frame. Takes its
///    inputs from the context in `expects` order and pushes outputs in
///    `returns` order.
///
/// Stages run strictly in sequence on one frame at a time, so `execute`
/// takes `&mut self` and stages may carry state across frames.
pub trait PipelineStage: Send {
    /// Get the metadata for this stage.
    fn metadata(&self) -> StageMetadata;

    /// Prepare the stage from its validated arguments.
    fn prepare(&mut self, ctx: &ValidationContext) -> Result<(), ValidationError>;

    /// Process one frame.
    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), StageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::port::ArgType;

    #[test]
    fn test_metadata_builder() {
        let metadata = StageMetadata::builder("colorcorrect")
            .category(Category::Color)
            .description("Apply a colour transform")
            .expects(&[PortType::Image, PortType::ColorParams])
            .returns(&[PortType::Image])
            .parameter(ParameterDefinition::new("minIntensity", ArgType::Float, 1000.0))
            .build();

        assert_eq!(metadata.id, "colorcorrect");
        assert_eq!(metadata.category, Category::Color);
        assert_eq!(metadata.expects.len(), 2);
        assert_eq!(metadata.returns, vec![PortType::Image]);
        assert_eq!(metadata.parameter_names(), vec!["minIntensity"]);
        assert!(metadata.get_parameter("missing").is_none());
    }

    #[test]
    fn test_category_display() {
        assert_eq!(Category::Detection.display_name(), "Detection");
        assert_eq!(Category::Output.display_name(), "Output");
    }
}
