//! The pipeline as validation sees it: configured stages paired with the
//! contracts of the stages they name.

use crate::config::{PipelineConfig, StageSpec};
use crate::core::context::ValidationContext;
use crate::core::error::ValidationError;
use crate::core::node::StageMetadata;
use crate::core::types::PortType;
use crate::stages::registry::StageRegistry;
use std::path::{Path, PathBuf};

/// One configured stage.
#[derive(Debug, Clone)]
pub struct PlannedStage {
    pub index: usize,
    pub spec: StageSpec,
    /// `None` when the registry has no stage of that name.
    pub metadata: Option<StageMetadata>,
}

/// Everything validation needs, read from the configuration and registry.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub stages: Vec<PlannedStage>,
    /// Declared output timestream names.
    pub outstreams: Vec<String>,
    /// Directory relative argument paths are resolved against.
    pub data_dir: PathBuf,
}

impl PipelinePlan {
    pub fn new(config: &PipelineConfig, registry: &StageRegistry, data_dir: impl Into<PathBuf>) -> Self {
        let stages = config
            .stages
            .iter()
            .enumerate()
            .map(|(index, spec)| PlannedStage {
                index,
                spec: spec.clone(),
                metadata: registry.get_metadata(&spec.name).cloned(),
            })
            .collect();
        Self {
            stages,
            outstreams: config.outstreams.iter().map(|o| o.name.clone()).collect(),
            data_dir: data_dir.into(),
        }
    }

    /// Contracts of the known stages, in order.
    pub fn known_metadata(&self) -> Vec<&StageMetadata> {
        self.stages.iter().filter_map(|s| s.metadata.as_ref()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Fill defaults and check every configured argument against the schema.
///
/// Returns the context the stage is prepared with, or every argument error.
pub fn bind_arguments(
    metadata: &StageMetadata,
    spec: &StageSpec,
    index: usize,
    data_dir: &Path,
) -> Result<ValidationContext, Vec<ValidationError>> {
    let mut ctx = ValidationContext::new(metadata.id.clone(), index, data_dir);
    let mut errors = Vec::new();

    for param in &metadata.parameters {
        let value = match spec.args.get(&param.name) {
            Some(v) if !v.is_null() => v.clone(),
            _ => match &param.default_value {
                Some(default) => default.clone(),
                None => {
                    errors.push(ValidationError::MissingRequiredArgument {
                        stage: metadata.id.clone(),
                        argument: param.name.clone(),
                    });
                    continue;
                }
            },
        };
        if let Err(error) = param.validate(&value) {
            errors.push(ValidationError::ConstraintViolation {
                stage: metadata.id.clone(),
                argument: param.name.clone(),
                error,
            });
        }
        ctx.add_argument(param.name.clone(), value);
    }

    if errors.is_empty() {
        Ok(ctx)
    } else {
        Err(errors)
    }
}

/// Configured arguments the stage does not declare.
pub fn unknown_arguments<'a>(metadata: &StageMetadata, spec: &'a StageSpec) -> Vec<&'a str> {
    spec.args
        .keys()
        .filter(|k| !metadata.parameters.iter().any(|p| &p.name == *k))
        .map(String::as_str)
        .collect()
}

/// Check that each stage accepts exactly what the previous one returns and
/// that the first stage takes the frame image first.
pub fn check_adjacency(stages: &[&StageMetadata]) -> Result<(), ValidationError> {
    let Some(first) = stages.first() else {
        return Err(ValidationError::EmptyPipeline);
    };
    if first.expects.first() != Some(&PortType::Image) {
        return Err(ValidationError::FirstStageInput {
            stage: first.id.clone(),
            expects: first.expects.clone(),
        });
    }
    for (index, pair) in stages.windows(2).enumerate() {
        let (prev, next) = (pair[0], pair[1]);
        if next.expects != prev.returns {
            return Err(ValidationError::TypeMismatch {
                index: index + 1,
                stage: next.id.clone(),
                expected: next.expects.clone(),
                got: prev.returns.clone(),
            });
        }
    }
    Ok(())
}
