//! Individual validation stages.
//!
//! Each stage checks for a specific category of errors.

use crate::core::error::{ValidationError, ValidationWarning};
use crate::core::port::ArgType;
use crate::validation::plan::{bind_arguments, check_adjacency, unknown_arguments, PipelinePlan};

/// Trait for validation stages.
pub trait ValidationStage: Send + Sync {
    /// Name of this validation stage.
    fn name(&self) -> &str;

    /// Validate the plan.
    ///
    /// Returns Ok with warnings, or Err with errors.
    fn validate(&self, plan: &PipelinePlan) -> Result<Vec<ValidationWarning>, Vec<ValidationError>>;
}

fn finish(errors: Vec<ValidationError>, warnings: Vec<ValidationWarning>) -> Result<Vec<ValidationWarning>, Vec<ValidationError>> {
    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(errors)
    }
}

/// Structural validation: the pipeline is non-empty and names only
/// registered stages.
pub struct StructuralValidation;

impl ValidationStage for StructuralValidation {
    fn name(&self) -> &str {
        "Structural Validation"
    }

    fn validate(&self, plan: &PipelinePlan) -> Result<Vec<ValidationWarning>, Vec<ValidationError>> {
        if plan.is_empty() {
            return Err(vec![ValidationError::EmptyPipeline]);
        }
        let errors = plan
            .stages
            .iter()
            .filter(|s| s.metadata.is_none())
            .map(|s| ValidationError::UnknownStage {
                index: s.index,
                name: s.spec.name.clone(),
            })
            .collect();

        let mut warnings = Vec::new();
        if !plan.stages.iter().any(|s| s.spec.name == "imagewrite") && !plan.outstreams.is_empty() {
            warnings.push(ValidationWarning {
                message: "Output timestreams are declared but no stage writes images".to_string(),
                stage: None,
                suggestion: Some("Add an 'imagewrite' stage or remove 'outstreams'".to_string()),
            });
        }
        finish(errors, warnings)
    }
}

/// Type validation: adjacent stages agree on what flows between them.
pub struct TypeValidation;

impl ValidationStage for TypeValidation {
    fn name(&self) -> &str {
        "Type Validation"
    }

    fn validate(&self, plan: &PipelinePlan) -> Result<Vec<ValidationWarning>, Vec<ValidationError>> {
        check_adjacency(&plan.known_metadata()).map(|_| Vec::new()).map_err(|e| vec![e])
    }
}

/// Argument validation: required arguments are present and every value
/// fits its declared type and constraints.
pub struct ArgumentValidation;

impl ValidationStage for ArgumentValidation {
    fn name(&self) -> &str {
        "Argument Validation"
    }

    fn validate(&self, plan: &PipelinePlan) -> Result<Vec<ValidationWarning>, Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for stage in &plan.stages {
            let Some(metadata) = &stage.metadata else {
                continue;
            };
            if let Err(e) = bind_arguments(metadata, &stage.spec, stage.index, &plan.data_dir) {
                errors.extend(e);
            }
            for name in unknown_arguments(metadata, &stage.spec) {
                warnings.push(ValidationWarning {
                    message: format!("Stage '{}' ignores unknown argument '{}'", metadata.id, name),
                    stage: Some(metadata.id.clone()),
                    suggestion: Some(format!("Known arguments: {}", metadata.parameter_names().join(", "))),
                });
            }
        }
        finish(errors, warnings)
    }
}

/// Resource validation: referenced files exist and image writers name a
/// declared output timestream.
pub struct ResourceValidation;

impl ValidationStage for ResourceValidation {
    fn name(&self) -> &str {
        "Resource Validation"
    }

    fn validate(&self, plan: &PipelinePlan) -> Result<Vec<ValidationWarning>, Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for stage in &plan.stages {
            let Some(metadata) = &stage.metadata else {
                continue;
            };
            // Argument errors are reported by ArgumentValidation.
            let Ok(ctx) = bind_arguments(metadata, &stage.spec, stage.index, &plan.data_dir) else {
                continue;
            };

            for param in &metadata.parameters {
                match param.arg_type {
                    ArgType::Path if ctx.has(&param.name) => {
                        if let Err(e) = ctx.get_path(&param.name) {
                            errors.push(e);
                        }
                    }
                    ArgType::StringList if param.name.ends_with("Files") => {
                        for pattern in ctx.get_strings(&param.name).unwrap_or_default() {
                            let resolved = ctx.resolve(&pattern);
                            let matched = glob::glob(&resolved.to_string_lossy())
                                .map(|paths| paths.flatten().next().is_some());
                            match matched {
                                Ok(true) => {}
                                Ok(false) => errors.push(ValidationError::ResourceNotFound {
                                    stage: metadata.id.clone(),
                                    resource: resolved.display().to_string(),
                                }),
                                Err(e) => warnings.push(ValidationWarning {
                                    message: format!("Could not validate glob pattern {}: {}", pattern, e),
                                    stage: Some(metadata.id.clone()),
                                    suggestion: None,
                                }),
                            }
                        }
                    }
                    _ => {}
                }
            }

            if metadata.id == "imagewrite" {
                if let Ok(name) = ctx.get_str("outstream") {
                    if !plan.outstreams.iter().any(|o| o == name) {
                        errors.push(ValidationError::UnknownOutstream {
                            stage: metadata.id.clone(),
                            name: name.to_string(),
                        });
                    }
                }
            }
        }
        finish(errors, warnings)
    }
}
