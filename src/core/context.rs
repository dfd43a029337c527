//! Execution and validation contexts.
//!
//! `ValidationContext` carries a stage's arguments (defaults already filled)
//! while it prepares. `PipelineContext` is the state shared by all stages for
//! the whole run, and `ExecutionContext` wraps it together with the values
//! flowing into and out of the current stage for the current frame.

use crate::config::GeneralConfig;
use crate::core::error::{FrameErrorKind, StageError, ValidationError};
use crate::core::port::as_number_list;
use crate::core::types::{PotLocation, TrayLocation, Value};
use crate::geometry::colortransform::ColorTransform;
use crate::geometry::pyramid::ImagePyramid;
use crate::pots::PotMatrix;
use crate::timestream::{Timestream, TimestreamImage};
use indexmap::IndexMap;
use nalgebra::Matrix3;
use serde_yml::Value as YamlValue;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Context provided while a stage prepares.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    /// Name of the stage.
    pub stage: String,
    /// Position of the stage in the pipeline.
    pub index: usize,
    /// Argument values, defaults filled in.
    args: IndexMap<String, YamlValue>,
    /// Directory relative paths are resolved against.
    data_dir: PathBuf,
}

impl ValidationContext {
    /// Create a new validation context.
    pub fn new(stage: impl Into<String>, index: usize, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            stage: stage.into(),
            index,
            args: IndexMap::new(),
            data_dir: data_dir.into(),
        }
    }

    /// Add an argument value.
    pub fn add_argument(&mut self, name: impl Into<String>, value: YamlValue) {
        self.args.insert(name.into(), value);
    }

    /// Builder-style [`add_argument`](Self::add_argument).
    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<YamlValue>) -> Self {
        self.add_argument(name, value.into());
        self
    }

    /// Get all arguments.
    pub fn arguments(&self) -> &IndexMap<String, YamlValue> {
        &self.args
    }

    /// Directory relative paths are resolved against.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // ========================================================================
    // Argument Getters
    // ========================================================================

    fn invalid(&self, name: &str, error: impl Into<String>) -> ValidationError {
        ValidationError::ConstraintViolation {
            stage: self.stage.clone(),
            argument: name.to_string(),
            error: error.into(),
        }
    }

    /// Get an argument value, failing when it is absent or null.
    pub fn get(&self, name: &str) -> Result<&YamlValue, ValidationError> {
        match self.args.get(name) {
            Some(v) if !v.is_null() => Ok(v),
            _ => Err(ValidationError::MissingRequiredArgument {
                stage: self.stage.clone(),
                argument: name.to_string(),
            }),
        }
    }

    /// Whether the argument is set to something other than null.
    pub fn has(&self, name: &str) -> bool {
        self.args.get(name).map(|v| !v.is_null()).unwrap_or(false)
    }

    /// Get an argument as a float.
    pub fn get_f64(&self, name: &str) -> Result<f64, ValidationError> {
        self.get(name)?
            .as_f64()
            .ok_or_else(|| self.invalid(name, "expected a number"))
    }

    /// Get an argument as an integer.
    pub fn get_i64(&self, name: &str) -> Result<i64, ValidationError> {
        self.get(name)?
            .as_i64()
            .ok_or_else(|| self.invalid(name, "expected an integer"))
    }

    /// Get an argument as a non-negative count.
    pub fn get_usize(&self, name: &str) -> Result<usize, ValidationError> {
        let v = self.get_i64(name)?;
        usize::try_from(v).map_err(|_| self.invalid(name, "expected a non-negative integer"))
    }

    /// Get an argument as a boolean.
    pub fn get_bool(&self, name: &str) -> Result<bool, ValidationError> {
        self.get(name)?
            .as_bool()
            .ok_or_else(|| self.invalid(name, "expected true or false"))
    }

    /// Get an argument as a string.
    pub fn get_str(&self, name: &str) -> Result<&str, ValidationError> {
        self.get(name)?
            .as_str()
            .ok_or_else(|| self.invalid(name, "expected a string"))
    }

    /// Get an optional string argument.
    pub fn get_opt_str(&self, name: &str) -> Result<Option<&str>, ValidationError> {
        if self.has(name) {
            self.get_str(name).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Get an argument as an `[x, y]` point.
    pub fn get_point(&self, name: &str) -> Result<(f64, f64), ValidationError> {
        match as_number_list(self.get(name)?).as_deref() {
            Some([x, y]) => Ok((*x, *y)),
            _ => Err(self.invalid(name, "expected [x, y]")),
        }
    }

    /// Get an argument as a list of `[x, y]` points.
    pub fn get_points(&self, name: &str) -> Result<Vec<(f64, f64)>, ValidationError> {
        let seq = self
            .get(name)?
            .as_sequence()
            .ok_or_else(|| self.invalid(name, "expected a list of [x, y] points"))?;
        seq.iter()
            .map(|p| match as_number_list(p).as_deref() {
                Some([x, y]) => Ok((*x, *y)),
                _ => Err(self.invalid(name, "expected a list of [x, y] points")),
            })
            .collect()
    }

    /// Get an argument as a list of numbers.
    pub fn get_numbers(&self, name: &str) -> Result<Vec<f64>, ValidationError> {
        as_number_list(self.get(name)?).ok_or_else(|| self.invalid(name, "expected a list of numbers"))
    }

    /// Get an argument as a list of strings.
    pub fn get_strings(&self, name: &str) -> Result<Vec<String>, ValidationError> {
        let seq = self
            .get(name)?
            .as_sequence()
            .ok_or_else(|| self.invalid(name, "expected a list of strings"))?;
        seq.iter()
            .map(|s| {
                s.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| self.invalid(name, "expected a list of strings"))
            })
            .collect()
    }

    /// Get a 3x3 matrix given either as nested rows or nine numbers.
    pub fn get_matrix3(&self, name: &str) -> Result<Matrix3<f64>, ValidationError> {
        let value = self.get(name)?;
        let flat: Option<Vec<f64>> = match value.as_sequence() {
            Some(rows) if rows.iter().all(|r| r.is_sequence()) => rows
                .iter()
                .map(as_number_list)
                .collect::<Option<Vec<Vec<f64>>>>()
                .filter(|rows| rows.iter().all(|r| r.len() == 3))
                .map(|rows| rows.concat()),
            _ => as_number_list(value),
        };
        match flat {
            Some(v) if v.len() == 9 => Ok(Matrix3::from_row_slice(&v)),
            _ => Err(self.invalid(name, "expected a 3x3 matrix")),
        }
    }

    /// Resolve a path argument against the data directory and check it exists.
    pub fn get_path(&self, name: &str) -> Result<PathBuf, ValidationError> {
        let raw = self.get_str(name)?;
        let path = self.resolve(raw);
        if !path.exists() {
            return Err(ValidationError::ResourceNotFound {
                stage: self.stage.clone(),
                resource: path.display().to_string(),
            });
        }
        Ok(path)
    }

    /// Resolve a relative path against the data directory.
    pub fn resolve(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    /// Build a preparation error for this stage.
    pub fn preparation_error(&self, error: impl ToString) -> ValidationError {
        ValidationError::Preparation {
            stage: self.stage.clone(),
            error: error.to_string(),
        }
    }
}

/// Per-frame artefacts that travel with the image to the image writer.
#[derive(Debug, Clone)]
pub enum FrameArtifact {
    /// The frame's pot matrix; serialised under `_data/pots/`.
    PotMatrix(PotMatrix),
}

/// State shared by all stages across the run.
pub struct PipelineContext {
    /// The `general` configuration section.
    pub general: GeneralConfig,
    /// `_data` directory of the input archive.
    pub data_dir: PathBuf,
    /// Output timestreams by name.
    pub outstreams: IndexMap<String, Timestream>,
    /// Artefacts produced for the current frame; cleared between frames.
    pub output_with_image: IndexMap<String, FrameArtifact>,
    /// Pot matrix of the last frame that got through plant extraction.
    pub running_pot_matrix: Option<PotMatrix>,
}

impl PipelineContext {
    /// Create a context with no output timestreams.
    pub fn new(general: GeneralConfig, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            general,
            data_dir: data_dir.into(),
            outstreams: IndexMap::new(),
            output_with_image: IndexMap::new(),
            running_pot_matrix: None,
        }
    }

    /// Root directory for writer outputs.
    pub fn output_root(&self) -> PathBuf {
        self.general
            .output_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// File name prefix for writer outputs.
    pub fn output_prefix(&self) -> &str {
        self.general.output_prefix.as_deref().unwrap_or("")
    }

    /// Forget everything produced for the previous frame.
    pub fn begin_frame(&mut self) {
        self.output_with_image.clear();
    }
}

/// Context provided during stage execution.
pub struct ExecutionContext<'a> {
    /// Name of the stage being executed.
    pub stage: String,
    inputs: VecDeque<Value>,
    outputs: Vec<Value>,
    /// Run-wide shared state.
    pub pipeline: &'a mut PipelineContext,
}

impl<'a> ExecutionContext<'a> {
    /// Create a context for one stage call.
    pub fn new(stage: impl Into<String>, inputs: Vec<Value>, pipeline: &'a mut PipelineContext) -> Self {
        Self {
            stage: stage.into(),
            inputs: inputs.into(),
            outputs: Vec::new(),
            pipeline,
        }
    }

    /// Build an error tagged with this stage's name.
    pub fn error(&self, kind: FrameErrorKind, message: impl Into<String>) -> StageError {
        StageError::new(self.stage.clone(), kind, message)
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    /// Take the next input value.
    pub fn take_input(&mut self) -> Result<Value, StageError> {
        self.inputs
            .pop_front()
            .ok_or_else(|| self.error(FrameErrorKind::Failed, "stage received too few inputs"))
    }

    fn mismatch(&self, expected: &str, got: &Value) -> StageError {
        self.error(
            FrameErrorKind::Failed,
            format!("expected {} input, got {}", expected, got.get_type()),
        )
    }

    /// Take the next input as an image.
    pub fn take_image(&mut self) -> Result<TimestreamImage, StageError> {
        match self.take_input()? {
            Value::Image(img) => Ok(img),
            other => Err(self.mismatch("image", &other)),
        }
    }

    /// Take the next input as colour parameters.
    pub fn take_color_params(&mut self) -> Result<Option<ColorTransform>, StageError> {
        match self.take_input()? {
            Value::ColorParams(params) => Ok(params),
            other => Err(self.mismatch("colour params", &other)),
        }
    }

    /// Take the next input as an image pyramid.
    pub fn take_pyramid(&mut self) -> Result<Arc<ImagePyramid>, StageError> {
        match self.take_input()? {
            Value::Pyramid(p) => Ok(p),
            other => Err(self.mismatch("pyramid", &other)),
        }
    }

    /// Take the next input as tray locations.
    pub fn take_trays(&mut self) -> Result<Vec<TrayLocation>, StageError> {
        match self.take_input()? {
            Value::Trays(t) => Ok(t),
            other => Err(self.mismatch("tray locations", &other)),
        }
    }

    /// Take the next input as pot locations.
    pub fn take_pots(&mut self) -> Result<Vec<PotLocation>, StageError> {
        match self.take_input()? {
            Value::Pots(p) => Ok(p),
            other => Err(self.mismatch("pot locations", &other)),
        }
    }

    /// Take the next input as a pot matrix.
    pub fn take_pot_matrix(&mut self) -> Result<PotMatrix, StageError> {
        match self.take_input()? {
            Value::PotMatrix(m) => Ok(m),
            other => Err(self.mismatch("pot matrix", &other)),
        }
    }

    // ========================================================================
    // Outputs
    // ========================================================================

    /// Append an output value.
    pub fn push_output(&mut self, value: Value) {
        self.outputs.push(value);
    }

    /// Take all outputs (called by the runner).
    pub fn take_outputs(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.outputs)
    }
}
