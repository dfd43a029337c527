//! Stage argument schemas and constraints.
//!
//! Every stage declares an ordered list of arguments. Each argument has a
//! type, an optional default (arguments without one are required) and
//! optional constraints checked before the first frame is processed.

use serde::{Deserialize, Serialize};
use serde_yml::Value as YamlValue;
use std::fmt;

/// Type of a stage argument as written in the pipeline YAML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgType {
    /// Any number.
    Float,
    /// A whole number.
    Integer,
    /// `true` / `false`.
    Boolean,
    /// Free text.
    String,
    /// A file path, relative to the input archive's `_data` directory.
    Path,
    /// A sequence of two numbers.
    Point,
    /// A sequence of points.
    PointList,
    /// A sequence of strings.
    StringList,
    /// A sequence of numbers.
    NumberList,
    /// A nested mapping or sequence of numbers (e.g. a matrix).
    Matrix,
}

/// Definition of a stage argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDefinition {
    /// Argument name as written in the YAML.
    pub name: String,
    /// Type of the argument.
    pub arg_type: ArgType,
    /// Default value; `None` means the argument is required.
    pub default_value: Option<YamlValue>,
    /// Description for documentation.
    pub description: String,
    /// Constraints for validation.
    pub constraints: Vec<Constraint>,
}

/// Constraints that can be applied to argument values.
///
/// Constraints are checked during validation before execution begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum Constraint {
    /// Numeric value must be within range [min, max]
    Range { min: f64, max: f64 },
    /// Numeric value must be > 0
    Positive,
    /// Numeric value must be >= 0
    NonNegative,
    /// String/sequence must not be empty
    NotEmpty,
    /// Sequence length must be >= min
    MinLength(usize),
    /// String must be one of the listed options
    OneOf(Vec<String>),
}

// ============================================================================
// ParameterDefinition Builder Pattern
// ============================================================================

impl ParameterDefinition {
    /// Create a required argument.
    pub fn required(name: impl Into<String>, arg_type: ArgType) -> Self {
        Self {
            name: name.into(),
            arg_type,
            default_value: None,
            description: String::new(),
            constraints: Vec::new(),
        }
    }

    /// Create an optional argument with a default.
    pub fn new(name: impl Into<String>, arg_type: ArgType, default_value: impl Into<YamlValue>) -> Self {
        Self {
            name: name.into(),
            arg_type,
            default_value: Some(default_value.into()),
            description: String::new(),
            constraints: Vec::new(),
        }
    }

    /// Create an optional argument whose default is null.
    pub fn optional(name: impl Into<String>, arg_type: ArgType) -> Self {
        Self::new(name, arg_type, YamlValue::Null)
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a range constraint.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.constraints.push(Constraint::Range { min, max });
        self
    }

    /// Add a constraint.
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Whether the argument must be supplied.
    pub fn is_required(&self) -> bool {
        self.default_value.is_none()
    }

    /// Validate a value against this argument's type and constraints.
    pub fn validate(&self, value: &YamlValue) -> Result<(), String> {
        if value.is_null() && !self.is_required() {
            return Ok(());
        }
        if !self.arg_type.matches(value) {
            return Err(format!("expected {}, got {}", self.arg_type, describe(value)));
        }
        for constraint in &self.constraints {
            constraint.validate(value)?;
        }
        Ok(())
    }
}

impl ArgType {
    /// Check if a YAML value has this type.
    pub fn matches(&self, value: &YamlValue) -> bool {
        match self {
            ArgType::Float => value.is_number(),
            ArgType::Integer => value.is_i64() || value.is_u64(),
            ArgType::Boolean => value.is_bool(),
            ArgType::String | ArgType::Path => value.is_string(),
            ArgType::Point => as_number_list(value).map(|v| v.len() == 2).unwrap_or(false),
            ArgType::PointList => value
                .as_sequence()
                .map(|seq| seq.iter().all(|p| ArgType::Point.matches(p)))
                .unwrap_or(false),
            ArgType::StringList => value
                .as_sequence()
                .map(|seq| seq.iter().all(|s| s.is_string()))
                .unwrap_or(false),
            ArgType::NumberList => as_number_list(value).is_some(),
            ArgType::Matrix => value.is_sequence() || value.is_mapping(),
        }
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgType::Float => "number",
            ArgType::Integer => "integer",
            ArgType::Boolean => "boolean",
            ArgType::String => "string",
            ArgType::Path => "path",
            ArgType::Point => "point [x, y]",
            ArgType::PointList => "list of points",
            ArgType::StringList => "list of strings",
            ArgType::NumberList => "list of numbers",
            ArgType::Matrix => "matrix",
        };
        f.write_str(name)
    }
}

/// Read a YAML sequence of numbers.
pub fn as_number_list(value: &YamlValue) -> Option<Vec<f64>> {
    value
        .as_sequence()?
        .iter()
        .map(|v| v.as_f64())
        .collect::<Option<Vec<f64>>>()
}

fn describe(value: &YamlValue) -> &'static str {
    match value {
        YamlValue::Null => "null",
        YamlValue::Bool(_) => "boolean",
        YamlValue::Number(_) => "number",
        YamlValue::String(_) => "string",
        YamlValue::Sequence(_) => "sequence",
        YamlValue::Mapping(_) => "mapping",
        YamlValue::Tagged(_) => "tagged value",
    }
}

// ============================================================================
// Constraint Validation
// ============================================================================

impl Constraint {
    /// Validate a value against this constraint.
    pub fn validate(&self, value: &YamlValue) -> Result<(), String> {
        match self {
            Constraint::Range { min, max } => {
                if let Some(num) = value.as_f64() {
                    if num < *min || num > *max {
                        return Err(format!("Value {} is out of range [{}, {}]", num, min, max));
                    }
                }
            }

            Constraint::Positive => {
                if let Some(num) = value.as_f64() {
                    if num <= 0.0 {
                        return Err(format!("Value {} must be positive", num));
                    }
                }
            }

            Constraint::NonNegative => {
                if let Some(num) = value.as_f64() {
                    if num < 0.0 {
                        return Err(format!("Value {} must be non-negative", num));
                    }
                }
            }

            Constraint::NotEmpty => {
                let is_empty = match value {
                    YamlValue::String(s) => s.is_empty(),
                    YamlValue::Sequence(seq) => seq.is_empty(),
                    YamlValue::Mapping(map) => map.is_empty(),
                    _ => false,
                };
                if is_empty {
                    return Err("Value cannot be empty".to_string());
                }
            }

            Constraint::MinLength(min_len) => {
                let len = match value {
                    YamlValue::String(s) => s.len(),
                    YamlValue::Sequence(seq) => seq.len(),
                    _ => 0,
                };
                if len < *min_len {
                    return Err(format!("Length {} is below minimum {}", len, min_len));
                }
            }

            Constraint::OneOf(options) => {
                if let Some(s) = value.as_str() {
                    if !options.iter().any(|o| o == s) {
                        return Err(format!("'{}' is not one of {:?}", s, options));
                    }
                }
            }
        }

        Ok(())
    }

    /// Get a human-readable description of this constraint.
    pub fn description(&self) -> String {
        match self {
            Constraint::Range { min, max } => format!("Must be between {} and {}", min, max),
            Constraint::Positive => "Must be positive".to_string(),
            Constraint::NonNegative => "Must be non-negative".to_string(),
            Constraint::NotEmpty => "Cannot be empty".to_string(),
            Constraint::MinLength(len) => format!("Minimum length: {}", len),
            Constraint::OneOf(options) => format!("One of {}", options.join(", ")),
        }
    }
}
