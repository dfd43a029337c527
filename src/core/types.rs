//! Core value types that flow between pipeline stages.
//!
//! The set of values a stage can accept or produce is closed, so it is an
//! enum: the adjacency check compares `PortType` lists and the runner threads
//! `Value`s positionally from one stage's outputs into the next one's inputs.

use crate::geometry::colortransform::ColorTransform;
use crate::geometry::pyramid::ImagePyramid;
use crate::geometry::rectangle::rect_from_diagonal;
use crate::pots::PotMatrix;
use crate::timestream::TimestreamImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A value passed between stages.
#[derive(Debug, Clone)]
pub enum Value {
    /// The frame being processed.
    Image(TimestreamImage),
    /// Colour-correction parameters; `None` when the card could not be used.
    ColorParams(Option<ColorTransform>),
    /// Grayscale pyramid of the current frame.
    Pyramid(Arc<ImagePyramid>),
    /// Detected trays, in template order.
    Trays(Vec<TrayLocation>),
    /// Detected pots.
    Pots(Vec<PotLocation>),
    /// Pot matrix of the current frame.
    PotMatrix(PotMatrix),
}

/// Type tags used in stage signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortType {
    Image,
    ColorParams,
    Pyramid,
    TrayLocations,
    PotLocations,
    PotMatrix,
}

/// Location of one tray found by template matching.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrayLocation {
    /// Index of the tray template (0-based).
    pub index: usize,
    /// Centre of the match in full-resolution pixels.
    pub center: (f64, f64),
    /// Template size (width, height) in full-resolution pixels.
    pub size: (u32, u32),
    /// Normalised cross-correlation score.
    pub score: f64,
    /// Whether the tray matched rotated by 180 degrees.
    pub rotated: bool,
}

/// Location of one pot found inside a tray.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PotLocation {
    /// Stable pot identifier.
    pub id: u32,
    /// Index of the tray the pot belongs to.
    pub tray: usize,
    /// Centre in full-resolution pixels.
    pub center: (f64, f64),
    /// Pot template size (width, height).
    pub size: (u32, u32),
    /// Match score, or the tray score when the position was interpolated.
    pub score: f64,
}

impl TrayLocation {
    /// Top-left corner of the matched rectangle.
    pub fn top_left(&self) -> (f64, f64) {
        (
            self.center.0 - self.size.0 as f64 / 2.0,
            self.center.1 - self.size.1 as f64 / 2.0,
        )
    }

    /// Corners ordered top-left, bottom-left, bottom-right, top-right.
    pub fn corners(&self) -> [(f64, f64); 4] {
        let (x0, y0) = self.top_left();
        let far = (x0 + self.size.0 as f64, y0 + self.size.1 as f64);
        rect_from_diagonal((x0, y0), far, self.size.0 as f64 / self.size.1.max(1) as f64)
    }
}

impl Value {
    /// Get the type tag of this value.
    pub fn get_type(&self) -> PortType {
        match self {
            Value::Image(_) => PortType::Image,
            Value::ColorParams(_) => PortType::ColorParams,
            Value::Pyramid(_) => PortType::Pyramid,
            Value::Trays(_) => PortType::TrayLocations,
            Value::Pots(_) => PortType::PotLocations,
            Value::PotMatrix(_) => PortType::PotMatrix,
        }
    }

    /// Try to get as image.
    pub fn as_image(&self) -> Option<&TimestreamImage> {
        match self {
            Value::Image(img) => Some(img),
            _ => None,
        }
    }

    /// Try to get as pot matrix.
    pub fn as_pot_matrix(&self) -> Option<&PotMatrix> {
        match self {
            Value::PotMatrix(matrix) => Some(matrix),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Image(img) => write!(f, "Image({})", img.timestamp_string()),
            Value::ColorParams(Some(_)) => write!(f, "ColorParams"),
            Value::ColorParams(None) => write!(f, "ColorParams(none)"),
            Value::Pyramid(p) => write!(f, "Pyramid({} levels)", p.levels()),
            Value::Trays(t) => write!(f, "Trays({})", t.len()),
            Value::Pots(p) => write!(f, "Pots({})", p.len()),
            Value::PotMatrix(m) => write!(f, "PotMatrix({} pots)", m.len()),
        }
    }
}

impl PortType {
    /// Get a human-readable name.
    pub fn display_name(&self) -> &'static str {
        match self {
            PortType::Image => "image",
            PortType::ColorParams => "colour params",
            PortType::Pyramid => "image pyramid",
            PortType::TrayLocations => "tray locations",
            PortType::PotLocations => "pot locations",
            PortType::PotMatrix => "pot matrix",
        }
    }

    /// Render a signature such as `[image, pot matrix]`.
    pub fn list_display(types: &[PortType]) -> String {
        let names: Vec<&str> = types.iter().map(|t| t.display_name()).collect();
        format!("[{}]", names.join(", "))
    }

    /// Check if a value has this type.
    pub fn matches(&self, value: &Value) -> bool {
        value.get_type() == *self
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_types() {
        assert_eq!(Value::ColorParams(None).get_type(), PortType::ColorParams);
        assert_eq!(Value::Trays(Vec::new()).get_type(), PortType::TrayLocations);
        assert!(PortType::PotLocations.matches(&Value::Pots(Vec::new())));
        assert!(!PortType::Image.matches(&Value::Pots(Vec::new())));
    }

    #[test]
    fn test_signature_display() {
        assert_eq!(
            PortType::list_display(&[PortType::Image, PortType::PotMatrix]),
            "[image, pot matrix]"
        );
        assert_eq!(PortType::list_display(&[]), "[]");
    }

    #[test]
    fn test_tray_top_left() {
        let tray = TrayLocation {
            index: 0,
            center: (100.0, 50.0),
            size: (40, 20),
            score: 0.9,
            rotated: false,
        };
        assert_eq!(tray.top_left(), (80.0, 40.0));
    }
}
