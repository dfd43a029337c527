//! Per-pot feature catalog.
//!
//! Geometric features come from the 8-connected components of the mask and
//! are summed across components. Colour features average over the masked
//! pixels of the pot image. A feature that cannot be computed is recorded as
//! [`FeatureValue::Error`] and written as NaN.

use crate::core::error::PotError;
use image::{GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::region_labelling::{connected_components, Connectivity};
use indexmap::IndexMap;
use palette::{FromColor, Hsv, Srgb};
use std::f64::consts::PI;
use std::fmt;

/// Every feature name, in output order.
pub const FEATURES: [&str; 16] = [
    "area",
    "perimeter",
    "compactness",
    "eccentricity",
    "roundness",
    "height",
    "height2",
    "mincircle",
    "leafcount1",
    "gcc",
    "exg",
    "rms",
    "hsv",
    "wilting",
    "wilting2",
    "audit",
];

/// Result of one feature computation.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Value(f64),
    Error(String),
}

impl FeatureValue {
    /// Numeric value; errors become NaN.
    pub fn as_f64(&self) -> f64 {
        match self {
            FeatureValue::Value(v) => *v,
            FeatureValue::Error(_) => f64::NAN,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, FeatureValue::Error(_))
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Value(v) => write!(f, "{}", v),
            FeatureValue::Error(_) => f.write_str("NaN"),
        }
    }
}

/// Expand a feature request; `"all"` selects the whole catalog.
pub fn resolve_names(requested: &[String]) -> Result<Vec<String>, PotError> {
    if requested.is_empty() || requested.iter().any(|n| n == "all") {
        return Ok(FEATURES.iter().map(|s| s.to_string()).collect());
    }
    requested
        .iter()
        .map(|n| {
            if FEATURES.contains(&n.as_str()) {
                Ok(n.clone())
            } else {
                Err(PotError::UnknownFeature(n.clone()))
            }
        })
        .collect()
}

/// Compute the named features over a pot image and its mask.
pub fn calc_features(names: &[String], image: &RgbImage, mask: &GrayImage) -> IndexMap<String, FeatureValue> {
    let shape = MaskShape::analyse(mask);
    names
        .iter()
        .map(|name| {
            let value = match compute(name, image, mask, &shape) {
                Ok(v) if v.is_finite() => FeatureValue::Value(v),
                Ok(v) => FeatureValue::Error(format!("{} is not finite ({})", name, v)),
                Err(e) => FeatureValue::Error(e),
            };
            (name.clone(), value)
        })
        .collect()
}

// ============================================================================
// Shape analysis
// ============================================================================

/// Moments and extents of one connected component.
#[derive(Debug, Clone, Default)]
struct Component {
    area: f64,
    perimeter: f64,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_yy: f64,
    sum_xy: f64,
    pixels: Vec<(u32, u32)>,
}

impl Component {
    fn centroid(&self) -> (f64, f64) {
        (self.sum_x / self.area, self.sum_y / self.area)
    }

    /// Eigenvalues (largest first) of the pixel covariance.
    fn inertia(&self) -> (f64, f64) {
        let (cx, cy) = self.centroid();
        let sxx = self.sum_xx / self.area - cx * cx;
        let syy = self.sum_yy / self.area - cy * cy;
        let sxy = self.sum_xy / self.area - cx * cy;
        let mean = (sxx + syy) / 2.0;
        let diff = (((sxx - syy) / 2.0).powi(2) + sxy * sxy).sqrt();
        (mean + diff, (mean - diff).max(0.0))
    }

    fn eccentricity(&self) -> f64 {
        let (major, minor) = self.inertia();
        if major <= 0.0 {
            0.0
        } else {
            (1.0 - minor / major).sqrt()
        }
    }

    /// `4 * area / (pi * major_axis^2)`.
    fn roundness(&self) -> f64 {
        let major_axis = 4.0 * self.inertia().0.sqrt();
        if major_axis <= 0.0 {
            1.0
        } else {
            4.0 * self.area / (PI * major_axis * major_axis)
        }
    }

    fn compactness(&self) -> f64 {
        4.0 * PI * self.area / (self.perimeter * self.perimeter)
    }

    /// Radius of the enclosing circle centred on the centroid.
    fn enclosing_radius(&self) -> f64 {
        let (cx, cy) = self.centroid();
        self.pixels
            .iter()
            .map(|&(x, y)| ((x as f64 - cx).powi(2) + (y as f64 - cy).powi(2)).sqrt() + 0.5)
            .fold(0.0, f64::max)
    }
}

struct MaskShape {
    components: Vec<Component>,
    width: u32,
    height: u32,
    top: Option<u32>,
    bottom: Option<u32>,
    leaves: usize,
}

/// 0/255 copy of a mask, as the morphology operators expect.
pub(crate) fn to_binary(mask: &GrayImage) -> GrayImage {
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        Luma([if mask.get_pixel(x, y)[0] > 0 { 255 } else { 0 }])
    })
}

fn is_set(mask: &GrayImage, x: i64, y: i64) -> bool {
    x >= 0
        && y >= 0
        && (x as u32) < mask.width()
        && (y as u32) < mask.height()
        && mask.get_pixel(x as u32, y as u32)[0] > 0
}

impl MaskShape {
    fn analyse(mask: &GrayImage) -> Self {
        let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
        let mut by_label: IndexMap<u32, Component> = IndexMap::new();
        let (mut top, mut bottom) = (None::<u32>, None::<u32>);

        for (x, y, label) in labels.enumerate_pixels() {
            let label = label[0];
            if label == 0 {
                continue;
            }
            top = Some(top.map_or(y, |t| t.min(y)));
            bottom = Some(bottom.map_or(y, |b| b.max(y)));
            let c = by_label.entry(label).or_default();
            let (fx, fy) = (x as f64, y as f64);
            c.area += 1.0;
            c.sum_x += fx;
            c.sum_y += fy;
            c.sum_xx += fx * fx;
            c.sum_yy += fy * fy;
            c.sum_xy += fx * fy;
            c.pixels.push((x, y));
            let (xi, yi) = (x as i64, y as i64);
            let boundary = [(-1, 0), (1, 0), (0, -1), (0, 1)]
                .iter()
                .any(|(dx, dy)| !is_set(mask, xi + dx, yi + dy));
            if boundary {
                c.perimeter += 1.0;
            }
        }

        // Leaves separated by thin joins: components left after one erosion.
        let eroded = imageproc::morphology::erode(&to_binary(mask), Norm::LInf, 1);
        let leaves = connected_components(&eroded, Connectivity::Eight, Luma([0u8]))
            .pixels()
            .map(|p| p[0])
            .max()
            .unwrap_or(0) as usize;

        Self {
            components: by_label.into_values().collect(),
            width: mask.width(),
            height: mask.height(),
            top,
            bottom,
            leaves,
        }
    }

    fn area(&self) -> f64 {
        self.components.iter().map(|c| c.area).sum()
    }

    fn sum(&self, f: impl Fn(&Component) -> f64) -> Result<f64, String> {
        if self.components.is_empty() {
            return Err("mask is empty".to_string());
        }
        Ok(self.components.iter().map(f).sum())
    }

    /// Mean foreground row, relative to the top of the plant.
    fn centroid_row(&self) -> Option<f64> {
        let area = self.area();
        (area > 0.0).then(|| self.components.iter().map(|c| c.sum_y).sum::<f64>() / area)
    }
}

// ============================================================================
// Colour statistics
// ============================================================================

fn masked_pixels<'a>(image: &'a RgbImage, mask: &'a GrayImage) -> impl Iterator<Item = [f64; 3]> + 'a {
    image
        .enumerate_pixels()
        .filter(move |(x, y, _)| mask.get_pixel(*x, *y)[0] > 0)
        .map(|(_, _, p)| [p[0] as f64, p[1] as f64, p[2] as f64])
}

fn masked_mean(image: &RgbImage, mask: &GrayImage, f: impl Fn([f64; 3]) -> Option<f64>) -> Result<f64, String> {
    let (sum, n) = masked_pixels(image, mask)
        .filter_map(f)
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        Err("no masked pixels".to_string())
    } else {
        Ok(sum / n as f64)
    }
}

fn chromatic(p: [f64; 3]) -> Option<[f64; 3]> {
    let total = p[0] + p[1] + p[2];
    (total > 0.0).then(|| [p[0] / total, p[1] / total, p[2] / total])
}

// ============================================================================
// Dispatch
// ============================================================================

fn compute(name: &str, image: &RgbImage, mask: &GrayImage, shape: &MaskShape) -> Result<f64, String> {
    if image.dimensions() != mask.dimensions() {
        return Err(format!(
            "image is {:?}, mask is {:?}",
            image.dimensions(),
            mask.dimensions()
        ));
    }
    match name {
        "area" => Ok(shape.area()),
        "perimeter" => Ok(shape.components.iter().map(|c| c.perimeter).sum()),
        "compactness" => shape.sum(Component::compactness),
        "eccentricity" => shape.sum(Component::eccentricity),
        "roundness" => shape.sum(Component::roundness),
        // Rows from the highest plant pixel to the bottom of the pot.
        "height" => shape
            .top
            .map(|t| (shape.height - t) as f64)
            .ok_or_else(|| "mask is empty".to_string()),
        // Vertical extent of the plant itself.
        "height2" => match (shape.top, shape.bottom) {
            (Some(t), Some(b)) => Ok((b - t + 1) as f64),
            _ => Err("mask is empty".to_string()),
        },
        "mincircle" => shape.sum(Component::enclosing_radius),
        "leafcount1" => Ok(shape.leaves as f64),
        "gcc" => masked_mean(image, mask, |p| chromatic(p).map(|c| c[1])),
        "exg" => masked_mean(image, mask, |p| chromatic(p).map(|c| 2.0 * c[1] - c[0] - c[2])),
        "rms" => {
            let luma = |p: [f64; 3]| 0.299 * p[0] + 0.587 * p[1] + 0.114 * p[2];
            let mean = masked_mean(image, mask, |p| Some(luma(p)))?;
            masked_mean(image, mask, |p| Some((luma(p) - mean).powi(2))).map(f64::sqrt)
        }
        "hsv" => masked_mean(image, mask, |p| {
            let rgb = Srgb::new(p[0] as f32 / 255.0, p[1] as f32 / 255.0, p[2] as f32 / 255.0);
            let hsv: Hsv = Hsv::from_color(rgb);
            Some(hsv.hue.into_positive_degrees() as f64)
        }),
        // Droop: how far the mass sits below the top of the plant.
        "wilting" => match (shape.top, shape.bottom, shape.centroid_row()) {
            (Some(t), Some(b), Some(c)) => Ok((c - t as f64) / (b - t + 1) as f64),
            _ => Err("mask is empty".to_string()),
        },
        // Share of the plant in the lower half of the pot.
        "wilting2" => {
            let area = shape.area();
            if area == 0.0 {
                return Err("mask is empty".to_string());
            }
            let half = shape.height as f64 / 2.0;
            let lower: f64 = shape
                .components
                .iter()
                .flat_map(|c| c.pixels.iter())
                .filter(|(_, y)| *y as f64 >= half)
                .count() as f64;
            Ok(lower / area)
        }
        // Foreground fraction of the pot.
        "audit" => Ok(shape.area() / (shape.width as f64 * shape.height as f64)),
        other => Err(format!("unknown feature '{}'", other)),
    }
}
