//! Built-in stage implementations.

mod analyze;
mod color;
mod detection;
mod geometry;
mod output;

use crate::core::context::{ExecutionContext, ValidationContext};
use crate::core::error::{FrameErrorKind, StageError, TimestreamError, ValidationError};
use crate::stages::registry::StageRegistry;
use crate::timestream::TimestreamImage;
use image::RgbImage;
use std::path::Path;
use std::sync::Arc;

/// Register all built-in stages.
pub fn register_all(registry: &mut StageRegistry) {
    geometry::register(registry);
    color::register(registry);
    detection::register(registry);
    analyze::register(registry);
    output::register(registry);
}

// Re-export for direct access
pub use analyze::{FeatureExtract, PlantExtract};
pub use color::{ColorCardDetect, ColorCorrect};
pub use detection::{PotDetect, TrayDetect};
pub use geometry::Undistort;
pub use output::{ImageWrite, WriteFeaturesCsv, WriteFeaturesNdarray};

/// Key of the frame's pot matrix in the output-with-image mapping.
pub const POT_MATRIX_KEY: &str = "potMatrix";

/// Pixels of the frame, mapping load failures to frame error kinds.
pub(crate) fn frame_pixels(ctx: &ExecutionContext<'_>, image: &mut TimestreamImage) -> Result<Arc<RgbImage>, StageError> {
    image.pixels().map_err(|e| {
        let kind = match e {
            TimestreamError::Image(_) => FrameErrorKind::Corrupt,
            TimestreamError::NoPixels | TimestreamError::Io(_) => FrameErrorKind::Missing,
            _ => FrameErrorKind::Failed,
        };
        ctx.error(kind, e.to_string())
    })
}

/// Load a reference image named by a path argument.
pub(crate) fn load_reference(ctx: &ValidationContext, name: &str) -> Result<RgbImage, ValidationError> {
    let path = ctx.get_path(name)?;
    read_reference(ctx, &path)
}

/// Load a reference image from a resolved path.
pub(crate) fn read_reference(ctx: &ValidationContext, path: &Path) -> Result<RgbImage, ValidationError> {
    if !path.exists() {
        return Err(ValidationError::ResourceNotFound {
            stage: ctx.stage.clone(),
            resource: path.display().to_string(),
        });
    }
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|e| ctx.preparation_error(format!("cannot read {}: {}", path.display(), e)))
}

/// Mean grey level of an image in `[0, 255]`.
pub(crate) fn mean_intensity(img: &RgbImage) -> f64 {
    let n = img.width() as f64 * img.height() as f64;
    if n == 0.0 {
        return 0.0;
    }
    let sum: f64 = img
        .pixels()
        .map(|p| 0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64)
        .sum();
    sum / n
}
