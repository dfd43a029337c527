//! Geometric correction: lens undistortion and right-angle rotation.

use super::frame_pixels;
use crate::core::context::{ExecutionContext, ValidationContext};
use crate::core::error::{StageError, ValidationError};
use crate::core::node::{Category, PipelineStage, StageMetadata};
use crate::core::port::{ArgType, Constraint, ParameterDefinition};
use crate::core::types::{PortType, Value};
use crate::geometry::undistort::{Distortion, Rotation, UndistortMaps};
use crate::stages::registry::StageRegistry;

/// Register geometry stages.
pub fn register(registry: &mut StageRegistry) {
    registry.register(|| Box::new(Undistort::default()));
}

/// Rectifies lens distortion, then rotates by a multiple of 90 degrees.
///
/// The remap tables are computed once in `prepare`.
#[derive(Debug, Default)]
pub struct Undistort {
    maps: Option<UndistortMaps>,
    rotation: Rotation,
}

impl PipelineStage for Undistort {
    fn metadata(&self) -> StageMetadata {
        StageMetadata::builder("undistort")
            .category(Category::Geometry)
            .description("Remove lens distortion and rotate the frame")
            .expects(&[PortType::Image])
            .returns(&[PortType::Image])
            .parameter(
                ParameterDefinition::required("cameraMatrix", ArgType::Matrix)
                    .with_description("3x3 pinhole camera matrix K"),
            )
            .parameter(
                ParameterDefinition::required("distortCoefs", ArgType::NumberList)
                    .with_description("Distortion coefficients k1, k2, p1, p2, k3")
                    .with_constraint(Constraint::MinLength(4)),
            )
            .parameter(
                ParameterDefinition::required("imageSize", ArgType::Point)
                    .with_description("Frame size [width, height] the calibration was made for"),
            )
            .parameter(
                ParameterDefinition::new("rotationAngle", ArgType::Integer, 0)
                    .with_description("Counter-clockwise rotation applied after undistortion (multiple of 90)"),
            )
            .build()
    }

    fn prepare(&mut self, ctx: &ValidationContext) -> Result<(), ValidationError> {
        let camera = ctx.get_matrix3("cameraMatrix")?;
        let coefs = ctx.get_numbers("distortCoefs")?;
        if coefs.len() > 5 {
            return Err(ctx.preparation_error("at most five distortion coefficients are supported"));
        }
        let (w, h) = ctx.get_point("imageSize")?;
        if w < 1.0 || h < 1.0 {
            return Err(ctx.preparation_error("imageSize must be positive"));
        }
        let degrees = ctx.get_i64("rotationAngle")?;
        self.rotation = Rotation::from_degrees(degrees)
            .ok_or_else(|| ctx.preparation_error(format!("rotationAngle {} is not a multiple of 90", degrees)))?;
        self.maps = Some(UndistortMaps::new(
            &camera,
            Distortion::from_slice(&coefs),
            (w as u32, h as u32),
        ));
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), StageError> {
        let mut image = ctx.take_image()?;
        let pixels = frame_pixels(ctx, &mut image)?;
        let maps = self
            .maps
            .as_ref()
            .ok_or_else(|| StageError::failed("undistort", "stage was not prepared"))?;
        if pixels.dimensions() != maps.size() {
            return Err(StageError::failed(
                "undistort",
                format!(
                    "frame is {:?}, calibration is for {:?}",
                    pixels.dimensions(),
                    maps.size()
                ),
            ));
        }
        let rectified = maps.remap(&pixels);
        image.set_pixels(self.rotation.apply(&rectified));
        ctx.push_output(Value::Image(image));
        Ok(())
    }
}
