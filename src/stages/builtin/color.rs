//! Colour-card detection and colour correction.

use super::{frame_pixels, load_reference, mean_intensity};
use crate::core::context::{ExecutionContext, ValidationContext};
use crate::core::data::DataValue;
use crate::core::error::{StageError, ValidationError};
use crate::core::node::{Category, PipelineStage, StageMetadata};
use crate::core::port::{as_number_list, ArgType, Constraint, ParameterDefinition};
use crate::core::types::{PortType, Value};
use crate::geometry::colorcard::{sample_card, DEFAULT_CARD_COLORS};
use crate::geometry::colortransform::ColorTransform;
use crate::geometry::matching::{match_template, MatchParams};
use crate::geometry::pyramid::ImagePyramid;
use crate::stages::registry::StageRegistry;

/// Register colour stages.
pub fn register(registry: &mut StageRegistry) {
    registry.register(|| Box::new(ColorCardDetect::default()));
    registry.register(|| Box::new(ColorCorrect::default()));
}

const DEFAULT_MIN_INTENSITY: f64 = 20.0;

fn min_intensity_parameter() -> ParameterDefinition {
    ParameterDefinition::new("minIntensity", ArgType::Float, DEFAULT_MIN_INTENSITY)
        .with_description("Frames darker than this mean grey level are left alone")
        .with_range(0.0, 255.0)
}

// ============================================================================
// Colour card detection
// ============================================================================

/// Finds the colour card and fits a transform from its sampled patches to
/// the card's true colours.
///
/// Every frame is fitted on its own. Outputs `None` parameters for dark
/// frames or when the fit fails; a card that cannot be found is a
/// low-score frame error.
#[derive(Debug)]
pub struct ColorCardDetect {
    template: Option<ImagePyramid>,
    template_size: (u32, u32),
    position: (f64, f64),
    window: (f64, f64),
    true_colors: Vec<[f64; 3]>,
    min_intensity: f64,
    levels: usize,
}

impl Default for ColorCardDetect {
    fn default() -> Self {
        Self {
            template: None,
            template_size: (0, 0),
            position: (0.0, 0.0),
            window: (0.0, 0.0),
            true_colors: DEFAULT_CARD_COLORS.to_vec(),
            min_intensity: DEFAULT_MIN_INTENSITY,
            levels: 4,
        }
    }
}

/// Rows of `[r, g, b]` from a matrix argument.
fn color_rows(ctx: &ValidationContext, name: &str) -> Result<Vec<[f64; 3]>, ValidationError> {
    let rows = ctx
        .get(name)?
        .as_sequence()
        .ok_or_else(|| ctx.preparation_error(format!("{} must be a list of [r, g, b] rows", name)))?;
    rows.iter()
        .map(|row| match as_number_list(row).as_deref() {
            Some([r, g, b]) => Ok([*r, *g, *b]),
            _ => Err(ctx.preparation_error(format!("{} must be a list of [r, g, b] rows", name))),
        })
        .collect()
}

impl PipelineStage for ColorCardDetect {
    fn metadata(&self) -> StageMetadata {
        StageMetadata::builder("colorcarddetect")
            .category(Category::Color)
            .description("Locate the colour card and estimate a colour correction")
            .expects(&[PortType::Image])
            .returns(&[PortType::Image, PortType::ColorParams])
            .parameter(
                ParameterDefinition::required("colorcardFile", ArgType::Path)
                    .with_description("Image of the colour card as it appears in the frames"),
            )
            .parameter(
                ParameterDefinition::required("colorcardPosition", ArgType::Point)
                    .with_description("Estimated centre of the card [x, y]"),
            )
            .parameter(
                ParameterDefinition::optional("searchWindow", ArgType::Point)
                    .with_description("Half size of the search window; defaults to the card size"),
            )
            .parameter(
                ParameterDefinition::optional("colorcardTrueColors", ArgType::Matrix)
                    .with_description("True patch colours, one [r, g, b] row per patch"),
            )
            .parameter(min_intensity_parameter())
            .parameter(
                ParameterDefinition::new("pyramidLevels", ArgType::Integer, 4)
                    .with_description("Pyramid depth used for matching")
                    .with_range(1.0, 8.0),
            )
            .build()
    }

    fn prepare(&mut self, ctx: &ValidationContext) -> Result<(), ValidationError> {
        let card = load_reference(ctx, "colorcardFile")?;
        self.levels = ctx.get_usize("pyramidLevels")?;
        self.template_size = card.dimensions();
        self.template = Some(ImagePyramid::from_rgb(&card, self.levels));
        self.position = ctx.get_point("colorcardPosition")?;
        self.window = if ctx.has("searchWindow") {
            ctx.get_point("searchWindow")?
        } else {
            (self.template_size.0 as f64, self.template_size.1 as f64)
        };
        if ctx.has("colorcardTrueColors") {
            self.true_colors = color_rows(ctx, "colorcardTrueColors")?;
            if self.true_colors.len() != DEFAULT_CARD_COLORS.len() {
                return Err(ctx.preparation_error(format!(
                    "colorcardTrueColors has {} rows, the card has {} patches",
                    self.true_colors.len(),
                    DEFAULT_CARD_COLORS.len()
                )));
            }
        }
        self.min_intensity = ctx.get_f64("minIntensity")?;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), StageError> {
        let mut image = ctx.take_image()?;
        let pixels = frame_pixels(ctx, &mut image)?;

        let intensity = mean_intensity(&pixels);
        if intensity < self.min_intensity {
            log::info!(
                "{}: mean intensity {:.1} below {}, skipping colour card",
                image.timestamp_string(),
                intensity,
                self.min_intensity
            );
            ctx.push_output(Value::Image(image));
            ctx.push_output(Value::ColorParams(None));
            return Ok(());
        }

        let template = self
            .template
            .as_ref()
            .ok_or_else(|| StageError::failed(&ctx.stage, "stage was not prepared"))?;
        let frame = ImagePyramid::from_rgb(&pixels, self.levels);
        let params = MatchParams::around(self.position, self.window).with_rotation_probe();
        let found = match match_template(&frame, template, &params) {
            Some(m) if !m.low_confidence => m,
            Some(m) => {
                return Err(StageError::low_score(
                    &ctx.stage,
                    format!("colour card scored {:.3}", m.score),
                ))
            }
            None => return Err(StageError::low_score(&ctx.stage, "colour card not found")),
        };
        log::debug!(
            "colour card at ({:.0}, {:.0}) score {:.3}",
            found.center.0,
            found.center.1,
            found.score
        );

        let (w, h) = self.template_size;
        let x = found.top_left.0.max(0) as u32;
        let y = found.top_left.1.max(0) as u32;
        let samples = sample_card(&pixels, [x, y, w, h], found.rotated);
        let transform = ColorTransform::fit(&samples.medians, &self.true_colors);
        match &transform {
            Some(t) => log::debug!(
                "colour fit rms {:.2}",
                t.rms_error(&samples.medians, &self.true_colors)
            ),
            None => log::warn!("{}: colour transform fit failed", image.timestamp_string()),
        }

        image.metadata.insert(
            "colorcardPosition".to_string(),
            DataValue::List(vec![found.center.0.into(), found.center.1.into()]),
        );
        image
            .metadata
            .insert("colorcardScore".to_string(), found.score.into());
        ctx.push_output(Value::Image(image));
        ctx.push_output(Value::ColorParams(transform));
        Ok(())
    }
}

// ============================================================================
// Colour correction
// ============================================================================

/// Applies the colour transform from [`ColorCardDetect`].
#[derive(Debug)]
pub struct ColorCorrect {
    min_intensity: f64,
}

impl Default for ColorCorrect {
    fn default() -> Self {
        Self {
            min_intensity: DEFAULT_MIN_INTENSITY,
        }
    }
}

impl PipelineStage for ColorCorrect {
    fn metadata(&self) -> StageMetadata {
        StageMetadata::builder("colorcorrect")
            .category(Category::Color)
            .description("Apply the estimated colour correction")
            .expects(&[PortType::Image, PortType::ColorParams])
            .returns(&[PortType::Image])
            .parameter(min_intensity_parameter().with_constraint(Constraint::NonNegative))
            .build()
    }

    fn prepare(&mut self, ctx: &ValidationContext) -> Result<(), ValidationError> {
        self.min_intensity = ctx.get_f64("minIntensity")?;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), StageError> {
        let mut image = ctx.take_image()?;
        let params = ctx.take_color_params()?;
        let Some(transform) = params else {
            ctx.push_output(Value::Image(image));
            return Ok(());
        };
        let pixels = frame_pixels(ctx, &mut image)?;
        if mean_intensity(&pixels) >= self.min_intensity {
            image.set_pixels(transform.apply(&pixels));
        }
        ctx.push_output(Value::Image(image));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeneralConfig;
    use crate::core::context::PipelineContext;
    use crate::geometry::colorcard::render_card;
    use crate::timestream::TimestreamImage;
    use chrono::NaiveDate;
    use image::{Rgb, RgbImage};

    const PATCH: u32 = 12;
    const CARD_AT: (u32, u32) = (60, 40);

    fn distort(c: u8) -> u8 {
        (0.8 * c as f64 + 12.0).round() as u8
    }

    /// A textured frame with a colour-shifted card pasted in.
    fn frame_with_card() -> RgbImage {
        let card = render_card(&DEFAULT_CARD_COLORS, PATCH);
        let mut frame = RgbImage::from_fn(200, 140, |x, y| {
            let v = ((x * 7 + y * 13) % 50 + 60) as u8;
            Rgb([v, v, v])
        });
        for (x, y, p) in card.enumerate_pixels() {
            frame.put_pixel(
                CARD_AT.0 + x,
                CARD_AT.1 + y,
                Rgb([distort(p[0]), distort(p[1]), distort(p[2])]),
            );
        }
        frame
    }

    fn image(pixels: RgbImage) -> TimestreamImage {
        let dt = NaiveDate::from_ymd_opt(2013, 10, 30).unwrap().and_hms_opt(12, 0, 0).unwrap();
        TimestreamImage::new(dt).with_pixels(pixels)
    }

    fn detector(dir: &std::path::Path) -> ColorCardDetect {
        render_card(&DEFAULT_CARD_COLORS, PATCH)
            .save(dir.join("card.png"))
            .unwrap();
        let ctx = ValidationContext::new("colorcarddetect", 0, dir)
            .with_argument("colorcardFile", "card.png")
            .with_argument(
                "colorcardPosition",
                serde_yml::from_str::<serde_yml::Value>("[96, 64]").unwrap(),
            )
            .with_argument("minIntensity", 20.0)
            .with_argument("pyramidLevels", 3);
        let mut stage = ColorCardDetect::default();
        stage.prepare(&ctx).unwrap();
        stage
    }

    fn corrector() -> ColorCorrect {
        let mut stage = ColorCorrect::default();
        let ctx = ValidationContext::new("colorcorrect", 1, "/tmp").with_argument("minIntensity", 20.0);
        stage.prepare(&ctx).unwrap();
        stage
    }

    fn run(stage: &mut dyn PipelineStage, inputs: Vec<Value>) -> Vec<Value> {
        let mut pipeline = PipelineContext::new(GeneralConfig::default(), "/tmp");
        let mut ctx = ExecutionContext::new(stage.metadata().id, inputs, &mut pipeline);
        stage.execute(&mut ctx).unwrap();
        ctx.take_outputs()
    }

    #[test]
    fn test_card_correction_within_tolerance() {
        let dir = tempfile::tempdir().unwrap();
        let mut detect = detector(dir.path());
        let outputs = run(&mut detect, vec![Value::Image(image(frame_with_card()))]);
        assert!(matches!(&outputs[1], Value::ColorParams(Some(_))));

        let mut corrected = run(&mut corrector(), outputs);
        let Some(Value::Image(mut img)) = corrected.pop() else {
            panic!("expected an image")
        };
        let px = img.pixels().unwrap();
        let samples = sample_card(&px, [CARD_AT.0, CARD_AT.1, 6 * PATCH, 4 * PATCH], false);
        for (got, want) in samples.medians.iter().zip(DEFAULT_CARD_COLORS.iter()) {
            for c in 0..3 {
                assert!((got[c] - want[c]).abs() <= 10.0, "{:?} vs {:?}", got, want);
            }
        }
    }

    #[test]
    fn test_dark_frame_passes_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut detect = detector(dir.path());
        let dark = RgbImage::from_fn(200, 140, |x, _| Rgb([(x % 10) as u8, 5, 5]));
        let outputs = run(&mut detect, vec![Value::Image(image(dark.clone()))]);
        assert!(matches!(&outputs[1], Value::ColorParams(None)));

        let mut out = run(&mut corrector(), outputs);
        let Some(Value::Image(mut img)) = out.pop() else {
            panic!("expected an image")
        };
        assert_eq!(*img.pixels().unwrap(), dark);

        // A transform is still not applied to a dark frame.
        let shift = ColorTransform {
            b: nalgebra::Vector3::new(50.0, 50.0, 50.0),
            ..ColorTransform::default()
        };
        let mut out = run(
            &mut corrector(),
            vec![Value::Image(image(dark.clone())), Value::ColorParams(Some(shift))],
        );
        let Some(Value::Image(mut img)) = out.pop() else {
            panic!("expected an image")
        };
        assert_eq!(*img.pixels().unwrap(), dark);
    }

    #[test]
    fn test_dark_frame_after_fit_has_no_params() {
        let dir = tempfile::tempdir().unwrap();
        let mut detect = detector(dir.path());
        let outputs = run(&mut detect, vec![Value::Image(image(frame_with_card()))]);
        assert!(matches!(&outputs[1], Value::ColorParams(Some(_))));

        let dark = RgbImage::from_pixel(200, 140, Rgb([3, 3, 3]));
        let outputs = run(&mut detect, vec![Value::Image(image(dark))]);
        assert!(matches!(&outputs[1], Value::ColorParams(None)));
    }

    #[test]
    fn test_true_colors_must_cover_card() {
        let dir = tempfile::tempdir().unwrap();
        render_card(&DEFAULT_CARD_COLORS, PATCH)
            .save(dir.path().join("card.png"))
            .unwrap();
        let ctx = ValidationContext::new("colorcarddetect", 0, dir.path())
            .with_argument("colorcardFile", "card.png")
            .with_argument(
                "colorcardPosition",
                serde_yml::from_str::<serde_yml::Value>("[96, 64]").unwrap(),
            )
            .with_argument(
                "colorcardTrueColors",
                serde_yml::from_str::<serde_yml::Value>("[[1, 2, 3], [4, 5, 6]]").unwrap(),
            )
            .with_argument("minIntensity", 20.0)
            .with_argument("pyramidLevels", 3);
        assert!(ColorCardDetect::default().prepare(&ctx).is_err());
    }
}
