//! Plant extraction and feature computation.

use super::{frame_pixels, POT_MATRIX_KEY};
use crate::core::context::{ExecutionContext, FrameArtifact, PipelineContext, ValidationContext};
use crate::core::error::{StageError, ValidationError};
use crate::core::node::{Category, PipelineStage, StageMetadata};
use crate::core::port::{ArgType, Constraint, ParameterDefinition};
use crate::core::types::{PortType, Value};
use crate::execution::workers::{segment_parallel, SegmentJob};
use crate::pots::{
    features, traypos_to_chamber_index, KMeansSegmenter, MetaValue, PotHandler, PotMatrix, PotRect, Segmenter,
};
use crate::stages::registry::StageRegistry;
use serde_yml::Value as YamlValue;
use std::sync::Arc;

/// Register analysis stages.
pub fn register(registry: &mut StageRegistry) {
    registry.register(|| Box::new(PlantExtract::default()));
    registry.register(|| Box::new(FeatureExtract::default()));
}

fn meta_value(value: &YamlValue) -> Option<MetaValue> {
    match value {
        YamlValue::String(s) => Some(MetaValue::Str(s.clone())),
        YamlValue::Number(n) => n.as_f64().map(MetaValue::Num),
        YamlValue::Bool(b) => Some(MetaValue::Str(b.to_string())),
        _ => None,
    }
}

/// Attach `general.metas` entries, keyed by pot id or tray position.
fn attach_metas(pipeline: &PipelineContext, matrix: &mut PotMatrix) {
    for (meta, entries) in &pipeline.general.metas {
        for (key, value) in entries {
            let id = match key.parse::<u32>() {
                Ok(id) => id,
                Err(_) => match traypos_to_chamber_index(key) {
                    Ok(id) => id,
                    Err(e) => {
                        log::warn!("metas.{}: {}", meta, e);
                        continue;
                    }
                },
            };
            let (Some(pot), Some(value)) = (matrix.get_mut(id), meta_value(value)) else {
                continue;
            };
            pot.set_metadata(meta.clone(), value);
        }
    }
}

// ============================================================================
// Plant extraction
// ============================================================================

/// Builds the frame's pot matrix, segments every pot and returns the frame
/// with everything but the plants blacked out.
#[derive(Debug, Default)]
pub struct PlantExtract {
    segmenter: Option<Arc<dyn Segmenter>>,
    parallel: bool,
    workers: usize,
}

impl PlantExtract {
    fn segment_in_workers(&self, matrix: &mut PotMatrix, segmenter: Arc<dyn Segmenter>) -> Result<(), StageError> {
        let image = matrix
            .image()
            .cloned()
            .ok_or_else(|| StageError::failed("plantextract", "pot matrix has no image"))?;
        let jobs: Vec<SegmentJob> = matrix
            .iter()
            .filter(|pot| pot.cached_mask().is_none())
            .map(|pot| SegmentJob {
                id: pot.id(),
                image: pot.image(&image),
                previous: matrix
                    .previous()
                    .and_then(|m| m.get(pot.id()))
                    .and_then(|p| p.cached_mask())
                    .cloned(),
            })
            .collect();
        for outcome in segment_parallel(segmenter, jobs, self.workers) {
            let id = outcome.id;
            let Some(pot) = matrix.get_mut(id) else { continue };
            match outcome.into_mask().map(|mask| pot.set_mask(mask).map_err(|e| e.to_string())) {
                Ok(Ok(())) => {}
                Ok(Err(reason)) | Err(reason) => {
                    log::warn!("pot {}: segmentation failed: {}", id, reason);
                    pot.set_failed(reason);
                }
            }
        }
        Ok(())
    }
}

impl PipelineStage for PlantExtract {
    fn metadata(&self) -> StageMetadata {
        StageMetadata::builder("plantextract")
            .category(Category::Analyze)
            .description("Segment the plant in every pot")
            .expects(&[PortType::Image, PortType::PotLocations])
            .returns(&[PortType::Image, PortType::PotMatrix])
            .parameter(
                ParameterDefinition::new("segmenter", ArgType::String, "kmeans")
                    .with_description("Segmentation method")
                    .with_constraint(Constraint::OneOf(vec!["kmeans".into()])),
            )
            .parameter(
                ParameterDefinition::new("alpha", ArgType::Float, 1.0)
                    .with_description("Texture falloff")
                    .with_constraint(Constraint::Positive),
            )
            .parameter(
                ParameterDefinition::new("maxIterations", ArgType::Integer, 10)
                    .with_description("K-means iteration limit")
                    .with_constraint(Constraint::Positive),
            )
            .parameter(
                ParameterDefinition::new("epsilon", ArgType::Float, 1.0)
                    .with_description("K-means convergence distance")
                    .with_constraint(Constraint::NonNegative),
            )
            .parameter(
                ParameterDefinition::new("attempts", ArgType::Integer, 10)
                    .with_description("K-means restarts")
                    .with_constraint(Constraint::Positive),
            )
            .parameter(
                ParameterDefinition::new("complexityThreshold", ArgType::Float, 0.3)
                    .with_description("Masks more complex than this are replaced by the previous frame's"),
            )
            .parameter(
                ParameterDefinition::new("parallel", ArgType::Boolean, false)
                    .with_description("Segment pots on a worker pool"),
            )
            .parameter(
                ParameterDefinition::new("workers", ArgType::Integer, 0)
                    .with_description("Worker threads (0 for one per core)")
                    .with_constraint(Constraint::NonNegative),
            )
            .build()
    }

    fn prepare(&mut self, ctx: &ValidationContext) -> Result<(), ValidationError> {
        let segmenter = match ctx.get_str("segmenter")? {
            "kmeans" => KMeansSegmenter {
                alpha: ctx.get_f64("alpha")?,
                max_iterations: ctx.get_usize("maxIterations")?,
                epsilon: ctx.get_f64("epsilon")?,
                attempts: ctx.get_usize("attempts")?,
                complexity_threshold: ctx.get_f64("complexityThreshold")?,
                ..KMeansSegmenter::default()
            },
            other => return Err(ctx.preparation_error(format!("unknown segmenter '{}'", other))),
        };
        self.segmenter = Some(Arc::new(segmenter));
        self.parallel = ctx.get_bool("parallel")?;
        self.workers = ctx.get_usize("workers")?;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), StageError> {
        let mut image = ctx.take_image()?;
        let locations = ctx.take_pots()?;
        let pixels = frame_pixels(ctx, &mut image)?;
        let segmenter = self
            .segmenter
            .clone()
            .ok_or_else(|| StageError::failed(&ctx.stage, "stage was not prepared"))?;

        let mut matrix = PotMatrix::new(Arc::clone(&pixels), Some(image.datetime()));
        for loc in &locations {
            let grow = (loc.size.0 as f64 / 2.0, loc.size.1 as f64 / 2.0);
            let added = PotRect::from_center(loc.center, grow, matrix.image_size()).and_then(|rect| {
                matrix.add_pot(PotHandler::new(loc.id, rect).with_segmenter(Arc::clone(&segmenter)))
            });
            if let Err(e) = added {
                log::warn!("{}: skipping pot {}: {}", image.timestamp_string(), loc.id, e);
            }
        }
        if let Some(previous) = ctx.pipeline.running_pot_matrix.take() {
            matrix.set_previous(previous);
        }
        attach_metas(ctx.pipeline, &mut matrix);

        if self.parallel {
            self.segment_in_workers(&mut matrix, segmenter)?;
        } else {
            let failures = matrix
                .segment_all()
                .map_err(|e| StageError::failed(&ctx.stage, e.to_string()))?;
            for e in failures {
                log::warn!("{}: {}", image.timestamp_string(), e);
            }
        }

        let composite = matrix
            .masked_image()
            .map_err(|e| StageError::failed(&ctx.stage, e.to_string()))?;
        image.set_pixels(composite);
        log::debug!("{}: extracted {} pots", image.timestamp_string(), matrix.len());

        ctx.pipeline.running_pot_matrix = Some(matrix.clone());
        ctx.pipeline
            .output_with_image
            .insert(POT_MATRIX_KEY.to_string(), FrameArtifact::PotMatrix(matrix.clone()));
        ctx.push_output(Value::Image(image));
        ctx.push_output(Value::PotMatrix(matrix));
        Ok(())
    }
}

// ============================================================================
// Feature extraction
// ============================================================================

/// Computes the requested features on every pot.
#[derive(Debug, Default)]
pub struct FeatureExtract {
    features: Vec<String>,
}

impl PipelineStage for FeatureExtract {
    fn metadata(&self) -> StageMetadata {
        StageMetadata::builder("featureextract")
            .category(Category::Analyze)
            .description("Compute plant features for every pot")
            .expects(&[PortType::Image, PortType::PotMatrix])
            .returns(&[PortType::Image, PortType::PotMatrix])
            .parameter(
                ParameterDefinition::new(
                    "features",
                    ArgType::StringList,
                    YamlValue::Sequence(vec![YamlValue::from("all")]),
                )
                .with_description("Feature names, or 'all'"),
            )
            .build()
    }

    fn prepare(&mut self, ctx: &ValidationContext) -> Result<(), ValidationError> {
        let requested = ctx.get_strings("features")?;
        self.features = features::resolve_names(&requested).map_err(|e| ctx.preparation_error(e))?;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), StageError> {
        let image = ctx.take_image()?;
        let mut matrix = ctx.take_pot_matrix()?;
        matrix
            .calc_features(&self.features)
            .map_err(|e| StageError::failed(&ctx.stage, e.to_string()))?;

        ctx.pipeline.running_pot_matrix = Some(matrix.clone());
        ctx.pipeline
            .output_with_image
            .insert(POT_MATRIX_KEY.to_string(), FrameArtifact::PotMatrix(matrix.clone()));
        ctx.push_output(Value::Image(image));
        ctx.push_output(Value::PotMatrix(matrix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeneralConfig;
    use crate::core::types::PotLocation;
    use crate::timestream::TimestreamImage;
    use chrono::NaiveDate;
    use image::{Rgb, RgbImage};
    use indexmap::IndexMap;

    /// Two 60 x 60 pots of brown soil, each with a green square plant.
    fn frame(hour: u32) -> TimestreamImage {
        let pixels = RgbImage::from_fn(120, 60, |x, y| {
            let lx = x % 60;
            if (20..40).contains(&lx) && (20..40).contains(&y) {
                Rgb([40, 160, 40])
            } else {
                Rgb([120, 90, 60])
            }
        });
        let dt = NaiveDate::from_ymd_opt(2013, 10, 30).unwrap().and_hms_opt(hour, 0, 0).unwrap();
        TimestreamImage::new(dt).with_pixels(pixels)
    }

    fn locations() -> Vec<PotLocation> {
        [(1, 30.0), (2, 90.0), (3, 118.0)]
            .into_iter()
            .map(|(id, x)| PotLocation {
                id,
                tray: 0,
                center: (x, 30.0),
                size: (60, 60),
                score: 1.0,
            })
            .collect()
    }

    fn extractor(parallel: bool) -> PlantExtract {
        let mut stage = PlantExtract::default();
        let mut ctx = ValidationContext::new("plantextract", 0, "/tmp");
        for p in stage.metadata().parameters {
            ctx.add_argument(p.name.clone(), p.default_value.clone().unwrap_or(YamlValue::Null));
        }
        ctx.add_argument("parallel", YamlValue::Bool(parallel));
        stage.prepare(&ctx).unwrap();
        stage
    }

    fn extract(stage: &mut PlantExtract, pipeline: &mut PipelineContext, hour: u32) -> (TimestreamImage, PotMatrix) {
        let mut ctx = ExecutionContext::new(
            "plantextract",
            vec![Value::Image(frame(hour)), Value::Pots(locations())],
            pipeline,
        );
        stage.execute(&mut ctx).unwrap();
        let mut out = ctx.take_outputs().into_iter();
        match (out.next(), out.next()) {
            (Some(Value::Image(img)), Some(Value::PotMatrix(m))) => (img, m),
            other => panic!("unexpected outputs {:?}", other),
        }
    }

    #[test]
    fn test_extracts_plants() {
        let mut pipeline = PipelineContext::new(GeneralConfig::default(), "/tmp");
        let mut stage = extractor(false);
        let (mut img, matrix) = extract(&mut stage, &mut pipeline, 1);

        // The third pot overflows the frame and is skipped.
        assert_eq!(matrix.ids().collect::<Vec<_>>(), vec![1, 2]);
        for pot in matrix.iter() {
            let mask = pot.cached_mask().unwrap();
            assert_eq!(mask.dimensions(), (60, 60));
            assert_eq!(mask.get_pixel(30, 30)[0], 1);
            assert_eq!(mask.get_pixel(2, 2)[0], 0);
        }
        let composite = img.pixels().unwrap();
        assert_eq!(composite.get_pixel(30, 30), &Rgb([40, 160, 40]));
        assert_eq!(composite.get_pixel(5, 5), &Rgb([0, 0, 0]));

        assert!(pipeline.running_pot_matrix.is_some());
        assert!(pipeline.output_with_image.contains_key(POT_MATRIX_KEY));
        assert_eq!(matrix.depth(), 0);

        let (_, next) = extract(&mut stage, &mut pipeline, 2);
        assert_eq!(next.depth(), 1);
        let (_, third) = extract(&mut stage, &mut pipeline, 3);
        assert_eq!(third.depth(), 1);
    }

    #[test]
    fn test_parallel_matches_serial() {
        let mut serial_ctx = PipelineContext::new(GeneralConfig::default(), "/tmp");
        let mut parallel_ctx = PipelineContext::new(GeneralConfig::default(), "/tmp");
        let (_, serial) = extract(&mut extractor(false), &mut serial_ctx, 1);
        let (_, parallel) = extract(&mut extractor(true), &mut parallel_ctx, 1);
        for (a, b) in serial.iter().zip(parallel.iter()) {
            assert_eq!(a.id(), b.id());
            assert_eq!(a.cached_mask(), b.cached_mask());
        }
    }

    #[test]
    fn test_metas_attached() {
        let mut general = GeneralConfig::default();
        let mut genotype = IndexMap::new();
        genotype.insert("1".to_string(), YamlValue::from("Col-0"));
        genotype.insert("1A2".to_string(), YamlValue::from("Ler"));
        genotype.insert("bogus".to_string(), YamlValue::from("x"));
        general.metas.insert("genotype".to_string(), genotype);
        let mut age = IndexMap::new();
        age.insert("2".to_string(), YamlValue::from(14));
        general.metas.insert("age".to_string(), age);

        let mut pipeline = PipelineContext::new(general, "/tmp");
        let (_, matrix) = extract(&mut extractor(false), &mut pipeline, 1);
        let pot1 = matrix.get(1).unwrap();
        assert_eq!(pot1.metadata()["genotype"], MetaValue::Str("Col-0".into()));
        let pot2 = matrix.get(2).unwrap();
        assert_eq!(pot2.metadata()["genotype"], MetaValue::Str("Ler".into()));
        assert_eq!(pot2.metadata()["age"], MetaValue::Num(14.0));
    }

    #[test]
    fn test_feature_extract() {
        let mut pipeline = PipelineContext::new(GeneralConfig::default(), "/tmp");
        let (img, matrix) = extract(&mut extractor(false), &mut pipeline, 1);

        let mut stage = FeatureExtract::default();
        let vctx = ValidationContext::new("featureextract", 1, "/tmp")
            .with_argument("features", serde_yml::from_str::<YamlValue>("[area, height]").unwrap());
        stage.prepare(&vctx).unwrap();
        let mut ctx = ExecutionContext::new(
            "featureextract",
            vec![Value::Image(img), Value::PotMatrix(matrix)],
            &mut pipeline,
        );
        stage.execute(&mut ctx).unwrap();
        let out = ctx.take_outputs();
        let Some(Value::PotMatrix(m)) = out.get(1) else {
            panic!("expected a pot matrix")
        };
        let names: Vec<String> = m.feature_names().into_iter().collect();
        assert_eq!(names, vec!["area", "height"]);
        let area = m.get(1).unwrap().features()["area"].as_f64();
        assert!((350.0..=450.0).contains(&area), "area {}", area);

        let bad = ValidationContext::new("featureextract", 1, "/tmp")
            .with_argument("features", serde_yml::from_str::<YamlValue>("[leafiness]").unwrap());
        assert!(FeatureExtract::default().prepare(&bad).is_err());
    }
}
