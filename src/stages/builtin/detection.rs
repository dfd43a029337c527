//! Tray and pot detection by pyramid template matching.

use super::{frame_pixels, load_reference, read_reference};
use crate::core::context::{ExecutionContext, ValidationContext};
use crate::core::data::DataValue;
use crate::core::error::{StageError, ValidationError};
use crate::core::node::{Category, PipelineStage, StageMetadata};
use crate::core::port::{ArgType, Constraint, ParameterDefinition};
use crate::core::types::{PortType, PotLocation, TrayLocation, Value};
use crate::geometry::colorcard::median_of;
use crate::geometry::matching::{match_template, MatchParams};
use crate::geometry::pyramid::{FloatImage, ImagePyramid};
use crate::geometry::rectangle::snap_rect_inward;
use crate::pots::{POTS_PER_TRAY, TRAY_COLUMNS, TRAY_ROWS};
use crate::stages::registry::StageRegistry;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Register detection stages.
pub fn register(registry: &mut StageRegistry) {
    registry.register(|| Box::new(TrayDetect::default()));
    registry.register(|| Box::new(PotDetect::default()));
}

fn pyramid_levels_parameter() -> ParameterDefinition {
    ParameterDefinition::new("pyramidLevels", ArgType::Integer, 4)
        .with_description("Pyramid depth used for matching")
        .with_range(1.0, 8.0)
}

fn point(p: (f64, f64)) -> DataValue {
    DataValue::List(vec![p.0.into(), p.1.into()])
}

// ============================================================================
// Tray detection
// ============================================================================

struct TrayTemplate {
    pyramid: ImagePyramid,
    size: (u32, u32),
    position: (f64, f64),
}

/// Locates every tray template in the frame.
///
/// A tray scoring below `minScore` makes the frame unusable: tray and pot
/// identities could no longer be trusted.
pub struct TrayDetect {
    templates: Vec<TrayTemplate>,
    min_score: f64,
    radius: Option<(f64, f64)>,
    levels: usize,
}

impl Default for TrayDetect {
    fn default() -> Self {
        Self {
            templates: Vec::new(),
            min_score: 0.3,
            radius: None,
            levels: 4,
        }
    }
}

/// Expand glob patterns in a list of template paths, keeping order.
fn expand_paths(ctx: &ValidationContext, name: &str) -> Result<Vec<PathBuf>, ValidationError> {
    let mut out = Vec::new();
    for raw in ctx.get_strings(name)? {
        if raw.contains(['*', '?', '[']) {
            let pattern = ctx.resolve(&raw);
            let mut matched: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
                .map_err(|e| ctx.preparation_error(format!("bad pattern '{}': {}", raw, e)))?
                .filter_map(Result::ok)
                .collect();
            if matched.is_empty() {
                return Err(ValidationError::ResourceNotFound {
                    stage: ctx.stage.clone(),
                    resource: pattern.display().to_string(),
                });
            }
            matched.sort();
            out.extend(matched);
        } else {
            out.push(ctx.resolve(&raw));
        }
    }
    Ok(out)
}

impl PipelineStage for TrayDetect {
    fn metadata(&self) -> StageMetadata {
        StageMetadata::builder("traydetect")
            .category(Category::Detection)
            .description("Locate trays by matching their templates")
            .expects(&[PortType::Image])
            .returns(&[PortType::Image, PortType::Pyramid, PortType::TrayLocations])
            .parameter(
                ParameterDefinition::required("trayFiles", ArgType::StringList)
                    .with_description("Tray template images (glob patterns allowed)")
                    .with_constraint(Constraint::NotEmpty),
            )
            .parameter(
                ParameterDefinition::required("trayPositions", ArgType::PointList)
                    .with_description("Estimated tray centres [x, y], one per template"),
            )
            .parameter(
                ParameterDefinition::new("minScore", ArgType::Float, 0.3)
                    .with_description("Lowest acceptable match score")
                    .with_range(0.0, 1.0),
            )
            .parameter(
                ParameterDefinition::optional("searchRadius", ArgType::Point)
                    .with_description("Half size of the search window; defaults to the tray size"),
            )
            .parameter(pyramid_levels_parameter())
            .build()
    }

    fn prepare(&mut self, ctx: &ValidationContext) -> Result<(), ValidationError> {
        self.min_score = ctx.get_f64("minScore")?;
        self.levels = ctx.get_usize("pyramidLevels")?;
        self.radius = if ctx.has("searchRadius") {
            Some(ctx.get_point("searchRadius")?)
        } else {
            None
        };
        let paths = expand_paths(ctx, "trayFiles")?;
        let positions = ctx.get_points("trayPositions")?;
        if paths.len() != positions.len() {
            return Err(ctx.preparation_error(format!(
                "{} tray templates but {} tray positions",
                paths.len(),
                positions.len()
            )));
        }
        self.templates = paths
            .iter()
            .zip(positions)
            .map(|(path, position)| {
                let img = read_reference(ctx, path)?;
                Ok(TrayTemplate {
                    size: img.dimensions(),
                    pyramid: ImagePyramid::from_rgb(&img, self.levels),
                    position,
                })
            })
            .collect::<Result<_, ValidationError>>()?;
        log::debug!("loaded {} tray templates", self.templates.len());
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), StageError> {
        let mut image = ctx.take_image()?;
        let pixels = frame_pixels(ctx, &mut image)?;
        let frame = ImagePyramid::from_rgb(&pixels, self.levels);

        let mut trays = Vec::with_capacity(self.templates.len());
        for (index, tpl) in self.templates.iter().enumerate() {
            let window = self
                .radius
                .unwrap_or((tpl.size.0 as f64, tpl.size.1 as f64));
            let params = MatchParams::around(tpl.position, window).with_rotation_probe();
            let found = match_template(&frame, &tpl.pyramid, &params);
            let score = found.map(|m| m.score).unwrap_or(0.0);
            let Some(m) = found.filter(|_| score >= self.min_score) else {
                return Err(StageError::fatal(
                    &ctx.stage,
                    format!("tray {} scored {:.3}, below {}", index, score, self.min_score),
                ));
            };
            log::debug!(
                "tray {} at ({:.0}, {:.0}) score {:.3}{}",
                index,
                m.center.0,
                m.center.1,
                m.score,
                if m.rotated { " (rotated)" } else { "" }
            );
            trays.push(TrayLocation {
                index,
                center: m.center,
                size: tpl.size,
                score: m.score,
                rotated: m.rotated,
            });
        }

        let records = trays
            .iter()
            .map(|t| {
                let mut map = IndexMap::new();
                map.insert("index".to_string(), DataValue::Int(t.index as i64));
                map.insert("center".to_string(), point(t.center));
                map.insert("score".to_string(), t.score.into());
                map.insert("rotated".to_string(), DataValue::Bool(t.rotated));
                map.insert(
                    "corners".to_string(),
                    DataValue::List(t.corners().into_iter().map(point).collect()),
                );
                DataValue::Map(map)
            })
            .collect();
        image
            .metadata
            .insert("trayLocations".to_string(), DataValue::List(records));

        ctx.push_output(Value::Image(image));
        ctx.push_output(Value::Pyramid(Arc::new(frame)));
        ctx.push_output(Value::Trays(trays));
        Ok(())
    }
}

// ============================================================================
// Pot detection
// ============================================================================

/// Places a 4 x 5 grid of pots in every tray.
///
/// With a pot template each grid cell is matched around its estimate and the
/// whole tray is shifted by the median offset of the confident matches, so a
/// single bad match cannot move a pot.
#[derive(Default)]
pub struct PotDetect {
    template: Option<(ImagePyramid, (u32, u32))>,
    pot_size: Option<(u32, u32)>,
    snap_inset: u32,
}

/// Grid cell centre of `(row, col)` in an upright tray.
fn cell_center(tray: &TrayLocation, row: usize, col: usize) -> (f64, f64) {
    let (x0, y0) = tray.top_left();
    let cw = tray.size.0 as f64 / TRAY_COLUMNS as f64;
    let ch = tray.size.1 as f64 / TRAY_ROWS as f64;
    (x0 + (col as f64 + 0.5) * cw, y0 + (row as f64 + 0.5) * ch)
}

/// Tighten a pot rectangle onto the strongest intensity steps within
/// `inset` pixels of its sides.
fn snap_pot(gray: &FloatImage, pot: &PotLocation, inset: u32) -> PotLocation {
    let (w, h) = pot.size;
    let x0 = (pot.center.0 - w as f64 / 2.0).round().max(0.0) as u32;
    let y0 = (pot.center.1 - h as f64 / 2.0).round().max(0.0) as u32;
    let [x0, y0, x1, y1] = snap_rect_inward(gray, [x0, y0, x0 + w, y0 + h], inset);
    if x1 <= x0 || y1 <= y0 {
        return *pot;
    }
    PotLocation {
        center: ((x0 + x1) as f64 / 2.0, (y0 + y1) as f64 / 2.0),
        size: (x1 - x0, y1 - y0),
        ..*pot
    }
}

/// Chamber-wide id of a grid cell; a rotated tray numbers its pots from the
/// opposite corner.
fn pot_id(tray: &TrayLocation, cell: usize) -> u32 {
    let cell = if tray.rotated {
        POTS_PER_TRAY - 1 - cell
    } else {
        cell
    };
    (tray.index * POTS_PER_TRAY + cell + 1) as u32
}

impl PotDetect {
    fn detect_tray(&self, pyramid: &ImagePyramid, tray: &TrayLocation) -> (Vec<PotLocation>, usize) {
        let cell_size = (
            tray.size.0 / TRAY_COLUMNS as u32,
            tray.size.1 / TRAY_ROWS as u32,
        );
        let estimates: Vec<(f64, f64)> = (0..TRAY_ROWS)
            .flat_map(|r| (0..TRAY_COLUMNS).map(move |c| (r, c)))
            .map(|(r, c)| cell_center(tray, r, c))
            .collect();

        let mut scores = vec![tray.score; estimates.len()];
        let mut offset = (0.0, 0.0);
        let mut confident = 0;
        let size = match &self.template {
            Some((tpl, tpl_size)) => {
                let half = (cell_size.0 as f64 / 2.0, cell_size.1 as f64 / 2.0);
                let mut dx = Vec::new();
                let mut dy = Vec::new();
                for (i, est) in estimates.iter().enumerate() {
                    if let Some(m) = match_template(pyramid, tpl, &MatchParams::around(*est, half)) {
                        scores[i] = m.score;
                        if !m.low_confidence {
                            dx.push(m.center.0 - est.0);
                            dy.push(m.center.1 - est.1);
                        }
                    }
                }
                confident = dx.len();
                if confident > 0 {
                    offset = (median_of(&mut dx), median_of(&mut dy));
                }
                self.pot_size.unwrap_or(*tpl_size)
            }
            None => self.pot_size.unwrap_or(cell_size),
        };

        let pots = estimates
            .iter()
            .enumerate()
            .map(|(cell, est)| PotLocation {
                id: pot_id(tray, cell),
                tray: tray.index,
                center: (est.0 + offset.0, est.1 + offset.1),
                size,
                score: scores[cell],
            })
            .collect();
        (pots, confident)
    }

    /// Save an overlay of the detected pots under `<output>/visualise/`.
    fn save_overlay(ctx: &ExecutionContext<'_>, pixels: &RgbImage, pots: &[PotLocation], stamp: &str) {
        let mut overlay = pixels.clone();
        for pot in pots {
            let (w, h) = pot.size;
            let x = (pot.center.0 - w as f64 / 2.0).round() as i32;
            let y = (pot.center.1 - h as f64 / 2.0).round() as i32;
            if w > 0 && h > 0 {
                draw_hollow_rect_mut(&mut overlay, Rect::at(x, y).of_size(w, h), Rgb([255, 0, 0]));
            }
        }
        let dir = ctx.pipeline.output_root().join("visualise");
        let path = dir.join(format!("{}potdetect_{}.png", ctx.pipeline.output_prefix(), stamp));
        if let Err(e) = std::fs::create_dir_all(&dir).map_err(|e| e.to_string()).and_then(|_| {
            overlay.save(&path).map_err(|e| e.to_string())
        }) {
            log::warn!("cannot write {}: {}", path.display(), e);
        }
    }
}

impl PipelineStage for PotDetect {
    fn metadata(&self) -> StageMetadata {
        StageMetadata::builder("potdetect")
            .category(Category::Detection)
            .description("Locate the pots of every tray")
            .expects(&[PortType::Image, PortType::Pyramid, PortType::TrayLocations])
            .returns(&[PortType::Image, PortType::PotLocations])
            .parameter(
                ParameterDefinition::optional("potFile", ArgType::Path)
                    .with_description("Pot template image; without it pots sit on the tray grid"),
            )
            .parameter(
                ParameterDefinition::optional("potSize", ArgType::Point)
                    .with_description("Pot rectangle size [w, h]; defaults to the template or grid cell"),
            )
            .parameter(
                ParameterDefinition::new("snapInset", ArgType::Integer, 0)
                    .with_description("Move pot sides inward by up to this many pixels onto edges (0 disables)")
                    .with_constraint(Constraint::NonNegative),
            )
            .parameter(pyramid_levels_parameter())
            .build()
    }

    fn prepare(&mut self, ctx: &ValidationContext) -> Result<(), ValidationError> {
        self.snap_inset = ctx.get_usize("snapInset")? as u32;
        self.template = if ctx.has("potFile") {
            let img = load_reference(ctx, "potFile")?;
            let levels = ctx.get_usize("pyramidLevels")?;
            Some((ImagePyramid::from_rgb(&img, levels), img.dimensions()))
        } else {
            None
        };
        self.pot_size = if ctx.has("potSize") {
            let (w, h) = ctx.get_point("potSize")?;
            if w < 1.0 || h < 1.0 {
                return Err(ctx.preparation_error("potSize must be positive"));
            }
            Some((w as u32, h as u32))
        } else {
            None
        };
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), StageError> {
        let mut image = ctx.take_image()?;
        let pyramid = ctx.take_pyramid()?;
        let trays = ctx.take_trays()?;

        let mut pots = Vec::with_capacity(trays.len() * POTS_PER_TRAY);
        let mut confident = 0;
        for tray in &trays {
            let (found, n) = self.detect_tray(&pyramid, tray);
            confident += n;
            pots.extend(found);
        }
        if self.template.is_some() && !trays.is_empty() && confident == 0 {
            return Err(StageError::low_score(&ctx.stage, "no pot matched its template"));
        }
        if self.snap_inset > 0 {
            if let Some(base) = pyramid.level(0) {
                for pot in &mut pots {
                    *pot = snap_pot(base, pot, self.snap_inset);
                }
            }
        }
        log::debug!("{} pots in {} trays", pots.len(), trays.len());

        if ctx.pipeline.general.visualise {
            let pixels = frame_pixels(ctx, &mut image)?;
            Self::save_overlay(ctx, &pixels, &pots, &image.timestamp_string());
        }

        let records = pots
            .iter()
            .map(|p| {
                let mut map = IndexMap::new();
                map.insert("id".to_string(), DataValue::Int(p.id as i64));
                map.insert("tray".to_string(), DataValue::Int(p.tray as i64));
                map.insert("center".to_string(), point(p.center));
                map.insert("score".to_string(), p.score.into());
                DataValue::Map(map)
            })
            .collect();
        image
            .metadata
            .insert("potLocations".to_string(), DataValue::List(records));

        ctx.push_output(Value::Image(image));
        ctx.push_output(Value::Pots(pots));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeneralConfig;
    use crate::core::context::PipelineContext;
    use crate::core::error::FrameErrorKind;
    use crate::timestream::TimestreamImage;
    use chrono::NaiveDate;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_yml::Value as YamlValue;

    fn yaml(s: &str) -> YamlValue {
        serde_yml::from_str(s).unwrap()
    }

    fn blocky(w: u32, h: u32, seed: u64) -> RgbImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let bw = w.div_ceil(4);
        let blocks: Vec<[u8; 3]> = (0..bw * h.div_ceil(4)).map(|_| rng.gen()).collect();
        RgbImage::from_fn(w, h, |x, y| Rgb(blocks[((y / 4) * bw + x / 4) as usize]))
    }

    fn paste(dst: &mut RgbImage, src: &RgbImage, x0: u32, y0: u32) {
        for (x, y, p) in src.enumerate_pixels() {
            dst.put_pixel(x0 + x, y0 + y, *p);
        }
    }

    fn frame(pixels: RgbImage) -> TimestreamImage {
        let dt = NaiveDate::from_ymd_opt(2013, 10, 30).unwrap().and_hms_opt(12, 0, 0).unwrap();
        TimestreamImage::new(dt).with_pixels(pixels)
    }

    fn run(stage: &mut dyn PipelineStage, inputs: Vec<Value>) -> Result<Vec<Value>, StageError> {
        let mut pipeline = PipelineContext::new(GeneralConfig::default(), "/tmp");
        let mut ctx = ExecutionContext::new(stage.metadata().id, inputs, &mut pipeline);
        stage.execute(&mut ctx)?;
        Ok(ctx.take_outputs())
    }

    fn tray_detector(dir: &std::path::Path) -> TrayDetect {
        blocky(96, 64, 1).save(dir.join("tray_0.png")).unwrap();
        blocky(96, 64, 2).save(dir.join("tray_1.png")).unwrap();
        let ctx = ValidationContext::new("traydetect", 0, dir)
            .with_argument("trayFiles", yaml("['tray_*.png']"))
            .with_argument("trayPositions", yaml("[[60, 60], [196, 52]]"))
            .with_argument("minScore", 0.3)
            .with_argument("searchRadius", yaml("[24, 16]"))
            .with_argument("pyramidLevels", 3);
        let mut stage = TrayDetect::default();
        stage.prepare(&ctx).unwrap();
        stage
    }

    #[test]
    fn test_trays_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut stage = tray_detector(dir.path());
        let mut img = blocky(256, 112, 99);
        paste(&mut img, &blocky(96, 64, 1), 16, 24);
        paste(&mut img, &blocky(96, 64, 2), 144, 24);

        let out = run(&mut stage, vec![Value::Image(frame(img))]).unwrap();
        assert_eq!(out.len(), 3);
        let Value::Trays(trays) = &out[2] else {
            panic!("expected trays")
        };
        assert_eq!(trays.len(), 2);
        assert!(trays.iter().all(|t| t.score >= 0.3 && !t.rotated));
        assert_eq!(trays[0].top_left(), (16.0, 24.0));
        assert_eq!(trays[1].top_left(), (144.0, 24.0));
        let Value::Image(img) = &out[0] else {
            panic!("expected an image")
        };
        assert_eq!(
            img.metadata["trayLocations"].as_list().map(|l| l.len()),
            Some(2)
        );
        let corners: Vec<(f64, f64)> = img.metadata["trayLocations"].as_list().unwrap()[0]
            .get("corners")
            .and_then(|c| c.as_list())
            .unwrap()
            .iter()
            .map(|p| {
                let xy = p.as_list().unwrap();
                (xy[0].as_f64().unwrap(), xy[1].as_f64().unwrap())
            })
            .collect();
        let expected = [(16.0, 24.0), (16.0, 88.0), (112.0, 88.0), (112.0, 24.0)];
        for (got, want) in corners.iter().zip(expected) {
            assert!((got.0 - want.0).abs() < 1e-6 && (got.1 - want.1).abs() < 1e-6, "{:?}", corners);
        }
    }

    #[test]
    fn test_missing_tray_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut stage = tray_detector(dir.path());
        let mut img = blocky(256, 112, 99);
        paste(&mut img, &blocky(96, 64, 1), 16, 24);

        let err = run(&mut stage, vec![Value::Image(frame(img))]).unwrap_err();
        assert_eq!(err.kind, FrameErrorKind::Fatal);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_template_count_must_match_positions() {
        let dir = tempfile::tempdir().unwrap();
        blocky(96, 64, 1).save(dir.path().join("tray_0.png")).unwrap();
        let ctx = ValidationContext::new("traydetect", 0, dir.path())
            .with_argument("trayFiles", yaml("['tray_0.png']"))
            .with_argument("trayPositions", yaml("[[60, 60], [196, 52]]"))
            .with_argument("minScore", 0.3)
            .with_argument("pyramidLevels", 3);
        assert!(TrayDetect::default().prepare(&ctx).is_err());
    }

    fn tray(rotated: bool) -> TrayLocation {
        TrayLocation {
            index: 1,
            center: (66.0, 64.0),
            size: (100, 80),
            score: 0.9,
            rotated,
        }
    }

    #[test]
    fn test_grid_without_template() {
        let img = RgbImage::new(140, 120);
        let pyramid = Arc::new(ImagePyramid::from_rgb(&img, 1));
        let mut stage = PotDetect::default();
        let out = run(
            &mut stage,
            vec![
                Value::Image(frame(img.clone())),
                Value::Pyramid(pyramid.clone()),
                Value::Trays(vec![tray(false)]),
            ],
        )
        .unwrap();
        let Value::Pots(pots) = &out[1] else {
            panic!("expected pots")
        };
        assert_eq!(pots.len(), 20);
        assert_eq!(pots[0].id, 21);
        assert_eq!(pots[0].center, (26.0, 34.0));
        assert_eq!(pots[0].size, (20, 20));
        assert_eq!(pots[19].id, 40);

        let out = run(
            &mut stage,
            vec![
                Value::Image(frame(img)),
                Value::Pyramid(pyramid),
                Value::Trays(vec![tray(true)]),
            ],
        )
        .unwrap();
        let Value::Pots(pots) = &out[1] else {
            panic!("expected pots")
        };
        let first = pots.iter().find(|p| p.id == 21).unwrap();
        assert_eq!(first.center, (106.0, 94.0));
    }

    #[test]
    fn test_snap_tightens_pot_onto_edges() {
        // Dark 12 x 12 plant area inside the first 20 x 20 grid cell.
        let mut img = RgbImage::from_pixel(140, 120, Rgb([220, 220, 220]));
        for y in 28..40 {
            for x in 20..32 {
                img.put_pixel(x, y, Rgb([40, 30, 20]));
            }
        }
        let pyramid = Arc::new(ImagePyramid::from_rgb(&img, 1));
        let mut stage = PotDetect::default();
        stage
            .prepare(&ValidationContext::new("potdetect", 0, "/tmp").with_argument("snapInset", 4))
            .unwrap();
        let out = run(
            &mut stage,
            vec![Value::Image(frame(img)), Value::Pyramid(pyramid), Value::Trays(vec![tray(false)])],
        )
        .unwrap();
        let Value::Pots(pots) = &out[1] else {
            panic!("expected pots")
        };
        assert_eq!(pots[0].center, (26.0, 34.0));
        assert_eq!(pots[0].size, (14, 14));
        // Flat cells have no edge to snap to.
        assert_eq!(pots[1].size, (20, 20));
    }

    fn pot_template() -> RgbImage {
        RgbImage::from_fn(16, 16, |x, y| {
            if (4..12).contains(&x) && (4..12).contains(&y) {
                Rgb([40, 30, 20])
            } else {
                Rgb([220, 220, 220])
            }
        })
    }

    fn pot_detector(dir: &std::path::Path) -> PotDetect {
        pot_template().save(dir.join("pot.png")).unwrap();
        let ctx = ValidationContext::new("potdetect", 0, dir)
            .with_argument("potFile", "pot.png")
            .with_argument("pyramidLevels", 1);
        let mut stage = PotDetect::default();
        stage.prepare(&ctx).unwrap();
        stage
    }

    #[test]
    fn test_median_offset_moves_whole_tray() {
        let dir = tempfile::tempdir().unwrap();
        let mut stage = pot_detector(dir.path());
        let t = tray(false);
        let mut img = RgbImage::from_pixel(140, 120, Rgb([220, 220, 220]));
        for r in 0..TRAY_ROWS {
            for c in 0..TRAY_COLUMNS {
                let (cx, cy) = cell_center(&t, r, c);
                // Shifted by (3, 2); one pot is missing altogether.
                if (r, c) != (2, 2) {
                    paste(&mut img, &pot_template(), cx as u32 - 8 + 3, cy as u32 - 8 + 2);
                }
            }
        }
        let pyramid = Arc::new(ImagePyramid::from_rgb(&img, 1));
        let out = run(
            &mut stage,
            vec![Value::Image(frame(img)), Value::Pyramid(pyramid), Value::Trays(vec![t])],
        )
        .unwrap();
        let Value::Pots(pots) = &out[1] else {
            panic!("expected pots")
        };
        assert_eq!(pots[0].center, (29.0, 36.0));
        assert_eq!(pots[12].center, (69.0, 76.0));
        assert_eq!(pots[0].size, (16, 16));
    }

    #[test]
    fn test_no_confident_pot_is_low_score() {
        let dir = tempfile::tempdir().unwrap();
        let mut stage = pot_detector(dir.path());
        let img = RgbImage::from_pixel(140, 120, Rgb([220, 220, 220]));
        let pyramid = Arc::new(ImagePyramid::from_rgb(&img, 1));
        let err = run(
            &mut stage,
            vec![Value::Image(frame(img)), Value::Pyramid(pyramid), Value::Trays(vec![tray(false)])],
        )
        .unwrap_err();
        assert_eq!(err.kind, FrameErrorKind::LowScore);
    }
}
