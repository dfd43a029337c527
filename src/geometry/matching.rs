//! Multi-scale template matching by normalised cross-correlation.
//!
//! The template is first searched exhaustively on the coarsest common pyramid
//! level, inside a window around an optional estimate. When the orientation
//! probe is enabled the template turned by 180 degrees is tried as well and
//! wins only with a strictly better score. The best position is then refined
//! level by level with a small local search.

use crate::geometry::pyramid::{FloatImage, ImagePyramid};
use rayon::prelude::*;

/// Scores below this are reported as low confidence.
pub const LOW_CONFIDENCE: f64 = 0.3;

/// Search settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchParams {
    /// Estimated template centre in full-resolution pixels.
    pub estimate: Option<(f64, f64)>,
    /// Half size of the search window around the estimate, full resolution.
    pub window: Option<(f64, f64)>,
    /// Half size of the local search at each finer level.
    pub refine_radius: i64,
    /// Whether to also try the template turned by 180 degrees.
    pub probe_rotation: bool,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            estimate: None,
            window: None,
            refine_radius: 3,
            probe_rotation: false,
        }
    }
}

impl MatchParams {
    /// Search around an estimate.
    pub fn around(center: (f64, f64), half_window: (f64, f64)) -> Self {
        Self {
            estimate: Some(center),
            window: Some(half_window),
            ..Self::default()
        }
    }

    /// Enable the 0/180 degree probe.
    pub fn with_rotation_probe(mut self) -> Self {
        self.probe_rotation = true;
        self
    }
}

/// Outcome of a pyramid match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    /// Top-left corner of the match in full-resolution pixels.
    pub top_left: (i64, i64),
    /// Centre of the match in full-resolution pixels.
    pub center: (f64, f64),
    /// Normalised cross-correlation at full resolution.
    pub score: f64,
    /// Whether the 180 degree template won the probe.
    pub rotated: bool,
    /// Score below [`LOW_CONFIDENCE`].
    pub low_confidence: bool,
}

/// Template prepared for fast correlation.
struct Prepared<'t> {
    template: &'t FloatImage,
    /// Template minus its mean.
    centered: Vec<f32>,
    norm: f64,
}

impl<'t> Prepared<'t> {
    fn new(template: &'t FloatImage) -> Self {
        let n = template.data().len().max(1) as f64;
        let mean = template.data().iter().map(|v| *v as f64).sum::<f64>() / n;
        let centered: Vec<f32> = template.data().iter().map(|v| (*v as f64 - mean) as f32).collect();
        let norm = centered.iter().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt();
        Self {
            template,
            centered,
            norm,
        }
    }

    /// Zero-mean NCC with the template's top-left at `(x, y)`.
    fn score(&self, image: &FloatImage, x: i64, y: i64) -> Option<f64> {
        let (tw, th) = (self.template.width() as i64, self.template.height() as i64);
        if x < 0 || y < 0 || x + tw > image.width() as i64 || y + th > image.height() as i64 {
            return None;
        }
        let iw = image.width() as usize;
        let data = image.data();
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        let mut cross = 0.0f64;
        for row in 0..th as usize {
            let start = (y as usize + row) * iw + x as usize;
            let src = &data[start..start + tw as usize];
            let tpl = &self.centered[row * tw as usize..(row + 1) * tw as usize];
            for (i, t) in src.iter().zip(tpl) {
                let i = *i as f64;
                sum += i;
                sum_sq += i * i;
                cross += i * *t as f64;
            }
        }
        let n = (tw * th) as f64;
        let var = sum_sq - sum * sum / n;
        let denom = var.max(0.0).sqrt() * self.norm;
        if denom < 1e-9 {
            return Some(0.0);
        }
        Some(cross / denom)
    }

    /// Best position within an inclusive range of top-left corners.
    fn search(&self, image: &FloatImage, xs: (i64, i64), ys: (i64, i64)) -> Option<((i64, i64), f64)> {
        let max_x = image.width() as i64 - self.template.width() as i64;
        let max_y = image.height() as i64 - self.template.height() as i64;
        if max_x < 0 || max_y < 0 {
            return None;
        }
        let (x0, x1) = (xs.0.clamp(0, max_x), xs.1.clamp(0, max_x));
        let (y0, y1) = (ys.0.clamp(0, max_y), ys.1.clamp(0, max_y));
        (y0..=y1)
            .into_par_iter()
            .filter_map(|y| {
                (x0..=x1)
                    .filter_map(|x| self.score(image, x, y).map(|s| ((x, y), s)))
                    .fold(None, |best: Option<((i64, i64), f64)>, cand| match best {
                        Some(b) if b.1 >= cand.1 => Some(b),
                        _ => Some(cand),
                    })
            })
            .reduce_with(|a, b| {
                // Ties resolve to the earlier row so results are deterministic.
                if b.1 > a.1 || (b.1 == a.1 && b.0 .1 < a.0 .1) {
                    b
                } else {
                    a
                }
            })
    }
}

/// NCC of a template placed with its top-left corner at `(x, y)`.
pub fn ncc(image: &FloatImage, template: &FloatImage, x: i64, y: i64) -> Option<f64> {
    Prepared::new(template).score(image, x, y)
}

/// Locate a template pyramid in an image pyramid.
///
/// Returns `None` when the template does not fit inside the image at any
/// level.
pub fn match_template(
    image: &ImagePyramid,
    template: &ImagePyramid,
    params: &MatchParams,
) -> Option<MatchResult> {
    let top = image.levels().min(template.levels()).checked_sub(1)?;
    let scale = (1u64 << top) as f64;
    let img_top = image.level(top)?;
    let tpl_top = template.level(top)?;

    let (tw, th) = (tpl_top.width() as f64, tpl_top.height() as f64);
    let (xs, ys) = match (params.estimate, params.window) {
        (Some((cx, cy)), window) => {
            let (wx, wy) = window.unwrap_or((img_top.width() as f64 * scale, img_top.height() as f64 * scale));
            let ex = cx / scale - tw / 2.0;
            let ey = cy / scale - th / 2.0;
            let (wx, wy) = (wx / scale, wy / scale);
            (
                ((ex - wx).floor() as i64, (ex + wx).ceil() as i64),
                ((ey - wy).floor() as i64, (ey + wy).ceil() as i64),
            )
        }
        (None, _) => ((0, i64::MAX), (0, i64::MAX)),
    };

    let upright = Prepared::new(tpl_top);
    let mut best = upright.search(img_top, xs, ys)?;
    let mut rotated = false;
    if params.probe_rotation {
        let turned = tpl_top.rotated_180();
        if let Some(cand) = Prepared::new(&turned).search(img_top, xs, ys) {
            if cand.1 > best.1 {
                best = cand;
                rotated = true;
            }
        }
    }
    if best.1 < LOW_CONFIDENCE {
        log::debug!("coarse match scored {:.3} at level {}", best.1, top);
    }

    let r = params.refine_radius.max(0);
    for level in (0..top).rev() {
        let img = image.level(level)?;
        let tpl_level = template.level(level)?;
        let turned;
        let tpl = if rotated {
            turned = tpl_level.rotated_180();
            &turned
        } else {
            tpl_level
        };
        let prepared = Prepared::new(tpl);
        let (px, py) = (best.0 .0 * 2, best.0 .1 * 2);
        best = prepared.search(img, (px - r, px + r), (py - r, py + r))?;
    }

    let tpl0 = template.level(0)?;
    let (x, y) = best.0;
    Some(MatchResult {
        top_left: (x, y),
        center: (
            x as f64 + tpl0.width() as f64 / 2.0,
            y as f64 + tpl0.height() as f64 / 2.0,
        ),
        score: best.1,
        rotated,
        low_confidence: best.1 < LOW_CONFIDENCE,
    })
}
