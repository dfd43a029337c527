//! Plant/background segmentation of a single pot.
//!
//! The default segmenter clusters pixels in a three-channel feature space
//! (CIELAB a and b, plus a texture response) with two-class k-means, keeps
//! the smaller cluster as plant, closes small holes and rejects noisy
//! results by their spatial complexity.

use crate::core::error::PotResult;
use crate::geometry::pyramid::FloatImage;
use crate::pots::features::to_binary;
use image::{GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use palette::{FromColor, Lab, LinSrgb, Srgb};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;

/// Hints exchanged with a segmenter.
#[derive(Debug, Clone, Default)]
pub struct SegmentHints {
    /// Mask of the same pot in the previous frame.
    pub previous_mask: Option<GrayImage>,
    /// Complexity of the returned segmentation.
    pub complexity: Option<f64>,
    /// Whether the segmentation was rejected and replaced by a fallback.
    pub rejected: bool,
}

/// Pluggable plant/background classifier.
///
/// Masks are the size of the input image with values 0 (background) and 1
/// (plant).
pub trait Segmenter: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Segment a pot image.
    fn segment(&self, image: &RgbImage, hints: &SegmentHints) -> PotResult<(GrayImage, SegmentHints)>;
}

/// Copy `source` into the top-left corner of a zero mask of `(width,
/// height)`, cropping to the smaller dimension.
pub fn fit_mask(source: &GrayImage, width: u32, height: u32) -> GrayImage {
    let mut out = GrayImage::new(width, height);
    for y in 0..height.min(source.height()) {
        for x in 0..width.min(source.width()) {
            out.put_pixel(x, y, *source.get_pixel(x, y));
        }
    }
    out
}

/// Whether a mask has no foreground pixel.
pub fn is_empty_mask(mask: &GrayImage) -> bool {
    mask.pixels().all(|p| p[0] == 0)
}

// ============================================================================
// Complexity
// ============================================================================

/// Spatial complexity of a binary mask in `[0, 1]`.
///
/// For every pixel the foreground fraction `p` of its 5x5 neighbourhood
/// (clipped at the border) gives a binary Shannon entropy in bits; the score
/// is the mean over all pixels. Clean blobs score low, salt-and-pepper masks
/// approach 1.
pub fn mask_complexity(mask: &GrayImage) -> f64 {
    let (w, h) = mask.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }
    // Summed-area table over the 0/1 mask.
    let stride = w as usize + 1;
    let mut integral = vec![0u32; stride * (h as usize + 1)];
    for y in 0..h as usize {
        let mut row = 0u32;
        for x in 0..w as usize {
            row += (mask.get_pixel(x as u32, y as u32)[0] > 0) as u32;
            integral[(y + 1) * stride + x + 1] = integral[y * stride + x + 1] + row;
        }
    }

    let mut total = 0.0;
    for y in 0..h as usize {
        for x in 0..w as usize {
            let x0 = x.saturating_sub(2);
            let y0 = y.saturating_sub(2);
            let x1 = (x + 3).min(w as usize);
            let y1 = (y + 3).min(h as usize);
            let count = integral[y1 * stride + x1] + integral[y0 * stride + x0]
                - integral[y0 * stride + x1]
                - integral[y1 * stride + x0];
            let n = ((x1 - x0) * (y1 - y0)) as f64;
            let p = count as f64 / n;
            if p > 0.0 && p < 1.0 {
                total -= p * p.log2() + (1.0 - p) * (1.0 - p).log2();
            }
        }
    }
    total / (w as f64 * h as f64)
}

// ============================================================================
// K-means segmenter
// ============================================================================

/// Two-class k-means segmenter.
#[derive(Debug, Clone)]
pub struct KMeansSegmenter {
    /// Falloff of the texture response `exp(-alpha * |F1 + F2|)`.
    pub alpha: f64,
    pub max_iterations: usize,
    /// Stop when no centre moves further than this.
    pub epsilon: f64,
    /// Random restarts; the most compact clustering wins.
    pub attempts: usize,
    /// Complexity above which a segmentation is rejected.
    pub complexity_threshold: f64,
    pub seed: u64,
}

impl Default for KMeansSegmenter {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            max_iterations: 10,
            epsilon: 1.0,
            attempts: 10,
            complexity_threshold: 0.3,
            seed: 0x5eed,
        }
    }
}

const PILLBOX_RADIUS: i64 = 7;
const DOG_SIZE: usize = 17;
const DOG_SIGMA_HIGH: f64 = 4.0;
const DOG_SIGMA_LOW: f64 = 1.0;

fn gaussian_kernel(size: usize, sigma: f64) -> Vec<f32> {
    let half = (size / 2) as f64;
    let raw: Vec<f64> = (0..size)
        .map(|i| {
            let d = i as f64 - half;
            (-d * d / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.into_iter().map(|v| (v / sum) as f32).collect()
}

/// Mean over a disc of `radius`, reflecting at the border.
fn pillbox(img: &FloatImage, radius: i64) -> FloatImage {
    let (w, h) = (img.width() as i64, img.height() as i64);
    let offsets: Vec<(i64, i64)> = (-radius..=radius)
        .flat_map(|dy| (-radius..=radius).map(move |dx| (dx, dy)))
        .filter(|(dx, dy)| dx * dx + dy * dy <= radius * radius)
        .collect();
    let norm = offsets.len() as f32;
    let mut out = FloatImage::new(img.width(), img.height());
    for y in 0..h {
        for x in 0..w {
            let sum: f32 = offsets
                .iter()
                .map(|(dx, dy)| {
                    let sx = crate::geometry::pyramid::reflect(x + dx, w);
                    let sy = crate::geometry::pyramid::reflect(y + dy, h);
                    img.get(sx as u32, sy as u32)
                })
                .sum();
            out.set(x as u32, y as u32, sum / norm);
        }
    }
    out
}

fn normalise(values: &mut [f64]) {
    let (lo, hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let range = hi - lo;
    for v in values.iter_mut() {
        *v = if range > 0.0 { (*v - lo) / range } else { 0.0 };
    }
}

impl KMeansSegmenter {
    /// Per-pixel `[a, b, texture]` features.
    fn features(&self, image: &RgbImage) -> Vec<[f64; 3]> {
        let (w, h) = image.dimensions();
        let n = (w * h) as usize;
        let mut l = Vec::with_capacity(n);
        let mut a = Vec::with_capacity(n);
        let mut b = Vec::with_capacity(n);
        for p in image.pixels() {
            let srgb = Srgb::new(p[0] as f32 / 255.0, p[1] as f32 / 255.0, p[2] as f32 / 255.0);
            let lin: LinSrgb<f32> = srgb.into_linear();
            let lab: Lab = Lab::from_color(lin);
            l.push(lab.l);
            a.push(lab.a);
            b.push(lab.b);
        }

        let a_img = FloatImage::from_vec(w, h, a.clone());
        let l_img = FloatImage::from_vec(w, h, l);
        let texture: Vec<f64> = match (a_img, l_img) {
            (Some(a_img), Some(l_img)) => {
                let f1 = pillbox(&a_img, PILLBOX_RADIUS);
                let high = l_img.convolve_separable(&gaussian_kernel(DOG_SIZE, DOG_SIGMA_HIGH));
                let low = l_img.convolve_separable(&gaussian_kernel(DOG_SIZE, DOG_SIGMA_LOW));
                f1.data()
                    .iter()
                    .zip(high.data().iter().zip(low.data()))
                    .map(|(f1, (hi, lo))| (-self.alpha * (*f1 as f64 + (*hi - *lo) as f64).abs()).exp())
                    .collect()
            }
            _ => vec![0.0; n],
        };

        let mut a: Vec<f64> = a.into_iter().map(f64::from).collect();
        let mut b: Vec<f64> = b.into_iter().map(f64::from).collect();
        normalise(&mut a);
        normalise(&mut b);
        (0..n).map(|i| [a[i], b[i], texture[i]]).collect()
    }

    /// Labels (0/1) and compactness of the best of `attempts` runs.
    fn kmeans(&self, data: &[[f64; 3]]) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut best: Option<(f64, Vec<u8>)> = None;
        // Centres live in [0, 1] feature space; compare squared moves.
        let eps2 = (self.epsilon / 255.0).powi(2);

        for _ in 0..self.attempts.max(1) {
            let mut centers = [
                data[rng.gen_range(0..data.len())],
                data[rng.gen_range(0..data.len())],
            ];
            let mut labels = vec![0u8; data.len()];
            for _ in 0..self.max_iterations.max(1) {
                for (label, p) in labels.iter_mut().zip(data) {
                    *label = (dist2(p, &centers[1]) < dist2(p, &centers[0])) as u8;
                }
                let mut sums = [[0.0; 3]; 2];
                let mut counts = [0usize; 2];
                for (label, p) in labels.iter().zip(data) {
                    let k = *label as usize;
                    counts[k] += 1;
                    for c in 0..3 {
                        sums[k][c] += p[c];
                    }
                }
                let mut moved = 0.0f64;
                for k in 0..2 {
                    if counts[k] == 0 {
                        continue;
                    }
                    let next = sums[k].map(|s| s / counts[k] as f64);
                    moved = moved.max(dist2(&next, &centers[k]));
                    centers[k] = next;
                }
                if moved <= eps2 {
                    break;
                }
            }
            let compactness: f64 = labels
                .iter()
                .zip(data)
                .map(|(l, p)| dist2(p, &centers[*l as usize]))
                .sum();
            if best.as_ref().map_or(true, |(c, _)| compactness < *c) {
                best = Some((compactness, labels));
            }
        }
        best.map(|(_, l)| l).unwrap_or_else(|| vec![0; data.len()])
    }
}

fn dist2(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    (0..3).map(|i| (a[i] - b[i]).powi(2)).sum()
}

impl Segmenter for KMeansSegmenter {
    fn name(&self) -> &str {
        "kmeans"
    }

    fn segment(&self, image: &RgbImage, hints: &SegmentHints) -> PotResult<(GrayImage, SegmentHints)> {
        let (w, h) = image.dimensions();
        let mut out_hints = SegmentHints {
            previous_mask: None,
            complexity: None,
            rejected: false,
        };
        if w == 0 || h == 0 {
            return Ok((GrayImage::new(w, h), out_hints));
        }

        let data = self.features(image);
        let mut labels = self.kmeans(&data);
        let ones = labels.iter().filter(|l| **l == 1).count();
        // Plant is the smaller cluster and carries label 1.
        if ones * 2 > labels.len() {
            for l in labels.iter_mut() {
                *l = 1 - *l;
            }
        }

        let raw = GrayImage::from_raw(w, h, labels).unwrap_or_else(|| GrayImage::new(w, h));
        let closed = imageproc::morphology::close(&to_binary(&raw), Norm::L1, 1);
        let mask = GrayImage::from_fn(w, h, |x, y| Luma([(closed.get_pixel(x, y)[0] > 0) as u8]));

        let complexity = mask_complexity(&mask);
        out_hints.complexity = Some(complexity);
        if complexity > self.complexity_threshold {
            out_hints.rejected = true;
            let fallback = match &hints.previous_mask {
                Some(prev) => fit_mask(prev, w, h),
                None => GrayImage::new(w, h),
            };
            log::debug!(
                "segmentation rejected, complexity {:.3} > {:.3}",
                complexity,
                self.complexity_threshold
            );
            return Ok((fallback, out_hints));
        }
        Ok((mask, out_hints))
    }
}
