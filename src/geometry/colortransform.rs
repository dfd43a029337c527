//! Colour-transform estimation and application.
//!
//! The model maps a captured colour `p` to `255 * ((M p + b) / 255)^γ`
//! per channel. Parameters are fitted to card samples with
//! Levenberg-Marquardt, starting from the affine least-squares solution
//! with `γ = 1`.

use image::RgbImage;
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use rayon::prelude::*;

const N_PARAMS: usize = 15;
const MIN_GAMMA: f64 = 0.05;

/// Affine colour mixing followed by per-channel gamma.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorTransform {
    pub m: Matrix3<f64>,
    pub b: Vector3<f64>,
    pub gamma: Vector3<f64>,
}

impl Default for ColorTransform {
    fn default() -> Self {
        Self {
            m: Matrix3::identity(),
            b: Vector3::zeros(),
            gamma: Vector3::new(1.0, 1.0, 1.0),
        }
    }
}

impl ColorTransform {
    /// Map one colour (components in 0..=255, result not clamped above).
    pub fn apply_color(&self, p: [f64; 3]) -> [f64; 3] {
        let v = self.m * Vector3::new(p[0], p[1], p[2]) + self.b;
        let mut out = [0.0; 3];
        for c in 0..3 {
            let x = (v[c] / 255.0).max(0.0);
            out[c] = 255.0 * x.powf(self.gamma[c]);
        }
        out
    }

    /// Apply to every pixel, clamping to the 8-bit range.
    pub fn apply(&self, img: &RgbImage) -> RgbImage {
        let (w, h) = img.dimensions();
        let mut buf = img.as_raw().clone();
        buf.par_chunks_mut(3).for_each(|px| {
            let out = self.apply_color([px[0] as f64, px[1] as f64, px[2] as f64]);
            for c in 0..3 {
                px[c] = out[c].round().clamp(0.0, 255.0) as u8;
            }
        });
        RgbImage::from_raw(w, h, buf).unwrap_or_else(|| img.clone())
    }

    /// Flatten as `[m (row-major), b, gamma]`.
    pub fn to_params(&self) -> [f64; N_PARAMS] {
        let mut p = [0.0; N_PARAMS];
        for r in 0..3 {
            for c in 0..3 {
                p[r * 3 + c] = self.m[(r, c)];
            }
            p[9 + r] = self.b[r];
            p[12 + r] = self.gamma[r];
        }
        p
    }

    /// Inverse of [`to_params`](Self::to_params).
    pub fn from_params(p: &[f64]) -> Self {
        let get = |i: usize| p.get(i).copied().unwrap_or(0.0);
        Self {
            m: Matrix3::from_fn(|r, c| get(r * 3 + c)),
            b: Vector3::new(get(9), get(10), get(11)),
            gamma: Vector3::new(
                get(12).max(MIN_GAMMA),
                get(13).max(MIN_GAMMA),
                get(14).max(MIN_GAMMA),
            ),
        }
    }

    /// Fit a transform mapping `captured` onto `reference`.
    ///
    /// Returns `None` with fewer than five samples or when the normal
    /// equations are singular.
    pub fn fit(captured: &[[f64; 3]], reference: &[[f64; 3]]) -> Option<Self> {
        let n = captured.len().min(reference.len());
        if n < 5 {
            return None;
        }
        let init = fit_affine(&captured[..n], &reference[..n])?;
        Some(levenberg_marquardt(init, &captured[..n], &reference[..n]))
    }

    /// Root-mean-square error on a sample set.
    pub fn rms_error(&self, captured: &[[f64; 3]], reference: &[[f64; 3]]) -> f64 {
        let r = residuals(self, captured, reference);
        if r.is_empty() {
            return 0.0;
        }
        (r.iter().map(|v| v * v).sum::<f64>() / r.len() as f64).sqrt()
    }
}

fn fit_affine(captured: &[[f64; 3]], reference: &[[f64; 3]]) -> Option<ColorTransform> {
    let n = captured.len();
    let a = DMatrix::from_fn(n, 4, |i, j| if j < 3 { captured[i][j] } else { 1.0 });
    let svd = a.svd(true, true);
    let mut out = ColorTransform::default();
    for c in 0..3 {
        let t = DVector::from_fn(n, |i, _| reference[i][c]);
        let x = svd.solve(&t, 1e-9).ok()?;
        for j in 0..3 {
            out.m[(c, j)] = x[j];
        }
        out.b[c] = x[3];
    }
    Some(out)
}

fn residuals(t: &ColorTransform, captured: &[[f64; 3]], reference: &[[f64; 3]]) -> Vec<f64> {
    captured
        .iter()
        .zip(reference)
        .flat_map(|(c, r)| {
            let out = t.apply_color(*c);
            [out[0] - r[0], out[1] - r[1], out[2] - r[2]]
        })
        .collect()
}

fn levenberg_marquardt(
    init: ColorTransform,
    captured: &[[f64; 3]],
    reference: &[[f64; 3]],
) -> ColorTransform {
    let mut params = DVector::from_row_slice(&init.to_params());
    let cost_of = |p: &DVector<f64>| {
        residuals(&ColorTransform::from_params(p.as_slice()), captured, reference)
            .iter()
            .map(|v| v * v)
            .sum::<f64>()
    };
    let mut cost = cost_of(&params);
    let mut lambda = 1e-3;

    for _ in 0..200 {
        let r0 = DVector::from_vec(residuals(
            &ColorTransform::from_params(params.as_slice()),
            captured,
            reference,
        ));
        let mut jac = DMatrix::zeros(r0.len(), N_PARAMS);
        for k in 0..N_PARAMS {
            let step = 1e-6 * params[k].abs().max(1.0);
            let mut plus = params.clone();
            plus[k] += step;
            let mut minus = params.clone();
            minus[k] -= step;
            let rp = residuals(&ColorTransform::from_params(plus.as_slice()), captured, reference);
            let rm = residuals(&ColorTransform::from_params(minus.as_slice()), captured, reference);
            for i in 0..r0.len() {
                jac[(i, k)] = (rp[i] - rm[i]) / (2.0 * step);
            }
        }

        let jtj = jac.transpose() * &jac;
        let jtr = jac.transpose() * &r0;
        let mut improved = false;
        while lambda < 1e12 {
            let mut a = jtj.clone();
            for k in 0..N_PARAMS {
                a[(k, k)] += lambda * jtj[(k, k)].max(1e-9);
            }
            let Some(delta) = a.lu().solve(&(-&jtr)) else {
                lambda *= 10.0;
                continue;
            };
            let candidate = &params + &delta;
            let new_cost = cost_of(&candidate);
            if new_cost < cost {
                let gain = cost - new_cost;
                params = candidate;
                cost = new_cost;
                lambda = (lambda / 10.0).max(1e-12);
                improved = gain > 1e-12 * cost.max(1.0);
                break;
            }
            lambda *= 10.0;
        }
        if !improved {
            break;
        }
    }
    ColorTransform::from_params(params.as_slice())
}
