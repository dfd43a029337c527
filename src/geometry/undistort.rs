//! Lens undistortion and right-angle rotation.
//!
//! The camera model is a pinhole matrix K with Brown-Conrady radial and
//! tangential distortion `(k1, k2, p1, p2, k3)`. For every pixel of the
//! rectified frame the map stores where to sample the distorted frame; the
//! remap itself is bicubic.

use image::{imageops, Rgb, RgbImage};
use nalgebra::Matrix3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Brown-Conrady radial-tangential distortion coefficients.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    /// Build from `[k1, k2, p1, p2, k3]`; shorter lists are zero-padded.
    pub fn from_slice(coefs: &[f64]) -> Self {
        let c = |i: usize| coefs.get(i).copied().unwrap_or(0.0);
        Self {
            k1: c(0),
            k2: c(1),
            p1: c(2),
            p2: c(3),
            k3: c(4),
        }
    }

    /// Apply distortion to normalised coordinates.
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;
        let x_tan = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let y_tan = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (x * radial + x_tan, y * radial + y_tan)
    }
}

/// Per-pixel source coordinates for rectifying a distorted frame.
#[derive(Debug, Clone, PartialEq)]
pub struct UndistortMaps {
    width: u32,
    height: u32,
    map_x: Vec<f32>,
    map_y: Vec<f32>,
}

impl UndistortMaps {
    /// Precompute the maps for a target size.
    pub fn new(camera: &Matrix3<f64>, distortion: Distortion, size: (u32, u32)) -> Self {
        let (width, height) = size;
        let fx = camera[(0, 0)];
        let fy = camera[(1, 1)];
        let skew = camera[(0, 1)];
        let cx = camera[(0, 2)];
        let cy = camera[(1, 2)];

        let n = width as usize * height as usize;
        let mut map_x = vec![0f32; n];
        let mut map_y = vec![0f32; n];
        map_x
            .par_chunks_mut(width.max(1) as usize)
            .zip(map_y.par_chunks_mut(width.max(1) as usize))
            .enumerate()
            .for_each(|(v, (row_x, row_y))| {
                let yn = (v as f64 - cy) / fy;
                for (u, (mx, my)) in row_x.iter_mut().zip(row_y.iter_mut()).enumerate() {
                    let xn = (u as f64 - cx - skew * yn) / fx;
                    let (xd, yd) = distortion.distort(xn, yn);
                    *mx = (fx * xd + skew * yd + cx) as f32;
                    *my = (fy * yd + cy) as f32;
                }
            });

        Self {
            width,
            height,
            map_x,
            map_y,
        }
    }

    /// Target size.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Source coordinate for a target pixel.
    pub fn source(&self, x: u32, y: u32) -> (f32, f32) {
        let i = y as usize * self.width as usize + x as usize;
        (self.map_x[i], self.map_y[i])
    }

    /// Remap an image; samples outside the source are black.
    pub fn remap(&self, src: &RgbImage) -> RgbImage {
        let width = self.width as usize;
        let mut buf = vec![0u8; width * self.height as usize * 3];
        if width == 0 {
            return RgbImage::new(self.width, self.height);
        }
        buf.par_chunks_mut(width * 3).enumerate().for_each(|(y, row)| {
            for x in 0..width {
                let i = y * width + x;
                let px = sample_bicubic(src, self.map_x[i], self.map_y[i]);
                row[x * 3..x * 3 + 3].copy_from_slice(&px.0);
            }
        });
        RgbImage::from_raw(self.width, self.height, buf)
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }
}

const CUBIC_A: f32 = -0.75;

fn cubic_weights(t: f32) -> [f32; 4] {
    let w = |d: f32| {
        let d = d.abs();
        if d <= 1.0 {
            ((CUBIC_A + 2.0) * d - (CUBIC_A + 3.0)) * d * d + 1.0
        } else if d < 2.0 {
            ((CUBIC_A * d - 5.0 * CUBIC_A) * d + 8.0 * CUBIC_A) * d - 4.0 * CUBIC_A
        } else {
            0.0
        }
    };
    [w(1.0 + t), w(t), w(1.0 - t), w(2.0 - t)]
}

/// Bicubic sample at a sub-pixel position.
pub fn sample_bicubic(src: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = (src.width() as i64, src.height() as i64);
    if !(x.is_finite() && y.is_finite()) || x < -1.0 || y < -1.0 || x > w as f32 || y > h as f32 {
        return Rgb([0, 0, 0]);
    }
    let x0 = x.floor();
    let y0 = y.floor();
    let wx = cubic_weights(x - x0);
    let wy = cubic_weights(y - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);

    let mut acc = [0f32; 3];
    for (j, wyj) in wy.iter().enumerate() {
        let sy = y0 - 1 + j as i64;
        if sy < 0 || sy >= h {
            continue;
        }
        for (i, wxi) in wx.iter().enumerate() {
            let sx = x0 - 1 + i as i64;
            if sx < 0 || sx >= w {
                continue;
            }
            let p = src.get_pixel(sx as u32, sy as u32);
            let weight = wxi * wyj;
            for c in 0..3 {
                acc[c] += weight * p[c] as f32;
            }
        }
    }
    Rgb([
        acc[0].round().clamp(0.0, 255.0) as u8,
        acc[1].round().clamp(0.0, 255.0) as u8,
        acc[2].round().clamp(0.0, 255.0) as u8,
    ])
}

/// A counter-clockwise rotation by a multiple of 90 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    None,
    Ccw90,
    Ccw180,
    Ccw270,
}

impl Rotation {
    /// Parse an angle in degrees; only multiples of 90 are accepted.
    pub fn from_degrees(degrees: i64) -> Option<Self> {
        if degrees % 90 != 0 {
            return None;
        }
        Some(match degrees.rem_euclid(360) {
            0 => Rotation::None,
            90 => Rotation::Ccw90,
            180 => Rotation::Ccw180,
            _ => Rotation::Ccw270,
        })
    }

    /// Rotate an image.
    pub fn apply(&self, img: &RgbImage) -> RgbImage {
        match self {
            Rotation::None => img.clone(),
            Rotation::Ccw90 => imageops::rotate270(img),
            Rotation::Ccw180 => imageops::rotate180(img),
            Rotation::Ccw270 => imageops::rotate90(img),
        }
    }

    /// Compose with another rotation.
    pub fn then(self, other: Rotation) -> Rotation {
        let deg = |r: Rotation| match r {
            Rotation::None => 0,
            Rotation::Ccw90 => 90,
            Rotation::Ccw180 => 180,
            Rotation::Ccw270 => 270,
        };
        Rotation::from_degrees(deg(self) + deg(other)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x * 7 % 256) as u8, (y * 11 % 256) as u8, ((x + y) % 256) as u8]))
    }

    fn camera(w: u32, h: u32) -> Matrix3<f64> {
        Matrix3::new(100.0, 0.0, w as f64 / 2.0, 0.0, 100.0, h as f64 / 2.0, 0.0, 0.0, 1.0)
    }

    #[test]
    fn test_zero_distortion_is_identity() {
        let img = gradient(32, 24);
        let maps = UndistortMaps::new(&camera(32, 24), Distortion::default(), (32, 24));
        assert_eq!(maps.source(5, 7), (5.0, 7.0));
        assert_eq!(maps.remap(&img), img);
    }

    #[test]
    fn test_maps_are_deterministic() {
        let d = Distortion::from_slice(&[-0.2, 0.05, 0.001, -0.001, 0.0]);
        let a = UndistortMaps::new(&camera(40, 30), d, (40, 30));
        let b = UndistortMaps::new(&camera(40, 30), d, (40, 30));
        assert_eq!(a, b);
        let img = gradient(40, 30);
        assert_eq!(a.remap(&img), b.remap(&img));
        // The principal point does not move.
        assert_eq!(a.source(20, 15), (20.0, 15.0));
    }

    #[test]
    fn test_barrel_pulls_corners_inward() {
        let d = Distortion::from_slice(&[-0.3]);
        let maps = UndistortMaps::new(&camera(200, 200), d, (200, 200));
        let (sx, sy) = maps.source(0, 0);
        assert!(sx > 0.0 && sy > 0.0);
    }

    #[test]
    fn test_rotation() {
        assert_eq!(Rotation::from_degrees(-90), Some(Rotation::Ccw270));
        assert_eq!(Rotation::from_degrees(45), None);
        assert_eq!(Rotation::Ccw90.then(Rotation::Ccw270), Rotation::None);

        let img = gradient(4, 2);
        let rotated = Rotation::Ccw90.apply(&img);
        assert_eq!(rotated.dimensions(), (2, 4));
        // Top-right corner moves to top-left.
        assert_eq!(rotated.get_pixel(0, 0), img.get_pixel(3, 0));
        let twice = Rotation::Ccw90.apply(&rotated);
        assert_eq!(twice, Rotation::Ccw180.apply(&img));
    }
}
