//! Grayscale float images and Gaussian pyramids.

use image::RgbImage;
use rayon::prelude::*;

/// A single-channel f32 image.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatImage {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl FloatImage {
    /// A zero-filled image.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width as usize * height as usize],
        }
    }

    /// Wrap a row-major buffer. Returns `None` when the length is wrong.
    pub fn from_vec(width: u32, height: u32, data: Vec<f32>) -> Option<Self> {
        (data.len() == width as usize * height as usize).then_some(Self { width, height, data })
    }

    /// Luma of an RGB image (BT.601 weights).
    pub fn from_rgb(img: &RgbImage) -> Self {
        let data = img
            .pixels()
            .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
            .collect();
        Self {
            width: img.width(),
            height: img.height(),
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, v: f32) {
        let w = self.width as usize;
        self.data[y as usize * w + x as usize] = v;
    }

    /// The image turned by 180 degrees.
    pub fn rotated_180(&self) -> Self {
        let mut data = self.data.clone();
        data.reverse();
        Self {
            width: self.width,
            height: self.height,
            data,
        }
    }

    /// Copy a sub-rectangle; `None` when it leaves the image.
    pub fn crop(&self, x: u32, y: u32, w: u32, h: u32) -> Option<Self> {
        if x.checked_add(w)? > self.width || y.checked_add(h)? > self.height {
            return None;
        }
        let mut data = Vec::with_capacity(w as usize * h as usize);
        for row in y..y + h {
            let start = row as usize * self.width as usize + x as usize;
            data.extend_from_slice(&self.data[start..start + w as usize]);
        }
        Some(Self { width: w, height: h, data })
    }

    /// Separable convolution with reflected borders.
    pub fn convolve_separable(&self, kernel: &[f32]) -> Self {
        let r = (kernel.len() / 2) as i64;
        let (w, h) = (self.width as i64, self.height as i64);
        if w == 0 || h == 0 {
            return self.clone();
        }

        let mut tmp = vec![0f32; self.data.len()];
        tmp.par_chunks_mut(w as usize).enumerate().for_each(|(y, row)| {
            let src = &self.data[y * w as usize..(y + 1) * w as usize];
            for (x, out) in row.iter_mut().enumerate() {
                let mut acc = 0.0;
                for (k, kv) in kernel.iter().enumerate() {
                    let sx = reflect(x as i64 + k as i64 - r, w);
                    acc += kv * src[sx as usize];
                }
                *out = acc;
            }
        });

        let mut out = vec![0f32; self.data.len()];
        out.par_chunks_mut(w as usize).enumerate().for_each(|(y, row)| {
            for (x, o) in row.iter_mut().enumerate() {
                let mut acc = 0.0;
                for (k, kv) in kernel.iter().enumerate() {
                    let sy = reflect(y as i64 + k as i64 - r, h);
                    acc += kv * tmp[sy as usize * w as usize + x];
                }
                *o = acc;
            }
        });

        Self {
            width: self.width,
            height: self.height,
            data: out,
        }
    }

    /// Low-pass and decimate by two.
    pub fn pyr_down(&self) -> Self {
        let blurred = self.convolve_separable(&PYR_KERNEL);
        let w = self.width.div_ceil(2);
        let h = self.height.div_ceil(2);
        let mut out = FloatImage::new(w, h);
        for y in 0..h {
            for x in 0..w {
                out.set(x, y, blurred.get(x * 2, y * 2));
            }
        }
        out
    }
}

/// Reflect-101 border handling.
pub(crate) fn reflect(i: i64, n: i64) -> i64 {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let m = i.rem_euclid(period);
    if m < n {
        m
    } else {
        period - m
    }
}

const PYR_KERNEL: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];

/// A Gaussian pyramid; level 0 is full resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePyramid {
    levels: Vec<FloatImage>,
}

impl ImagePyramid {
    /// Build `levels` levels, stopping early when an image gets smaller
    /// than `min_size` on either side.
    pub fn build(base: FloatImage, levels: usize, min_size: u32) -> Self {
        let mut out = vec![base];
        while out.len() < levels.max(1) {
            let last = &out[out.len() - 1];
            if last.width().div_ceil(2) < min_size || last.height().div_ceil(2) < min_size {
                break;
            }
            let next = last.pyr_down();
            out.push(next);
        }
        Self { levels: out }
    }

    /// Build from an RGB image.
    pub fn from_rgb(img: &RgbImage, levels: usize) -> Self {
        Self::build(FloatImage::from_rgb(img), levels, 4)
    }

    pub fn levels(&self) -> usize {
        self.levels.len()
    }

    /// Get one level.
    pub fn level(&self, i: usize) -> Option<&FloatImage> {
        self.levels.get(i)
    }

    /// Coarsest level.
    pub fn top(&self) -> &FloatImage {
        &self.levels[self.levels.len() - 1]
    }
}
