//! Validated pot rectangles.

use crate::core::error::{PotError, PotResult};
use image::{GenericImageView, GrayImage, RgbImage};

/// Axis-aligned rectangle `[x0, y0, x1, y1]` inside an image.
///
/// Always satisfies `0 <= x0 < x1 <= width` and `0 <= y0 < y1 <= height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PotRect {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
    image_width: u32,
    image_height: u32,
}

impl PotRect {
    /// Validate coordinates against an image of `(width, height)`.
    pub fn new(coords: [i64; 4], image_size: (u32, u32)) -> PotResult<Self> {
        let [x0, y0, x1, y1] = coords;
        let (width, height) = image_size;
        let fits = 0 <= x0 && x0 < x1 && x1 <= width as i64 && 0 <= y0 && y0 < y1 && y1 <= height as i64;
        if !fits {
            return Err(PotError::RectangleOverflow {
                x0,
                y0,
                x1,
                y1,
                width,
                height,
            });
        }
        Ok(Self {
            x0: x0 as u32,
            y0: y0 as u32,
            x1: x1 as u32,
            y1: y1 as u32,
            image_width: width,
            image_height: height,
        })
    }

    /// Rectangle grown symmetrically by `grow` (half width, half height)
    /// around a centre.
    pub fn from_center(center: (f64, f64), grow: (f64, f64), image_size: (u32, u32)) -> PotResult<Self> {
        let coords = [
            (center.0 - grow.0).round() as i64,
            (center.1 - grow.1).round() as i64,
            (center.0 + grow.0).round() as i64,
            (center.1 + grow.1).round() as i64,
        ];
        Self::new(coords, image_size)
    }

    pub fn coords(&self) -> [u32; 4] {
        [self.x0, self.y0, self.x1, self.y1]
    }

    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    pub fn image_size(&self) -> (u32, u32) {
        (self.image_width, self.image_height)
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.x0 + self.x1) as f64 / 2.0,
            (self.y0 + self.y1) as f64 / 2.0,
        )
    }

    /// Grow every side by `margin` pixels (negative shrinks).
    pub fn expand(&self, margin: i64) -> PotResult<Self> {
        Self::new(
            [
                self.x0 as i64 - margin,
                self.y0 as i64 - margin,
                self.x1 as i64 + margin,
                self.y1 as i64 + margin,
            ],
            self.image_size(),
        )
    }

    /// Shrink every side by `margin` pixels.
    pub fn shrink(&self, margin: i64) -> PotResult<Self> {
        self.expand(-margin)
    }

    /// Whether the rectangle fits an image of the given size.
    pub fn fits(&self, image_size: (u32, u32)) -> bool {
        self.x1 <= image_size.0 && self.y1 <= image_size.1
    }

    /// Copy of the image region under the rectangle.
    pub fn crop(&self, image: &RgbImage) -> RgbImage {
        image.view(self.x0, self.y0, self.width(), self.height()).to_image()
    }

    /// Copy of a mask region under the rectangle.
    pub fn crop_gray(&self, image: &GrayImage) -> GrayImage {
        image.view(self.x0, self.y0, self.width(), self.height()).to_image()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariant() {
        assert!(PotRect::new([0, 0, 10, 10], (10, 10)).is_ok());
        for bad in [[-1, 0, 5, 5], [0, 0, 11, 5], [5, 0, 5, 5], [0, 6, 5, 5]] {
            assert!(matches!(
                PotRect::new(bad, (10, 10)),
                Err(PotError::RectangleOverflow { .. })
            ));
        }
    }

    #[test]
    fn test_from_center_and_resize() {
        let r = PotRect::from_center((50.0, 40.0), (10.0, 5.0), (100, 80)).unwrap();
        assert_eq!(r.coords(), [40, 35, 60, 45]);
        assert_eq!((r.width(), r.height()), (20, 10));
        assert_eq!(r.center(), (50.0, 40.0));

        assert_eq!(r.expand(5).unwrap().coords(), [35, 30, 65, 50]);
        assert_eq!(r.shrink(2).unwrap().coords(), [42, 37, 58, 43]);
        assert!(r.shrink(5).is_err());
        assert!(r.expand(40).is_err());
        assert!(PotRect::from_center((2.0, 2.0), (5.0, 5.0), (100, 80)).is_err());
    }

    #[test]
    fn test_crop() {
        let mut img = RgbImage::new(8, 8);
        img.put_pixel(3, 4, image::Rgb([9, 9, 9]));
        let r = PotRect::new([2, 2, 6, 7], (8, 8)).unwrap();
        let crop = r.crop(&img);
        assert_eq!(crop.dimensions(), (4, 5));
        assert_eq!(crop.get_pixel(1, 2), &image::Rgb([9, 9, 9]));
    }
}
