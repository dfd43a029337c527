//! One pot: rectangle, mask, features and metadata.

use crate::core::error::{PotError, PotResult};
use crate::pots::features::{self, FeatureValue};
use crate::pots::rect::PotRect;
use crate::pots::segmenter::{fit_mask, is_empty_mask, SegmentHints, Segmenter};
use image::{GrayImage, RgbImage};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// Domain metadata attached to a pot.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Str(String),
    Num(f64),
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Str(s) => f.write_str(s),
            MetaValue::Num(n) => write!(f, "{}", n),
        }
    }
}

/// Segment one pot image, falling back on the previous mask when the result
/// is empty.
pub fn segment_pot(
    segmenter: &dyn Segmenter,
    pot_image: &RgbImage,
    previous_mask: Option<&GrayImage>,
) -> PotResult<GrayImage> {
    let hints = SegmentHints {
        previous_mask: previous_mask.cloned(),
        ..SegmentHints::default()
    };
    let (mask, _) = segmenter.segment(pot_image, &hints)?;
    let (w, h) = pot_image.dimensions();
    match previous_mask {
        Some(prev) if is_empty_mask(&mask) => Ok(fit_mask(prev, w, h)),
        _ => Ok(mask),
    }
}

/// A pot within a frame.
///
/// The mask is 0/1, has the rectangle's dimensions and is computed on first
/// use. Changing the rectangle or the segmenter drops mask and features.
#[derive(Debug, Clone)]
pub struct PotHandler {
    id: u32,
    rect: PotRect,
    segmenter: Option<Arc<dyn Segmenter>>,
    mask: Option<GrayImage>,
    features: IndexMap<String, FeatureValue>,
    metadata: IndexMap<String, MetaValue>,
    /// Set when segmentation failed and the mask is a zero fallback.
    segmentation_error: Option<String>,
}

impl PotHandler {
    pub fn new(id: u32, rect: PotRect) -> Self {
        Self {
            id,
            rect,
            segmenter: None,
            mask: None,
            features: IndexMap::new(),
            metadata: IndexMap::new(),
            segmentation_error: None,
        }
    }

    /// Builder-style [`set_segmenter`](Self::set_segmenter).
    pub fn with_segmenter(mut self, segmenter: Arc<dyn Segmenter>) -> Self {
        self.set_segmenter(Some(segmenter));
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn rect(&self) -> &PotRect {
        &self.rect
    }

    fn invalidate(&mut self) {
        self.mask = None;
        self.features.clear();
        self.segmentation_error = None;
    }

    /// Replace the rectangle.
    pub fn set_rect(&mut self, rect: PotRect) {
        self.rect = rect;
        self.invalidate();
    }

    /// Grow the rectangle by `margin` on every side.
    pub fn expand(&mut self, margin: i64) -> PotResult<()> {
        let rect = self.rect.expand(margin)?;
        self.set_rect(rect);
        Ok(())
    }

    /// Shrink the rectangle by `margin` on every side.
    pub fn shrink(&mut self, margin: i64) -> PotResult<()> {
        let rect = self.rect.shrink(margin)?;
        self.set_rect(rect);
        Ok(())
    }

    pub fn segmenter(&self) -> Option<&Arc<dyn Segmenter>> {
        self.segmenter.as_ref()
    }

    pub fn set_segmenter(&mut self, segmenter: Option<Arc<dyn Segmenter>>) {
        self.segmenter = segmenter;
        self.invalidate();
    }

    /// The pot region of a frame.
    pub fn image(&self, frame: &RgbImage) -> RgbImage {
        self.rect.crop(frame)
    }

    // ========================================================================
    // Mask
    // ========================================================================

    /// Mask if already computed.
    pub fn cached_mask(&self) -> Option<&GrayImage> {
        self.mask.as_ref()
    }

    /// Install a mask computed elsewhere.
    pub fn set_mask(&mut self, mask: GrayImage) -> PotResult<()> {
        if mask.dimensions() != (self.rect.width(), self.rect.height()) {
            return Err(PotError::MaskShape {
                id: self.id,
                width: self.rect.width(),
                height: self.rect.height(),
                got_width: mask.width(),
                got_height: mask.height(),
            });
        }
        self.mask = Some(mask);
        self.features.clear();
        Ok(())
    }

    /// Install a zero mask and remember why segmentation failed.
    pub fn set_failed(&mut self, reason: impl Into<String>) {
        self.mask = Some(GrayImage::new(self.rect.width(), self.rect.height()));
        self.features.clear();
        self.segmentation_error = Some(reason.into());
    }

    pub fn segmentation_error(&self) -> Option<&str> {
        self.segmentation_error.as_deref()
    }

    /// The mask, segmenting on first use.
    ///
    /// Without a segmenter the mask is empty unless `previous` provides one.
    pub fn mask(&mut self, frame: &RgbImage, previous: Option<&PotHandler>) -> PotResult<&GrayImage> {
        if self.mask.is_none() {
            let (w, h) = (self.rect.width(), self.rect.height());
            let prev_mask = previous.and_then(|p| p.cached_mask());
            let mask = match &self.segmenter {
                Some(seg) => segment_pot(seg.as_ref(), &self.image(frame), prev_mask).map_err(|e| {
                    PotError::Segmentation {
                        id: self.id,
                        reason: e.to_string(),
                    }
                })?,
                None => match prev_mask {
                    Some(prev) => fit_mask(prev, w, h),
                    None => GrayImage::new(w, h),
                },
            };
            self.set_mask(mask)?;
        }
        self.mask.as_ref().ok_or(PotError::NoImage)
    }

    /// The pot image with background pixels blacked out.
    ///
    /// With `in_frame` the result is the size of the whole frame, black
    /// outside the pot.
    pub fn masked_image(&mut self, frame: &RgbImage, in_frame: bool) -> PotResult<RgbImage> {
        let pot = self.image(frame);
        let [x0, y0, _, _] = self.rect.coords();
        let mask = self.mask(frame, None)?;
        let mut out = if in_frame {
            RgbImage::new(frame.width(), frame.height())
        } else {
            RgbImage::new(pot.width(), pot.height())
        };
        let (dx, dy) = if in_frame { (x0, y0) } else { (0, 0) };
        for (x, y, p) in pot.enumerate_pixels() {
            if mask.get_pixel(x, y)[0] > 0 {
                out.put_pixel(x + dx, y + dy, *p);
            }
        }
        Ok(out)
    }

    // ========================================================================
    // Features and metadata
    // ========================================================================

    /// Compute features (`"all"` for the whole catalog).
    pub fn calc_features(&mut self, frame: &RgbImage, names: &[String]) -> PotResult<()> {
        let names = features::resolve_names(names)?;
        let pot = self.image(frame);
        let mask = self.mask(frame, None)?.clone();
        let computed = features::calc_features(&names, &pot, &mask);
        self.features.extend(computed);
        Ok(())
    }

    pub fn features(&self) -> &IndexMap<String, FeatureValue> {
        &self.features
    }

    /// Set a feature value directly (used when reloading).
    pub fn set_feature(&mut self, name: impl Into<String>, value: FeatureValue) {
        self.features.insert(name.into(), value);
    }

    pub fn metadata(&self) -> &IndexMap<String, MetaValue> {
        &self.metadata
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: MetaValue) {
        self.metadata.insert(key.into(), value);
    }

    /// Fresh handler for the next frame: same id, rectangle, segmenter and
    /// metadata; no mask or features.
    pub fn successor(&self, rect: PotRect) -> Self {
        Self {
            id: self.id,
            rect,
            segmenter: self.segmenter.clone(),
            mask: None,
            features: IndexMap::new(),
            metadata: self.metadata.clone(),
            segmentation_error: None,
        }
    }
}
