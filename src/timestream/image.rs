//! A single timepoint of a timestream.

use crate::core::data::DataValue;
use crate::core::error::{TimestreamError, TimestreamResult};
use crate::timestream::path::{parse_image_path, ts_format_date};
use chrono::NaiveDateTime;
use image::RgbImage;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The archive an image was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentInfo {
    pub root: PathBuf,
    pub name: String,
    pub extension: String,
}

/// One image of a timestream.
///
/// Pixels are RGB and load on first access. Stages that change the image
/// replace the whole pixel buffer with [`set_pixels`](Self::set_pixels).
#[derive(Debug, Clone)]
pub struct TimestreamImage {
    parent: Option<ParentInfo>,
    path: Option<PathBuf>,
    datetime: NaiveDateTime,
    subsec: u8,
    pixels: Option<Arc<RgbImage>>,
    /// Per-image data persisted by the image writer.
    pub metadata: IndexMap<String, DataValue>,
}

impl TimestreamImage {
    /// An image with no file behind it.
    pub fn new(datetime: NaiveDateTime) -> Self {
        Self {
            parent: None,
            path: None,
            datetime,
            subsec: 0,
            pixels: None,
            metadata: IndexMap::new(),
        }
    }

    /// An image backed by a file; the timestamp comes from the file name.
    pub fn from_path(path: impl Into<PathBuf>) -> TimestreamResult<Self> {
        let path = path.into();
        let parsed = parse_image_path(&path)
            .ok_or_else(|| TimestreamError::InvalidTimestamp(path.display().to_string()))?;
        Ok(Self {
            parent: None,
            path: Some(path),
            datetime: parsed.datetime,
            subsec: parsed.subsec,
            pixels: None,
            metadata: IndexMap::new(),
        })
    }

    /// Attach the archive the image belongs to.
    pub fn with_parent(mut self, parent: ParentInfo) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Attach pixels.
    pub fn with_pixels(mut self, pixels: RgbImage) -> Self {
        self.pixels = Some(Arc::new(pixels));
        self
    }

    pub fn parent(&self) -> Option<&ParentInfo> {
        self.parent.as_ref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn datetime(&self) -> NaiveDateTime {
        self.datetime
    }

    pub fn subsec(&self) -> u8 {
        self.subsec
    }

    /// `YYYY_MM_DD_HH_MM_SS` of this image.
    pub fn timestamp_string(&self) -> String {
        ts_format_date(&self.datetime)
    }

    /// Whether the pixels are in memory.
    pub fn is_loaded(&self) -> bool {
        self.pixels.is_some()
    }

    /// Get the pixels, loading them from disk on first access.
    pub fn pixels(&mut self) -> TimestreamResult<Arc<RgbImage>> {
        if let Some(p) = &self.pixels {
            return Ok(Arc::clone(p));
        }
        let path = self.path.as_ref().ok_or(TimestreamError::NoPixels)?;
        log::debug!("loading {}", path.display());
        let img = Arc::new(image::open(path)?.to_rgb8());
        self.pixels = Some(Arc::clone(&img));
        Ok(img)
    }

    /// Pixels if already loaded.
    pub fn loaded_pixels(&self) -> Option<&Arc<RgbImage>> {
        self.pixels.as_ref()
    }

    /// Replace the pixel buffer.
    pub fn set_pixels(&mut self, pixels: RgbImage) {
        self.pixels = Some(Arc::new(pixels));
    }

    /// Drop the pixels; they reload from the file on next access.
    pub fn release_pixels(&mut self) {
        self.pixels = None;
    }
}
