//! Per-frame collection of pots keyed by stable id.

use crate::core::data::{DataValue, NdArray};
use crate::core::error::{PotError, PotResult};
use crate::pots::features::FeatureValue;
use crate::pots::handler::{MetaValue, PotHandler};
use crate::pots::rect::PotRect;
use crate::timestream::path::{ts_format_date, ts_parse_date};
use chrono::NaiveDateTime;
use image::{GrayImage, RgbImage};
use indexmap::{IndexMap, IndexSet};
use std::collections::BTreeMap;
use std::sync::Arc;

/// How a pot is described when building a matrix.
#[derive(Debug, Clone)]
pub enum PotSpec {
    /// A ready-made handler.
    Handler(PotHandler),
    /// `[x0, y0, x1, y1]`.
    Rect { id: u32, coords: [i64; 4] },
    /// A centre, grown by the matrix grow margin.
    Center { id: u32, center: (f64, f64) },
}

/// The pots of one frame.
///
/// Owns its handlers and the frame pixels. The link to the previous frame's
/// matrix is kept at most one hop deep.
#[derive(Debug, Clone)]
pub struct PotMatrix {
    image: Option<Arc<RgbImage>>,
    image_size: (u32, u32),
    timestamp: Option<NaiveDateTime>,
    pots: BTreeMap<u32, PotHandler>,
    previous: Option<Box<PotMatrix>>,
}

impl PotMatrix {
    /// An empty matrix over a frame.
    pub fn new(image: Arc<RgbImage>, timestamp: Option<NaiveDateTime>) -> Self {
        Self {
            image_size: image.dimensions(),
            image: Some(image),
            timestamp,
            pots: BTreeMap::new(),
            previous: None,
        }
    }

    /// Build from pot descriptions; `grow` is the half size used for
    /// [`PotSpec::Center`].
    pub fn from_specs(
        image: Arc<RgbImage>,
        timestamp: Option<NaiveDateTime>,
        specs: Vec<PotSpec>,
        grow: (f64, f64),
    ) -> PotResult<Self> {
        let mut matrix = Self::new(image, timestamp);
        let size = matrix.image_size;
        for spec in specs {
            let handler = match spec {
                PotSpec::Handler(h) => h,
                PotSpec::Rect { id, coords } => PotHandler::new(id, PotRect::new(coords, size)?),
                PotSpec::Center { id, center } => PotHandler::new(id, PotRect::from_center(center, grow, size)?),
            };
            matrix.add_pot(handler)?;
        }
        Ok(matrix)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn image(&self) -> Option<&Arc<RgbImage>> {
        self.image.as_ref()
    }

    pub fn image_size(&self) -> (u32, u32) {
        self.image_size
    }

    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        self.timestamp
    }

    pub fn len(&self) -> usize {
        self.pots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pots.is_empty()
    }

    /// Pot ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.pots.keys().copied()
    }

    /// Pots in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &PotHandler> {
        self.pots.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PotHandler> {
        self.pots.values_mut()
    }

    pub fn get(&self, id: u32) -> Option<&PotHandler> {
        self.pots.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut PotHandler> {
        self.pots.get_mut(&id)
    }

    /// Add a pot, or replace the pot with the same id and rectangle.
    pub fn add_pot(&mut self, handler: PotHandler) -> PotResult<()> {
        let rect = handler.rect();
        if !rect.fits(self.image_size) {
            let [x0, y0, x1, y1] = rect.coords();
            return Err(PotError::RectangleOverflow {
                x0: x0 as i64,
                y0: y0 as i64,
                x1: x1 as i64,
                y1: y1 as i64,
                width: self.image_size.0,
                height: self.image_size.1,
            });
        }
        if let Some(existing) = self.pots.get(&handler.id()) {
            if existing.rect().coords() != rect.coords() {
                return Err(PotError::DuplicateId(handler.id()));
            }
        }
        self.pots.insert(handler.id(), handler);
        Ok(())
    }

    /// Names of every feature computed on any pot, in first-seen order.
    pub fn feature_names(&self) -> IndexSet<String> {
        self.pots
            .values()
            .flat_map(|p| p.features().keys().cloned())
            .collect()
    }

    // ========================================================================
    // Previous-frame link
    // ========================================================================

    pub fn previous(&self) -> Option<&PotMatrix> {
        self.previous.as_deref()
    }

    /// Link the previous frame, keeping the chain one hop deep and releasing
    /// the previous frame's pixels.
    pub fn set_previous(&mut self, mut previous: PotMatrix) {
        previous.previous = None;
        previous.image = None;
        self.previous = Some(Box::new(previous));
    }

    /// Number of links reachable from this matrix.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut cur = self.previous.as_deref();
        while let Some(m) = cur {
            depth += 1;
            cur = m.previous.as_deref();
        }
        depth
    }

    /// Matrix for the next frame with the same ids and rectangles, linked to
    /// `self`.
    ///
    /// Pots that no longer fit the new frame are dropped.
    pub fn successor(self, image: Arc<RgbImage>, timestamp: Option<NaiveDateTime>) -> Self {
        let mut next = Self::new(image, timestamp);
        let size = next.image_size;
        for pot in self.pots.values() {
            let [x0, y0, x1, y1] = pot.rect().coords();
            if let Ok(rect) = PotRect::new([x0 as i64, y0 as i64, x1 as i64, y1 as i64], size) {
                next.pots.insert(pot.id(), pot.successor(rect));
            }
        }
        next.set_previous(self);
        next
    }

    // ========================================================================
    // Segmentation and features
    // ========================================================================

    /// Segment every pot that has no mask yet, falling back on the previous
    /// frame's masks. Failures leave a zero mask and are returned.
    pub fn segment_all(&mut self) -> PotResult<Vec<PotError>> {
        let image = self.image.clone().ok_or(PotError::NoImage)?;
        let previous = self.previous.as_deref();
        let mut failures = Vec::new();
        for pot in self.pots.values_mut() {
            let prev = previous.and_then(|m| m.get(pot.id()));
            if let Err(e) = pot.mask(&image, prev) {
                pot.set_failed(e.to_string());
                failures.push(e);
            }
        }
        Ok(failures)
    }

    /// Compute features on every pot.
    pub fn calc_features(&mut self, names: &[String]) -> PotResult<()> {
        let image = self.image.clone().ok_or(PotError::NoImage)?;
        self.segment_all()?;
        for pot in self.pots.values_mut() {
            pot.calc_features(&image, names)?;
        }
        Ok(())
    }

    /// The frame with everything outside the pot masks blacked out.
    pub fn masked_image(&mut self) -> PotResult<RgbImage> {
        let image = self.image.clone().ok_or(PotError::NoImage)?;
        self.segment_all()?;
        let mut out = RgbImage::new(image.width(), image.height());
        for pot in self.pots.values() {
            let Some(mask) = pot.cached_mask() else { continue };
            let [x0, y0, _, _] = pot.rect().coords();
            for (x, y, m) in mask.enumerate_pixels() {
                if m[0] > 0 {
                    out.put_pixel(x0 + x, y0 + y, *image.get_pixel(x0 + x, y0 + y));
                }
            }
        }
        Ok(out)
    }

    // ========================================================================
    // Serialisation
    // ========================================================================

    /// Encode ids, rectangles, masks, features and metadata.
    pub fn to_data(&self) -> DataValue {
        let pots: Vec<DataValue> = self
            .pots
            .values()
            .map(|pot| {
                let mut entry: IndexMap<String, DataValue> = IndexMap::new();
                entry.insert("id".into(), DataValue::Int(pot.id() as i64));
                let rect: Vec<i64> = pot.rect().coords().iter().map(|v| *v as i64).collect();
                if let Ok(arr) = NdArray::from_i64(vec![4], &rect) {
                    entry.insert("rect".into(), DataValue::Array(arr));
                }
                if let Some(mask) = pot.cached_mask() {
                    let shape = vec![mask.height() as usize, mask.width() as usize];
                    if let Ok(arr) = NdArray::from_u8(shape, mask.as_raw().clone()) {
                        entry.insert("mask".into(), DataValue::Array(arr));
                    }
                }
                let features: IndexMap<String, DataValue> = pot
                    .features()
                    .iter()
                    .map(|(k, v)| {
                        let value = match v {
                            FeatureValue::Value(x) => DataValue::Float(*x),
                            FeatureValue::Error(e) => DataValue::String(format!("error: {}", e)),
                        };
                        (k.clone(), value)
                    })
                    .collect();
                entry.insert("features".into(), DataValue::Map(features));
                let metadata: IndexMap<String, DataValue> = pot
                    .metadata()
                    .iter()
                    .map(|(k, v)| {
                        let value = match v {
                            MetaValue::Str(s) => DataValue::String(s.clone()),
                            MetaValue::Num(n) => DataValue::Float(*n),
                        };
                        (k.clone(), value)
                    })
                    .collect();
                entry.insert("metadata".into(), DataValue::Map(metadata));
                DataValue::Map(entry)
            })
            .collect();

        let mut root: IndexMap<String, DataValue> = IndexMap::new();
        if let Some(ts) = &self.timestamp {
            root.insert("timestamp".into(), DataValue::String(ts_format_date(ts)));
        }
        root.insert(
            "imageSize".into(),
            DataValue::List(vec![
                DataValue::Int(self.image_size.0 as i64),
                DataValue::Int(self.image_size.1 as i64),
            ]),
        );
        root.insert("pots".into(), DataValue::List(pots));
        DataValue::Map(root)
    }

    /// Rebuild a matrix written by [`to_data`](Self::to_data).
    pub fn from_data(data: &DataValue, image: Option<Arc<RgbImage>>) -> PotResult<Self> {
        let malformed = |what: &str| PotError::Malformed(what.to_string());
        let size = match data.get("imageSize").and_then(|v| v.as_list()) {
            Some([w, h]) => match (w.as_f64(), h.as_f64()) {
                (Some(w), Some(h)) if w > 0.0 && h > 0.0 => (w as u32, h as u32),
                _ => return Err(malformed("imageSize must hold two positive numbers")),
            },
            _ => return Err(malformed("missing imageSize")),
        };
        if let Some(img) = &image {
            if img.dimensions() != size {
                return Err(malformed("image does not match imageSize"));
            }
        }
        let timestamp = match data.get("timestamp").and_then(|v| v.as_str()) {
            Some(s) => Some(ts_parse_date(s).map_err(|e| malformed(&e.to_string()))?),
            None => None,
        };

        let mut matrix = Self {
            image,
            image_size: size,
            timestamp,
            pots: BTreeMap::new(),
            previous: None,
        };
        let pots = data
            .get("pots")
            .and_then(|v| v.as_list())
            .ok_or_else(|| malformed("missing pots"))?;
        for entry in pots {
            let id = entry
                .get("id")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| malformed("pot without id"))? as u32;
            let coords = entry
                .get("rect")
                .and_then(|v| v.as_array())
                .map(|a| a.to_f64_vec())
                .filter(|v| v.len() == 4)
                .ok_or_else(|| malformed("pot without rect"))?;
            let rect = PotRect::new(
                [coords[0] as i64, coords[1] as i64, coords[2] as i64, coords[3] as i64],
                size,
            )?;
            let mut pot = PotHandler::new(id, rect);
            if let Some(arr) = entry.get("mask").and_then(|v| v.as_array()) {
                let (h, w) = match arr.shape() {
                    [h, w] => (*h as u32, *w as u32),
                    _ => return Err(malformed("mask must be two-dimensional")),
                };
                let mask = GrayImage::from_raw(w, h, arr.bytes().to_vec())
                    .ok_or_else(|| malformed("mask payload does not match its shape"))?;
                pot.set_mask(mask)?;
            }
            if let Some(features) = entry.get("features").and_then(|v| v.as_map()) {
                for (name, value) in features {
                    let value = match value {
                        DataValue::String(s) => FeatureValue::Error(s.clone()),
                        other => other
                            .as_f64()
                            .map(FeatureValue::Value)
                            .unwrap_or_else(|| FeatureValue::Error("not a number".into())),
                    };
                    pot.set_feature(name.clone(), value);
                }
            }
            if let Some(meta) = entry.get("metadata").and_then(|v| v.as_map()) {
                for (key, value) in meta {
                    let value = match value {
                        DataValue::String(s) => MetaValue::Str(s.clone()),
                        other => match other.as_f64() {
                            Some(n) => MetaValue::Num(n),
                            None => continue,
                        },
                    };
                    pot.set_metadata(key.clone(), value);
                }
            }
            matrix.add_pot(pot)?;
        }
        Ok(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::{dejsonify_data, jsonify_data};
    use image::{Luma, Rgb};

    fn frame() -> Arc<RgbImage> {
        Arc::new(RgbImage::from_pixel(100, 80, Rgb([10, 20, 30])))
    }

    fn matrix() -> PotMatrix {
        PotMatrix::from_specs(
            frame(),
            None,
            vec![
                PotSpec::Rect { id: 1, coords: [0, 0, 20, 20] },
                PotSpec::Center { id: 2, center: (50.0, 40.0) },
            ],
            (10.0, 10.0),
        )
        .unwrap()
    }

    #[test]
    fn test_build_and_lookup() {
        let m = matrix();
        assert_eq!(m.len(), 2);
        assert_eq!(m.ids().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(m.get(2).unwrap().rect().coords(), [40, 30, 60, 50]);
        assert!(m.get(3).is_none());
    }

    #[test]
    fn test_duplicate_ids() {
        let mut m = matrix();
        let same = PotHandler::new(1, PotRect::new([0, 0, 20, 20], (100, 80)).unwrap());
        assert!(m.add_pot(same).is_ok());
        let other = PotHandler::new(1, PotRect::new([5, 5, 20, 20], (100, 80)).unwrap());
        assert_eq!(m.add_pot(other), Err(PotError::DuplicateId(1)));

        let bigger = PotHandler::new(9, PotRect::new([0, 0, 200, 20], (300, 80)).unwrap());
        assert!(matches!(m.add_pot(bigger), Err(PotError::RectangleOverflow { .. })));
    }

    #[test]
    fn test_previous_chain_is_pruned() {
        let mut m = matrix();
        for _ in 0..5 {
            m = m.successor(frame(), None);
        }
        assert_eq!(m.depth(), 1);
        assert_eq!(m.ids().collect::<Vec<_>>(), vec![1, 2]);
        let prev = m.previous().unwrap();
        assert!(prev.image().is_none());
        assert!(prev.previous().is_none());
    }

    #[test]
    fn test_previous_masks_carry_over() {
        let mut first = matrix();
        first
            .get_mut(1)
            .unwrap()
            .set_mask(GrayImage::from_pixel(20, 20, Luma([1])))
            .unwrap();
        let mut next = first.successor(frame(), None);
        assert!(next.segment_all().unwrap().is_empty());
        let mask = next.get(1).unwrap().cached_mask().unwrap();
        assert!(mask.pixels().all(|p| p[0] == 1));
        let empty = next.get(2).unwrap().cached_mask().unwrap();
        assert!(empty.pixels().all(|p| p[0] == 0));

        let composite = next.masked_image().unwrap();
        assert_eq!(composite.get_pixel(5, 5), &Rgb([10, 20, 30]));
        assert_eq!(composite.get_pixel(50, 40), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_feature_names_union() {
        let mut m = matrix();
        m.get_mut(1)
            .unwrap()
            .set_feature("area", FeatureValue::Value(1.0));
        m.get_mut(2)
            .unwrap()
            .set_feature("gcc", FeatureValue::Value(0.3));
        let names: Vec<String> = m.feature_names().into_iter().collect();
        assert_eq!(names, vec!["area", "gcc"]);
    }

    #[test]
    fn test_data_round_trip_through_json() {
        let mut m = PotMatrix::from_specs(
            frame(),
            NaiveDateTime::parse_from_str("2013_10_30_03_00_00", "%Y_%m_%d_%H_%M_%S").ok(),
            vec![PotSpec::Rect { id: 4, coords: [10, 10, 14, 13] }],
            (0.0, 0.0),
        )
        .unwrap();
        let pot = m.get_mut(4).unwrap();
        pot.set_mask(GrayImage::from_fn(4, 3, |x, _| Luma([(x % 2) as u8]))).unwrap();
        pot.set_feature("area", FeatureValue::Value(6.0));
        pot.set_feature("gcc", FeatureValue::Error("no masked pixels".into()));
        pot.set_metadata("plantId", MetaValue::Str("A12".into()));
        pot.set_metadata("chamber", MetaValue::Num(3.0));

        let json = jsonify_data(&m.to_data());
        let back = PotMatrix::from_data(&dejsonify_data(&json).unwrap(), None).unwrap();
        assert_eq!(back.timestamp(), m.timestamp());
        let pot = back.get(4).unwrap();
        assert_eq!(pot.cached_mask(), m.get(4).unwrap().cached_mask());
        assert_eq!(pot.features()["area"], FeatureValue::Value(6.0));
        assert!(pot.features()["gcc"].is_error());
        assert_eq!(pot.metadata()["plantId"], MetaValue::Str("A12".into()));
        assert_eq!(pot.metadata()["chamber"], MetaValue::Num(3.0));
    }

    #[test]
    fn test_from_data_rejects_garbage() {
        assert!(matches!(
            PotMatrix::from_data(&DataValue::Int(1), None),
            Err(PotError::Malformed(_))
        ));
    }
}
