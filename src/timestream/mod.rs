//! On-disk timestream archives.
//!
//! A timestream is a directory of images laid out by date
//! (`YYYY/YYYY_MM/YYYY_MM_DD/YYYY_MM_DD_HH/<name>_<timestamp>_NN.<ext>`), a
//! manifest at the root, and a `_data` directory holding per-image data
//! (`image_data.json`) and serialised pot matrices (`pots/<timestamp>.json`).

pub mod image;
pub mod iter;
pub mod manifest;
pub mod path;

pub use self::image::{ParentInfo, TimestreamImage};
pub use iter::{timepoints, FrameSlot, TimepointQuery};
pub use manifest::Manifest;
pub use path::{image_path, parse_image_path, ts_format_date, ts_parse_date};

use crate::core::data::{dejsonify_data, jsonify_data, DataValue};
use crate::core::error::{TimestreamError, TimestreamResult};
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

/// Name of the auxiliary data directory.
pub const DATA_DIR: &str = "_data";
/// Per-image data file inside `_data`.
pub const IMAGE_DATA_FILE: &str = "image_data.json";
/// Directory of serialised pot matrices inside `_data`.
pub const POTS_DIR: &str = "pots";

/// Largest sub-second counter.
pub const MAX_SUBSEC: u8 = 99;

/// What [`Timestream::write_image`] does when the target exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverwriteMode {
    /// Leave the existing file alone.
    Skip,
    /// Use the next free sub-second counter.
    Increment,
    /// Replace the file.
    #[default]
    Overwrite,
    /// Fail.
    Raise,
}

impl FromStr for OverwriteMode {
    type Err = TimestreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(OverwriteMode::Skip),
            "increment" => Ok(OverwriteMode::Increment),
            "overwrite" => Ok(OverwriteMode::Overwrite),
            "raise" => Ok(OverwriteMode::Raise),
            other => Err(TimestreamError::InvalidOverwriteMode(other.to_string())),
        }
    }
}

impl fmt::Display for OverwriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OverwriteMode::Skip => "skip",
            OverwriteMode::Increment => "increment",
            OverwriteMode::Overwrite => "overwrite",
            OverwriteMode::Raise => "raise",
        })
    }
}

/// Result of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(PathBuf),
    Skipped(PathBuf),
}

/// A timestream archive.
#[derive(Debug, Clone)]
pub struct Timestream {
    root: PathBuf,
    manifest: Manifest,
    /// Image files by timestamp and sub-second counter.
    index: BTreeMap<NaiveDateTime, BTreeMap<u8, PathBuf>>,
    image_data: BTreeMap<String, DataValue>,
    /// Free-form metadata; not persisted in the manifest.
    pub metadata: BTreeMap<String, DataValue>,
}

impl Timestream {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Open an existing archive, reading or guessing its manifest.
    pub fn load(root: impl AsRef<Path>) -> TimestreamResult<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(TimestreamError::NotFound { path: root });
        }

        let known = Manifest::locate(&root).map(|p| Manifest::read(&p)).transpose()?;
        let files = scan_images(&root, known.as_ref().map(|m| m.extension.as_str()));

        let manifest = match known {
            Some(m) => m,
            None => guess_manifest(&root, &files)?,
        };

        let mut index: BTreeMap<NaiveDateTime, BTreeMap<u8, PathBuf>> = BTreeMap::new();
        for (path, parsed) in files {
            if parsed.extension.eq_ignore_ascii_case(&manifest.extension) {
                index.entry(parsed.datetime).or_default().insert(parsed.subsec, path);
            }
        }

        let mut ts = Self {
            root,
            manifest,
            index,
            image_data: BTreeMap::new(),
            metadata: BTreeMap::new(),
        };
        ts.load_image_data()?;
        log::debug!(
            "loaded timestream '{}' with {} timepoints",
            ts.manifest.name,
            ts.index.len()
        );
        Ok(ts)
    }

    /// Create an empty archive with a fresh manifest.
    ///
    /// The name defaults to the directory name and images are written as PNG.
    pub fn create(root: impl AsRef<Path>, version: u8) -> TimestreamResult<Self> {
        let root = root.as_ref().to_path_buf();
        let name = root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("timestream")
            .to_string();
        Self::create_with(root, Manifest::new(name, version, "PNG"))
    }

    /// Create an empty archive with the given manifest.
    pub fn create_with(root: impl AsRef<Path>, manifest: Manifest) -> TimestreamResult<Self> {
        let root = root.as_ref().to_path_buf();
        if !(1..=2).contains(&manifest.version) {
            return Err(TimestreamError::ManifestInvalid {
                path: root,
                reason: format!("version {} is not 1 or 2", manifest.version),
            });
        }
        std::fs::create_dir_all(root.join(DATA_DIR))?;
        manifest.write(&root)?;
        Ok(Self {
            root,
            manifest,
            index: BTreeMap::new(),
            image_data: BTreeMap::new(),
            metadata: BTreeMap::new(),
        })
    }

    /// Open an archive if it exists, otherwise create it.
    pub fn open_or_create(root: impl AsRef<Path>, manifest: Manifest) -> TimestreamResult<Self> {
        let root = root.as_ref();
        if root.is_dir() && Manifest::locate(root).is_some() {
            Self::load(root)
        } else {
            Self::create_with(root, manifest)
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn start(&self) -> Option<NaiveDateTime> {
        self.manifest.start
    }

    pub fn end(&self) -> Option<NaiveDateTime> {
        self.manifest.end
    }

    /// Interval in minutes.
    pub fn interval(&self) -> Option<i64> {
        self.manifest.interval
    }

    /// Set the interval in minutes.
    pub fn set_interval(&mut self, minutes: i64) -> TimestreamResult<()> {
        if minutes <= 0 {
            return Err(TimestreamError::ManifestInvalid {
                path: self.root.clone(),
                reason: format!("interval {} must be positive", minutes),
            });
        }
        self.manifest.interval = Some(minutes);
        self.manifest.write(&self.root)
    }

    /// `_data` directory of the archive.
    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    /// Timestamps that have at least one image.
    pub fn timestamps(&self) -> BTreeSet<NaiveDateTime> {
        self.index.keys().copied().collect()
    }

    /// Number of image files.
    pub fn image_count(&self) -> usize {
        self.index.values().map(|v| v.len()).sum()
    }

    fn parent_info(&self) -> ParentInfo {
        ParentInfo {
            root: self.root.clone(),
            name: self.manifest.name.clone(),
            extension: self.manifest.extension.clone(),
        }
    }

    fn record(&self, path: &Path) -> TimestreamResult<TimestreamImage> {
        Ok(TimestreamImage::from_path(path)?.with_parent(self.parent_info()))
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// The image at a timestamp (lowest sub-second counter).
    pub fn get_image(&self, datetime: &NaiveDateTime) -> TimestreamResult<TimestreamImage> {
        let path = self
            .index
            .get(datetime)
            .and_then(|v| v.values().next())
            .ok_or_else(|| TimestreamError::NoImage(ts_format_date(datetime)))?;
        self.record(path)
    }

    /// Every image file in chronological order.
    pub fn iter_by_files(&self) -> impl Iterator<Item = TimestreamImage> + '_ {
        self.index
            .values()
            .flat_map(|v| v.values())
            .filter_map(move |p| self.record(p).ok())
    }

    /// Images at `start + k * interval`, see [`TimepointQuery`].
    pub fn iter_by_timepoints(&self, query: &TimepointQuery) -> Vec<FrameSlot> {
        let start = query.start.or(self.manifest.start);
        let end = query.end.or(self.manifest.end);
        let step = query
            .interval
            .or_else(|| self.manifest.interval.map(|m| m * 60));
        let (Some(start), Some(end), Some(step)) = (start, end, step) else {
            return Vec::new();
        };

        timepoints(start, end, step)
            .into_iter()
            .filter(|t| query.in_hours(t) && !query.skip.contains(t))
            .filter_map(|t| match self.get_image(&t) {
                Ok(img) => Some(FrameSlot::Image(img)),
                Err(_) if query.remove_gaps => None,
                Err(_) => Some(FrameSlot::Missing(t)),
            })
            .collect()
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Write an image under the v1 layout.
    pub fn write_image(
        &mut self,
        image: &mut TimestreamImage,
        mode: OverwriteMode,
    ) -> TimestreamResult<WriteOutcome> {
        let dt = image.datetime();
        let ext = self.manifest.extension.clone();
        let target = |subsec: u8| image_path(&self.root, &self.manifest.name, &dt, subsec, &ext);

        let (subsec, path) = match mode {
            OverwriteMode::Increment => (0..=MAX_SUBSEC)
                .map(|n| (n, target(n)))
                .find(|(_, p)| !p.exists())
                .ok_or_else(|| TimestreamError::TooManyImages {
                    timestamp: ts_format_date(&dt),
                })?,
            _ => (0, target(0)),
        };
        if path.exists() {
            match mode {
                OverwriteMode::Skip => return Ok(WriteOutcome::Skipped(path)),
                OverwriteMode::Raise => return Err(TimestreamError::ImageExists { path }),
                _ => {}
            }
        }

        let pixels = image.pixels()?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let format = ::image::ImageFormat::from_extension(&ext).ok_or_else(|| {
            ::image::ImageError::Unsupported(::image::error::ImageFormatHint::Name(ext.clone()).into())
        })?;
        pixels.save_with_format(&path, format)?;

        self.index.entry(dt).or_default().insert(subsec, path.clone());
        self.widen(dt);
        self.manifest.write(&self.root)?;
        log::debug!("wrote {}", path.display());
        Ok(WriteOutcome::Written(path))
    }

    fn widen(&mut self, dt: NaiveDateTime) {
        self.manifest.start = Some(self.manifest.start.map_or(dt, |s| s.min(dt)));
        self.manifest.end = Some(self.manifest.end.map_or(dt, |e| e.max(dt)));
        self.manifest.missing.retain(|m| *m != dt);
    }

    // ========================================================================
    // Per-image data
    // ========================================================================

    /// Data stored for a timestamp.
    pub fn image_data(&self, datetime: &NaiveDateTime) -> Option<&DataValue> {
        self.image_data.get(&ts_format_date(datetime))
    }

    /// Store data for a timestamp (in memory until saved).
    pub fn set_image_data(&mut self, datetime: &NaiveDateTime, data: DataValue) {
        self.image_data.insert(ts_format_date(datetime), data);
    }

    /// Persist per-image data to `_data/image_data.json`.
    pub fn save_image_data(&self) -> TimestreamResult<()> {
        let dir = self.data_dir();
        std::fs::create_dir_all(&dir)?;
        let mut obj = serde_json::Map::new();
        for (k, v) in &self.image_data {
            obj.insert(k.clone(), jsonify_data(v));
        }
        let text = serde_json::to_string(&serde_json::Value::Object(obj))?;
        std::fs::write(dir.join(IMAGE_DATA_FILE), text)?;
        Ok(())
    }

    fn load_image_data(&mut self) -> TimestreamResult<()> {
        let path = self.data_dir().join(IMAGE_DATA_FILE);
        if !path.is_file() {
            return Ok(());
        }
        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        if let Some(obj) = json.as_object() {
            for (k, v) in obj {
                self.image_data.insert(k.clone(), dejsonify_data(v)?);
            }
        }
        Ok(())
    }

    /// Path of the serialised pot matrix for a timestamp.
    pub fn pot_data_path(&self, datetime: &NaiveDateTime) -> PathBuf {
        self.data_dir()
            .join(POTS_DIR)
            .join(format!("{}.json", ts_format_date(datetime)))
    }

    /// Write a serialised pot matrix.
    pub fn write_pot_data(&self, datetime: &NaiveDateTime, data: &DataValue) -> TimestreamResult<PathBuf> {
        let path = self.pot_data_path(datetime);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, serde_json::to_string(&jsonify_data(data))?)?;
        Ok(path)
    }

    /// Read a serialised pot matrix.
    pub fn read_pot_data(&self, datetime: &NaiveDateTime) -> TimestreamResult<DataValue> {
        let text = std::fs::read_to_string(self.pot_data_path(datetime))?;
        Ok(dejsonify_data(&serde_json::from_str(&text)?)?)
    }
}

/// Image files under `root` (outside `_data`), optionally filtered by
/// extension.
fn scan_images(root: &Path, extension: Option<&str>) -> Vec<(PathBuf, path::ImageName)> {
    let mut out: Vec<(PathBuf, path::ImageName)> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.file_name() != DATA_DIR)
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let parsed = parse_image_path(e.path())?;
            let ext_ok = match extension {
                Some(ext) => parsed.extension.eq_ignore_ascii_case(ext),
                None => manifest::EXTENSIONS
                    .iter()
                    .any(|x| parsed.extension.eq_ignore_ascii_case(x)),
            };
            ext_ok.then(|| (e.into_path(), parsed))
        })
        .collect();
    out.sort_by(|a, b| (a.1.datetime, a.1.subsec).cmp(&(b.1.datetime, b.1.subsec)));
    out
}

/// Derive a manifest from the files of an archive without one.
fn guess_manifest(root: &Path, files: &[(PathBuf, path::ImageName)]) -> TimestreamResult<Manifest> {
    let invalid = |reason: &str| TimestreamError::ManifestInvalid {
        path: root.to_path_buf(),
        reason: reason.to_string(),
    };
    if files.is_empty() {
        return Err(invalid("no manifest and no images to guess one from"));
    }

    let mut ext_counts: HashMap<String, usize> = HashMap::new();
    for (_, f) in files {
        *ext_counts.entry(f.extension.to_ascii_uppercase()).or_default() += 1;
    }
    let extension = ext_counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(e, _)| e)
        .ok_or_else(|| invalid("no image extension"))?;
    let name = files[0].1.name.clone();

    let times: BTreeSet<NaiveDateTime> = files
        .iter()
        .filter(|(_, f)| f.extension.eq_ignore_ascii_case(&extension))
        .map(|(_, f)| f.datetime)
        .collect();
    let times: Vec<NaiveDateTime> = times.into_iter().collect();
    let start = times.first().copied();
    let end = times.last().copied();

    let mut diff_counts: BTreeMap<i64, usize> = BTreeMap::new();
    for pair in times.windows(2) {
        let minutes = (pair[1] - pair[0]).num_minutes();
        if minutes > 0 {
            *diff_counts.entry(minutes).or_default() += 1;
        }
    }
    // Modal difference; ties go to the shortest interval.
    let interval = diff_counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(m, _)| *m)
        .unwrap_or(1);

    let present: BTreeSet<NaiveDateTime> = times.iter().copied().collect();
    let missing = match (start, end) {
        (Some(s), Some(e)) => timepoints(s, e, interval * 60)
            .into_iter()
            .filter(|t| !present.contains(t))
            .collect(),
        _ => Vec::new(),
    };

    log::info!(
        "guessed manifest for {}: {} images every {} min, {} missing",
        root.display(),
        times.len(),
        interval,
        missing.len()
    );
    let mut manifest = Manifest::new(name, 1, &extension);
    manifest.start = start;
    manifest.end = end;
    manifest.interval = Some(interval);
    manifest.missing = missing;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::image::{Rgb, RgbImage};
    use chrono::{Duration, NaiveDate};

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2013, 10, 30).unwrap().and_hms_opt(3, 0, 0).unwrap()
    }

    /// Seven half-hourly images from 03:00, optionally without 04:30.
    fn fixture(dir: &Path, with_gap: bool) {
        for k in 0..7 {
            let dt = t0() + Duration::minutes(30 * k);
            if with_gap && k == 3 {
                continue;
            }
            let p = image_path(dir, "cam", &dt, 0, "png");
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            RgbImage::from_pixel(4, 4, Rgb([k as u8 * 10, 0, 0])).save(&p).unwrap();
        }
    }

    #[test]
    fn test_load_missing_archive() {
        assert!(matches!(
            Timestream::load("/definitely/not/here"),
            Err(TimestreamError::NotFound { .. })
        ));
    }

    #[test]
    fn test_seven_images_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path(), false);
        let ts = Timestream::load(dir.path()).unwrap();
        assert_eq!(ts.interval(), Some(30));
        assert_eq!(ts.start(), Some(t0()));

        let frames = ts.iter_by_timepoints(&TimepointQuery::new());
        assert_eq!(frames.len(), 7);
        assert!(frames.iter().all(|f| !f.is_missing()));
        assert!(frames.windows(2).all(|w| w[0].datetime() < w[1].datetime()));
        assert_eq!(ts.iter_by_files().count(), 7);
    }

    #[test]
    fn test_gap_handling() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path(), true);
        let ts = Timestream::load(dir.path()).unwrap();
        let gap = t0() + Duration::minutes(90);
        assert_eq!(ts.manifest().missing, vec![gap]);

        let without = ts.iter_by_timepoints(&TimepointQuery::new());
        assert_eq!(without.len(), 6);

        let with = ts.iter_by_timepoints(&TimepointQuery::new().with_remove_gaps(false));
        assert_eq!(with.len(), 7);
        assert_eq!(with.iter().filter(|f| f.is_missing()).count(), 1);
        assert!(matches!(with[3], FrameSlot::Missing(t) if t == gap));
    }

    #[test]
    fn test_query_filters() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path(), false);
        let ts = Timestream::load(dir.path()).unwrap();

        let skip: BTreeSet<_> = [t0(), t0() + Duration::minutes(30)].into_iter().collect();
        assert_eq!(ts.iter_by_timepoints(&TimepointQuery::new().with_skip(skip)).len(), 5);

        let hourly = TimepointQuery::new().with_interval(3600);
        assert_eq!(ts.iter_by_timepoints(&hourly).len(), 4);

        let window = TimepointQuery::new().with_hours(
            chrono::NaiveTime::from_hms_opt(4, 0, 0),
            chrono::NaiveTime::from_hms_opt(5, 0, 0),
        );
        assert_eq!(ts.iter_by_timepoints(&window).len(), 3);
    }

    #[test]
    fn test_write_modes() {
        let dir = tempfile::tempdir().unwrap();
        let mut ts = Timestream::create(dir.path().join("out"), 1).unwrap();
        let mut img = TimestreamImage::new(t0()).with_pixels(RgbImage::new(3, 3));

        let first = ts.write_image(&mut img, OverwriteMode::Raise).unwrap();
        assert!(matches!(first, WriteOutcome::Written(_)));
        assert_eq!(ts.start(), Some(t0()));
        assert_eq!(ts.end(), Some(t0()));

        assert!(matches!(
            ts.write_image(&mut img, OverwriteMode::Skip).unwrap(),
            WriteOutcome::Skipped(_)
        ));
        assert!(matches!(
            ts.write_image(&mut img, OverwriteMode::Raise),
            Err(TimestreamError::ImageExists { .. })
        ));
        assert!(ts.write_image(&mut img, OverwriteMode::Overwrite).is_ok());
        assert_eq!(ts.image_count(), 1);

        let later = t0() + Duration::hours(2);
        let mut img2 = TimestreamImage::new(later).with_pixels(RgbImage::new(3, 3));
        ts.write_image(&mut img2, OverwriteMode::Skip).unwrap();
        assert_eq!(ts.end(), Some(later));

        let reloaded = Timestream::load(ts.root()).unwrap();
        assert_eq!(reloaded.timestamps(), ts.timestamps());
        assert_eq!(reloaded.end(), Some(later));
    }

    #[test]
    fn test_increment_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut ts = Timestream::create(dir.path(), 1).unwrap();
        let mut img = TimestreamImage::new(t0()).with_pixels(RgbImage::new(1, 1));
        for n in 0..100 {
            match ts.write_image(&mut img, OverwriteMode::Increment).unwrap() {
                WriteOutcome::Written(p) => {
                    assert!(p.to_string_lossy().ends_with(&format!("_{:02}.PNG", n)))
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(matches!(
            ts.write_image(&mut img, OverwriteMode::Increment),
            Err(TimestreamError::TooManyImages { .. })
        ));
    }

    #[test]
    fn test_overwrite_mode_parse() {
        assert_eq!("increment".parse::<OverwriteMode>().unwrap(), OverwriteMode::Increment);
        assert!(matches!(
            "clobber".parse::<OverwriteMode>(),
            Err(TimestreamError::InvalidOverwriteMode(_))
        ));
    }

    #[test]
    fn test_image_and_pot_data_persist() {
        let dir = tempfile::tempdir().unwrap();
        let mut ts = Timestream::create(dir.path(), 1).unwrap();
        let mut img = TimestreamImage::new(t0()).with_pixels(RgbImage::new(1, 1));
        ts.write_image(&mut img, OverwriteMode::Overwrite).unwrap();
        ts.set_image_data(&t0(), DataValue::from("hello"));
        ts.save_image_data().unwrap();
        ts.write_pot_data(&t0(), &DataValue::Int(3)).unwrap();

        let reloaded = Timestream::load(dir.path()).unwrap();
        assert_eq!(reloaded.image_data(&t0()), Some(&DataValue::from("hello")));
        assert_eq!(reloaded.read_pot_data(&t0()).unwrap(), DataValue::Int(3));
    }
}
