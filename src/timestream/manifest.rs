//! The archive manifest.
//!
//! Stored as `manifest.json` at the archive root. `*.tsm` (JSON) and
//! `manifest.yml` are accepted when reading. Validation is strict: unknown
//! keys, versions other than 1 and 2, unknown extensions or image types and
//! non-positive intervals are all rejected.

use crate::core::error::{TimestreamError, TimestreamResult};
use crate::timestream::path::{ts_format_date, ts_parse_date};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name written for new archives.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Accepted image extensions (compared case-insensitively).
pub const EXTENSIONS: &[&str] = &["JPG", "PNG", "CR2", "NEF", "TIF", "TIFF"];

/// Accepted image type tags.
pub const IMAGE_TYPES: &[&str] = &["jpg", "png", "raw"];

/// Manifest as written on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    name: String,
    version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_datetime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_datetime: Option<String>,
    image_type: String,
    extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    interval: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    missing: Vec<String>,
}

/// Validated manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub name: String,
    pub version: u8,
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub image_type: String,
    /// Upper-case extension without the dot.
    pub extension: String,
    /// Sampling interval in minutes.
    pub interval: Option<i64>,
    pub missing: Vec<NaiveDateTime>,
}

/// Image type tag implied by an extension.
pub fn image_type_for(extension: &str) -> &'static str {
    match extension.to_ascii_uppercase().as_str() {
        "JPG" => "jpg",
        "PNG" => "png",
        _ => "raw",
    }
}

impl Manifest {
    /// A manifest for an empty archive.
    pub fn new(name: impl Into<String>, version: u8, extension: &str) -> Self {
        Self {
            name: name.into(),
            version,
            start: None,
            end: None,
            image_type: image_type_for(extension).to_string(),
            extension: extension.to_ascii_uppercase(),
            interval: None,
            missing: Vec::new(),
        }
    }

    /// Set the sampling interval in minutes.
    pub fn with_interval(mut self, minutes: Option<i64>) -> Self {
        self.interval = minutes;
        self
    }

    /// Find the manifest file of an archive, if any.
    pub fn locate(root: &Path) -> Option<PathBuf> {
        let json = root.join(MANIFEST_FILE);
        if json.is_file() {
            return Some(json);
        }
        let mut tsm: Vec<PathBuf> = std::fs::read_dir(root)
            .ok()?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == "tsm").unwrap_or(false))
            .collect();
        tsm.sort();
        if let Some(p) = tsm.into_iter().next() {
            return Some(p);
        }
        let yml = root.join("manifest.yml");
        yml.is_file().then_some(yml)
    }

    /// Read and validate a manifest file.
    pub fn read(path: &Path) -> TimestreamResult<Self> {
        let invalid = |reason: String| TimestreamError::ManifestInvalid {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let is_yaml = path
            .extension()
            .map(|e| e == "yml" || e == "yaml")
            .unwrap_or(false);
        let raw: RawManifest = if is_yaml {
            serde_yml::from_str(&text).map_err(|e| invalid(e.to_string()))?
        } else {
            serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))?
        };
        Self::from_raw(raw).map_err(invalid)
    }

    fn from_raw(raw: RawManifest) -> Result<Self, String> {
        if !(1..=2).contains(&raw.version) {
            return Err(format!("version {} is not 1 or 2", raw.version));
        }
        let extension = raw.extension.to_ascii_uppercase();
        if !EXTENSIONS.contains(&extension.as_str()) {
            return Err(format!("extension '{}' is not one of {:?}", raw.extension, EXTENSIONS));
        }
        if !IMAGE_TYPES.contains(&raw.image_type.as_str()) {
            return Err(format!(
                "image_type '{}' is not one of {:?}",
                raw.image_type, IMAGE_TYPES
            ));
        }
        if let Some(interval) = raw.interval {
            if interval <= 0 {
                return Err(format!("interval {} must be positive", interval));
            }
        }
        let parse = |s: &str| ts_parse_date(s).map_err(|e| e.to_string());
        let start = raw.start_datetime.as_deref().map(parse).transpose()?;
        let end = raw.end_datetime.as_deref().map(parse).transpose()?;
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(format!("start {} is after end {}", s, e));
            }
        }
        let missing = raw
            .missing
            .iter()
            .map(|s| parse(s.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: raw.name,
            version: raw.version as u8,
            start,
            end,
            image_type: raw.image_type,
            extension,
            interval: raw.interval,
            missing,
        })
    }

    /// Write as JSON to `<root>/manifest.json`.
    pub fn write(&self, root: &Path) -> TimestreamResult<()> {
        let raw = RawManifest {
            name: self.name.clone(),
            version: self.version as i64,
            start_datetime: self.start.as_ref().map(ts_format_date),
            end_datetime: self.end.as_ref().map(ts_format_date),
            image_type: self.image_type.clone(),
            extension: self.extension.clone(),
            interval: self.interval,
            missing: self.missing.iter().map(ts_format_date).collect(),
        };
        let text = serde_json::to_string_pretty(&raw)?;
        std::fs::write(root.join(MANIFEST_FILE), text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, text).unwrap();
        p
    }

    #[test]
    fn test_read_valid_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(
            dir.path(),
            "manifest.json",
            r#"{"name": "cam", "version": 1, "start_datetime": "2013_10_30_03_00_00",
                "end_datetime": "2013_10_30_06_00_00", "image_type": "jpg",
                "extension": "JPG", "interval": 30, "missing": ["2013_10_30_04_30_00"]}"#,
        );
        let m = Manifest::read(&p).unwrap();
        assert_eq!(m.name, "cam");
        assert_eq!(m.interval, Some(30));
        assert_eq!(m.missing.len(), 1);
        assert_eq!(Manifest::locate(dir.path()), Some(p));
    }

    #[test]
    fn test_strict_validation() {
        let dir = tempfile::tempdir().unwrap();
        let cases = [
            r#"{"name": "cam", "version": 3, "image_type": "jpg", "extension": "JPG"}"#,
            r#"{"name": "cam", "version": 1, "image_type": "jpg", "extension": "BMP"}"#,
            r#"{"name": "cam", "version": 1, "image_type": "gif", "extension": "JPG"}"#,
            r#"{"name": "cam", "version": 1, "image_type": "jpg", "extension": "JPG", "interval": 0}"#,
            r#"{"name": "cam", "version": 1, "image_type": "jpg", "extension": "JPG", "colour": "red"}"#,
            r#"{"name": "cam", "version": 1, "image_type": "jpg", "extension": "JPG",
                "start_datetime": "2013_10_30_06_00_00", "end_datetime": "2013_10_30_03_00_00"}"#,
            "not json",
        ];
        for (i, text) in cases.iter().enumerate() {
            let p = write(dir.path(), &format!("m{}.json", i), text);
            assert!(
                matches!(Manifest::read(&p), Err(TimestreamError::ManifestInvalid { .. })),
                "case {} accepted",
                i
            );
        }
    }

    #[test]
    fn test_write_read_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = Manifest::new("out", 1, "png");
        m.interval = Some(15);
        m.write(dir.path()).unwrap();
        assert_eq!(Manifest::read(&dir.path().join(MANIFEST_FILE)).unwrap(), m);

        let yml = write(
            dir.path(),
            "manifest.yml",
            "name: cam\nversion: 2\nimage_type: raw\nextension: CR2\ninterval: 60\n",
        );
        let m = Manifest::read(&yml).unwrap();
        assert_eq!(m.version, 2);
        assert_eq!(m.extension, "CR2");
    }
}
