//! Timestamp formatting and the v1 date-partitioned layout.

use crate::core::error::{TimestreamError, TimestreamResult};
use chrono::{Datelike, NaiveDateTime, Timelike};
use std::path::{Path, PathBuf};

/// Timestamp format used in file names, manifests and data keys.
pub const TS_FORMAT: &str = "%Y_%m_%d_%H_%M_%S";

/// Format a timestamp as `YYYY_MM_DD_HH_MM_SS`.
pub fn ts_format_date(dt: &NaiveDateTime) -> String {
    dt.format(TS_FORMAT).to_string()
}

/// Parse a `YYYY_MM_DD_HH_MM_SS` timestamp.
pub fn ts_parse_date(text: &str) -> TimestreamResult<NaiveDateTime> {
    let parts: Vec<&str> = text.split('_').collect();
    let well_formed = parts.len() == 6
        && parts[0].len() == 4
        && parts[1..].iter().all(|p| p.len() == 2)
        && parts.iter().all(|p| p.bytes().all(|b| b.is_ascii_digit()));
    if !well_formed {
        return Err(TimestreamError::InvalidTimestamp(text.to_string()));
    }
    NaiveDateTime::parse_from_str(text, TS_FORMAT)
        .map_err(|_| TimestreamError::InvalidTimestamp(text.to_string()))
}

/// Path of an image in a v1 archive:
/// `YYYY/YYYY_MM/YYYY_MM_DD/YYYY_MM_DD_HH/<name>_YYYY_MM_DD_HH_MM_SS_NN.<ext>`.
pub fn image_path(root: &Path, name: &str, dt: &NaiveDateTime, subsec: u8, ext: &str) -> PathBuf {
    root.join(format!("{:04}", dt.year()))
        .join(format!("{:04}_{:02}", dt.year(), dt.month()))
        .join(format!("{:04}_{:02}_{:02}", dt.year(), dt.month(), dt.day()))
        .join(format!(
            "{:04}_{:02}_{:02}_{:02}",
            dt.year(),
            dt.month(),
            dt.day(),
            dt.hour()
        ))
        .join(format!("{}_{}_{:02}.{}", name, ts_format_date(dt), subsec, ext))
}

/// Components of an image file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    /// Archive name prefix.
    pub name: String,
    pub datetime: NaiveDateTime,
    /// Sub-second counter, 0 when absent.
    pub subsec: u8,
    /// Extension without the dot, as found on disk.
    pub extension: String,
}

/// Parse `<name>_YYYY_MM_DD_HH_MM_SS[_NN].<ext>` from a path.
pub fn parse_image_path(path: &Path) -> Option<ImageName> {
    let extension = path.extension()?.to_str()?.to_string();
    let stem = path.file_stem()?.to_str()?;
    let parts: Vec<&str> = stem.split('_').collect();

    let try_split = |n_ts: usize| -> Option<ImageName> {
        if parts.len() <= n_ts {
            return None;
        }
        let (name_parts, ts_parts) = parts.split_at(parts.len() - n_ts);
        let datetime = ts_parse_date(&ts_parts[..6].join("_")).ok()?;
        let subsec = match ts_parts.get(6) {
            Some(s) if s.len() == 2 => s.parse().ok()?,
            Some(_) => return None,
            None => 0,
        };
        Some(ImageName {
            name: name_parts.join("_"),
            datetime,
            subsec,
            extension: extension.clone(),
        })
    };
    try_split(7).or_else(|| try_split(6))
}
