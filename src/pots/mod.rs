//! Pots: rectangles, per-pot segmentation and features, and the per-frame
//! pot matrix that keeps pot identity across frames.

pub mod features;
pub mod handler;
pub mod matrix;
pub mod rect;
pub mod segmenter;

pub use features::{FeatureValue, FEATURES};
pub use handler::{segment_pot, MetaValue, PotHandler};
pub use matrix::{PotMatrix, PotSpec};
pub use rect::PotRect;
pub use segmenter::{KMeansSegmenter, SegmentHints, Segmenter};

use crate::core::data::DataValue;
use crate::core::error::{PotError, PotResult};

/// Rows of pots in a tray.
pub const TRAY_ROWS: usize = 4;
/// Columns of pots in a tray.
pub const TRAY_COLUMNS: usize = 5;
/// Pots in a tray.
pub const POTS_PER_TRAY: usize = TRAY_ROWS * TRAY_COLUMNS;

/// Chamber-wide pot index of a tray position such as `"16D4"`.
///
/// Positions are `<tray><row A-D><column 1-5>`; the index is
/// `(tray - 1) * 20 + row * 5 + column`, so `"1A1"` is 1.
pub fn traypos_to_chamber_index(traypos: &str) -> PotResult<u32> {
    let malformed = || PotError::Malformed(format!("tray position '{}'", traypos));
    let split = traypos
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(malformed)?;
    let (tray, rest) = traypos.split_at(split);
    let mut rest = rest.chars();
    let row = rest.next().ok_or_else(malformed)?.to_ascii_uppercase();
    let col: String = rest.collect();

    let tray: u32 = tray.parse().map_err(|_| malformed())?;
    let col: u32 = col.parse().map_err(|_| malformed())?;
    let row = match row {
        'A'..='D' => row as u32 - 'A' as u32,
        _ => return Err(malformed()),
    };
    if tray == 0 || !(1..=TRAY_COLUMNS as u32).contains(&col) {
        return Err(malformed());
    }
    Ok((tray - 1) * POTS_PER_TRAY as u32 + row * TRAY_COLUMNS as u32 + col)
}

/// [`traypos_to_chamber_index`] over a stored value; non-strings are rejected.
pub fn traypos_value_to_chamber_index(value: &DataValue) -> PotResult<u32> {
    match value {
        DataValue::String(s) => traypos_to_chamber_index(s),
        other => Err(PotError::Malformed(format!(
            "tray position must be a string, got {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traypos_boundaries() {
        assert_eq!(traypos_to_chamber_index("1A1").unwrap(), 1);
        assert_eq!(traypos_to_chamber_index("01A1").unwrap(), 1);
        assert_eq!(traypos_to_chamber_index("09A1").unwrap(), 161);
        assert_eq!(traypos_to_chamber_index("16D4").unwrap(), 319);
        assert_eq!(traypos_to_chamber_index("2b3").unwrap(), 28);
        for bad in ["24A33", "1E1", "A1", "1A", "0A1", "1A0", ""] {
            assert!(traypos_to_chamber_index(bad).is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn test_traypos_rejects_non_strings() {
        assert!(traypos_value_to_chamber_index(&DataValue::Int(11)).is_err());
        assert_eq!(
            traypos_value_to_chamber_index(&DataValue::from("1A2")).unwrap(),
            2
        );
    }
}
