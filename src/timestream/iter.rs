//! Iteration over a timestream by timepoint.

use crate::timestream::image::TimestreamImage;
use chrono::{Duration, NaiveDateTime, NaiveTime};
use std::collections::BTreeSet;

/// One expected timepoint.
#[derive(Debug, Clone)]
pub enum FrameSlot {
    /// An image exists at the timepoint.
    Image(TimestreamImage),
    /// No image at the timepoint.
    Missing(NaiveDateTime),
}

impl FrameSlot {
    /// Timestamp of the slot.
    pub fn datetime(&self) -> NaiveDateTime {
        match self {
            FrameSlot::Image(img) => img.datetime(),
            FrameSlot::Missing(dt) => *dt,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, FrameSlot::Missing(_))
    }
}

/// Options for [`Timestream::iter_by_timepoints`](crate::timestream::Timestream::iter_by_timepoints).
///
/// Unset bounds fall back to the archive's own start, end and interval.
#[derive(Debug, Clone, Default)]
pub struct TimepointQuery {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    /// Step in seconds.
    pub interval: Option<i64>,
    pub start_hour: Option<NaiveTime>,
    pub end_hour: Option<NaiveTime>,
    /// Timepoints already processed.
    pub skip: BTreeSet<NaiveDateTime>,
    /// Drop timepoints without an image instead of yielding `Missing`.
    pub remove_gaps: bool,
}

impl TimepointQuery {
    /// Query with gaps removed.
    pub fn new() -> Self {
        Self {
            remove_gaps: true,
            ..Self::default()
        }
    }

    pub fn with_start(mut self, start: NaiveDateTime) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_end(mut self, end: NaiveDateTime) -> Self {
        self.end = Some(end);
        self
    }

    /// Step in seconds.
    pub fn with_interval(mut self, seconds: i64) -> Self {
        self.interval = Some(seconds);
        self
    }

    /// Restrict to an intraday window (inclusive).
    pub fn with_hours(mut self, start: Option<NaiveTime>, end: Option<NaiveTime>) -> Self {
        self.start_hour = start;
        self.end_hour = end;
        self
    }

    pub fn with_skip(mut self, skip: BTreeSet<NaiveDateTime>) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_remove_gaps(mut self, remove_gaps: bool) -> Self {
        self.remove_gaps = remove_gaps;
        self
    }

    /// Whether the time of day falls inside the window.
    pub fn in_hours(&self, dt: &NaiveDateTime) -> bool {
        let t = dt.time();
        self.start_hour.map(|s| t >= s).unwrap_or(true) && self.end_hour.map(|e| t <= e).unwrap_or(true)
    }
}

/// Expected timepoints `start + k * step` within `[start, end]`.
pub fn timepoints(start: NaiveDateTime, end: NaiveDateTime, step_seconds: i64) -> Vec<NaiveDateTime> {
    let mut out = Vec::new();
    if step_seconds <= 0 || start > end {
        return out;
    }
    let step = Duration::seconds(step_seconds);
    let mut t = start;
    while t <= end {
        out.push(t);
        t += step;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2013, 10, 30).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_timepoints() {
        let pts = timepoints(at(3, 0), at(6, 0), 1800);
        assert_eq!(pts.len(), 7);
        assert_eq!(pts[6], at(6, 0));
        assert!(timepoints(at(6, 0), at(3, 0), 1800).is_empty());
        assert!(timepoints(at(3, 0), at(6, 0), 0).is_empty());
    }

    #[test]
    fn test_hour_window() {
        let q = TimepointQuery::new().with_hours(NaiveTime::from_hms_opt(4, 0, 0), NaiveTime::from_hms_opt(5, 0, 0));
        assert!(!q.in_hours(&at(3, 30)));
        assert!(q.in_hours(&at(4, 0)));
        assert!(q.in_hours(&at(5, 0)));
        assert!(!q.in_hours(&at(5, 30)));
    }
}
