//! Worker pool for per-pot segmentation.
//!
//! Each job owns a copy of its pot image and previous mask, so workers share
//! nothing mutable. Results come back over a channel as raw mask bytes and
//! a panicking or failing job turns into an error for that pot only.

use crate::pots::{segment_pot, Segmenter};
use crossbeam::channel;
use image::{GrayImage, RgbImage};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// One pot to segment.
#[derive(Debug, Clone)]
pub struct SegmentJob {
    pub id: u32,
    pub image: RgbImage,
    pub previous: Option<GrayImage>,
}

/// Mask bytes (row-major, 0/1) or the reason segmentation failed.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentOutcome {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub result: Result<Vec<u8>, String>,
}

impl SegmentOutcome {
    /// The mask as an image.
    pub fn into_mask(self) -> Result<GrayImage, String> {
        let (w, h) = (self.width, self.height);
        let bytes = self.result?;
        GrayImage::from_raw(w, h, bytes).ok_or_else(|| format!("pot {}: mask has the wrong length", self.id))
    }
}

fn run_job(segmenter: &dyn Segmenter, job: &SegmentJob) -> Result<Vec<u8>, String> {
    catch_unwind(AssertUnwindSafe(|| {
        segment_pot(segmenter, &job.image, job.previous.as_ref())
    }))
    .map_err(|panic| {
        panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "segmentation worker panicked".to_string())
    })?
    .map(GrayImage::into_raw)
    .map_err(|e| e.to_string())
}

/// Segment all jobs on `workers` threads (0 uses rayon's default).
///
/// Outcomes are returned in ascending pot id order.
pub fn segment_parallel(segmenter: Arc<dyn Segmenter>, jobs: Vec<SegmentJob>, workers: usize) -> Vec<SegmentOutcome> {
    let (tx, rx) = channel::unbounded();
    let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build();

    let dispatch = |jobs: Vec<SegmentJob>| {
        rayon::scope(|s| {
            for job in jobs {
                let tx = tx.clone();
                let segmenter = Arc::clone(&segmenter);
                s.spawn(move |_| {
                    let outcome = SegmentOutcome {
                        id: job.id,
                        width: job.image.width(),
                        height: job.image.height(),
                        result: run_job(segmenter.as_ref(), &job),
                    };
                    // The receiver outlives the scope.
                    let _ = tx.send(outcome);
                });
            }
        });
    };
    match pool {
        Ok(pool) => pool.install(|| dispatch(jobs)),
        Err(e) => {
            log::warn!("cannot build worker pool ({}), using the global pool", e);
            dispatch(jobs)
        }
    }
    drop(tx);

    let mut outcomes: Vec<SegmentOutcome> = rx.iter().collect();
    outcomes.sort_by_key(|o| o.id);
    outcomes
}
