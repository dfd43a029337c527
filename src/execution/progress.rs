//! Progress tracking for a pipeline run.
//!
//! The tracker also carries the cooperative stop flag: the runner checks it
//! between frames, so a stop requested mid-frame lets that frame finish.

use crate::core::error::FrameErrorKind;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Log target for self-overwriting progress lines.
pub const PROGRESS_TARGET: &str = "progress";

/// A progress update event.
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    /// The run has started.
    Started { total_frames: usize },
    /// A frame has completed all stages.
    FrameCompleted {
        timestamp: String,
        duration_ms: u64,
        index: usize,
        total: usize,
    },
    /// A frame was dropped.
    FrameFailed {
        timestamp: String,
        kind: FrameErrorKind,
        message: String,
    },
    /// Overall progress percentage.
    Progress {
        percent: f32,
        elapsed_ms: u64,
        estimated_remaining_ms: Option<u64>,
    },
    /// The run has completed.
    Completed {
        total_duration_ms: u64,
        frames_processed: usize,
        frames_failed: usize,
    },
    /// A stop was requested.
    Cancelled,
}

/// Callback type for progress updates.
pub type ProgressCallback = Box<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Tracks run progress and allows stopping between frames.
pub struct ProgressTracker {
    /// Number of frames the run will visit.
    total_frames: AtomicUsize,
    completed_frames: AtomicUsize,
    failed_frames: AtomicUsize,
    cancelled: AtomicBool,
    start_time: Mutex<Option<Instant>>,
    callback: Option<ProgressCallback>,
    /// Frame durations for estimation.
    frame_times: Mutex<Vec<u64>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            total_frames: AtomicUsize::new(0),
            completed_frames: AtomicUsize::new(0),
            failed_frames: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            start_time: Mutex::new(None),
            callback: None,
            frame_times: Mutex::new(Vec::new()),
        }
    }

    /// A tracker that reports through the `progress` log target.
    pub fn logging() -> Self {
        Self::new().with_callback(Box::new(log_update))
    }

    /// Create a progress tracker wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Set a callback for progress updates.
    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Start tracking a run over `total_frames` frames.
    pub fn start(&self, total_frames: usize) {
        self.total_frames.store(total_frames, Ordering::Relaxed);
        self.completed_frames.store(0, Ordering::Relaxed);
        self.failed_frames.store(0, Ordering::Relaxed);
        self.frame_times.lock().clear();
        *self.start_time.lock() = Some(Instant::now());
        self.send_update(ProgressUpdate::Started { total_frames });
    }

    /// Report that a frame went through every stage.
    pub fn frame_completed(&self, timestamp: String, duration_ms: u64) {
        let index = self.completed_frames.fetch_add(1, Ordering::Relaxed) + 1;
        self.frame_times.lock().push(duration_ms);
        self.send_update(ProgressUpdate::FrameCompleted {
            timestamp,
            duration_ms,
            index,
            total: self.total_frames.load(Ordering::Relaxed),
        });
        self.send_progress_update();
    }

    /// Report that a frame was dropped.
    pub fn frame_failed(&self, timestamp: String, kind: FrameErrorKind, message: String) {
        self.failed_frames.fetch_add(1, Ordering::Relaxed);
        self.send_update(ProgressUpdate::FrameFailed {
            timestamp,
            kind,
            message,
        });
        self.send_progress_update();
    }

    /// Check if a stop was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Request a stop after the current frame.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.send_update(ProgressUpdate::Cancelled);
    }

    /// Clear a previous stop request.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Relaxed);
    }

    /// Complete tracking.
    pub fn complete(&self) {
        self.send_update(ProgressUpdate::Completed {
            total_duration_ms: self.elapsed_ms(),
            frames_processed: self.completed_frames.load(Ordering::Relaxed),
            frames_failed: self.failed_frames.load(Ordering::Relaxed),
        });
    }

    /// Get current progress percentage.
    pub fn progress_percent(&self) -> f32 {
        let total = self.total_frames.load(Ordering::Relaxed);
        if total == 0 {
            return 100.0;
        }
        let done = self.completed_frames.load(Ordering::Relaxed) + self.failed_frames.load(Ordering::Relaxed);
        (done as f32 / total as f32) * 100.0
    }

    /// Estimate remaining time in milliseconds.
    pub fn estimated_remaining_ms(&self) -> Option<u64> {
        let times = self.frame_times.lock();
        if times.is_empty() {
            return None;
        }
        let avg_time: u64 = times.iter().sum::<u64>() / times.len() as u64;
        let done = self.completed_frames.load(Ordering::Relaxed) + self.failed_frames.load(Ordering::Relaxed);
        let remaining = self.total_frames.load(Ordering::Relaxed).saturating_sub(done);
        Some(avg_time * remaining as u64)
    }

    fn elapsed_ms(&self) -> u64 {
        let start = *self.start_time.lock();
        start.map(|t| t.elapsed().as_millis() as u64).unwrap_or(0)
    }

    fn send_update(&self, update: ProgressUpdate) {
        if let Some(ref callback) = self.callback {
            callback(&update);
        }
    }

    fn send_progress_update(&self) {
        self.send_update(ProgressUpdate::Progress {
            percent: self.progress_percent(),
            elapsed_ms: self.elapsed_ms(),
            estimated_remaining_ms: self.estimated_remaining_ms(),
        });
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn log_update(update: &ProgressUpdate) {
    match update {
        ProgressUpdate::Started { total_frames } => log::info!("processing {} frames", total_frames),
        ProgressUpdate::FrameCompleted {
            timestamp,
            duration_ms,
            index,
            total,
        } => log::debug!("frame {} ({}/{}) done in {} ms", timestamp, index, total, duration_ms),
        ProgressUpdate::FrameFailed { .. } => {}
        ProgressUpdate::Progress {
            percent,
            estimated_remaining_ms,
            ..
        } => {
            let eta = estimated_remaining_ms
                .map(|ms| format!(", about {}s left", ms / 1000))
                .unwrap_or_default();
            log::info!(target: PROGRESS_TARGET, "{:5.1}% done{}", percent, eta);
        }
        ProgressUpdate::Completed {
            total_duration_ms,
            frames_processed,
            frames_failed,
        } => log::info!(
            "finished: {} frames processed, {} dropped in {:.1}s",
            frames_processed,
            frames_failed,
            *total_duration_ms as f64 / 1000.0
        ),
        ProgressUpdate::Cancelled => log::warn!("stop requested, finishing the current frame"),
    }
}
