//! Execution module.
//!
//! Runs frames through the prepared stages and fans pot segmentation out to
//! worker threads.

pub mod engine;
pub mod progress;
pub mod workers;

pub use engine::{outstream_root, PipelineRunner, RunOptions, RunSummary};
pub use progress::{ProgressCallback, ProgressTracker, ProgressUpdate, PROGRESS_TARGET};
pub use workers::{segment_parallel, SegmentJob, SegmentOutcome};
