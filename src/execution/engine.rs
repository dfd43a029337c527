//! Pipeline runner.
//!
//! Builds the configured stages, binds them to a shared context and runs
//! every selected frame of the input timestream through them in order.

use crate::config::{GeneralConfig, OutstreamSpec, PipelineConfig};
use crate::core::context::{ExecutionContext, PipelineContext};
use crate::core::error::{FrameErrorKind, PipelineError, PipelineResult, StageError};
use crate::core::node::PipelineStage;
use crate::core::types::Value;
use crate::execution::progress::ProgressTracker;
use crate::stages::registry::StageRegistry;
use crate::timestream::{FrameSlot, Manifest, TimepointQuery, Timestream, TimestreamImage};
use crate::validation::{bind_arguments, PipelinePlan, ValidationPipeline};
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Process frames that every output timestream already holds.
    pub recalculate: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_recalculate(mut self, recalculate: bool) -> Self {
        self.recalculate = recalculate;
        self
    }
}

/// What a run did.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Frames that went through every stage.
    pub processed: usize,
    /// Dropped frames by error kind.
    pub dropped: IndexMap<FrameErrorKind, usize>,
    /// Timestamps skipped because the outputs already hold them.
    pub resumed: usize,
    /// Whether the run ended on a stop request.
    pub stopped: bool,
    pub duration: Duration,
}

impl RunSummary {
    fn record(&mut self, kind: FrameErrorKind) {
        *self.dropped.entry(kind).or_insert(0) += 1;
    }

    /// Total number of dropped frames.
    pub fn dropped_total(&self) -> usize {
        self.dropped.values().sum()
    }
}

/// Directory of an output timestream: `outpath` when given (relative to the
/// output root), otherwise `<outputPath>/<outputPrefix><name>`.
pub fn outstream_root(general: &GeneralConfig, spec: &OutstreamSpec) -> PathBuf {
    let root = general.output_path.clone().unwrap_or_else(|| PathBuf::from("."));
    match &spec.outpath {
        Some(path) if path.is_absolute() => path.clone(),
        Some(path) => root.join(path),
        None => root.join(format!(
            "{}{}",
            general.output_prefix.as_deref().unwrap_or(""),
            spec.name
        )),
    }
}

/// The prepared pipeline.
pub struct PipelineRunner {
    stages: Vec<Box<dyn PipelineStage>>,
    names: Vec<String>,
    context: PipelineContext,
    tracker: Arc<ProgressTracker>,
}

impl PipelineRunner {
    /// Validate the configuration, prepare every stage and open the output
    /// timestreams.
    ///
    /// Relative paths in stage arguments resolve against the input's `_data`
    /// directory.
    pub fn build(config: &PipelineConfig, registry: &StageRegistry, input: &Timestream) -> PipelineResult<Self> {
        let data_dir = input.data_dir();
        let plan = PipelinePlan::new(config, registry, &data_dir);
        let report = ValidationPipeline::default_pipeline().validate(&plan);
        for warning in &report.warnings {
            log::warn!("{}", warning.message);
        }
        if !report.can_execute() {
            for message in report.detailed_errors() {
                log::error!("{}", message);
            }
        }
        report.into_result()?;

        let mut stages = Vec::with_capacity(plan.stages.len());
        let mut names = Vec::with_capacity(plan.stages.len());
        for planned in &plan.stages {
            let Some(mut stage) = registry.create(&planned.spec.name) else {
                return Err(PipelineError::Other(format!("stage '{}' is not registered", planned.spec.name)));
            };
            let metadata = stage.metadata();
            let ctx = bind_arguments(&metadata, &planned.spec, planned.index, &data_dir)
                .map_err(|errors| errors.into_iter().next().map(PipelineError::from).unwrap_or_else(|| {
                    PipelineError::Other(format!("stage '{}' has invalid arguments", metadata.id))
                }))?;
            stage.prepare(&ctx)?;
            log::debug!("prepared stage {} ({})", planned.index, planned.spec);
            names.push(metadata.id);
            stages.push(stage);
        }

        let mut context = PipelineContext::new(config.general.clone(), data_dir);
        for spec in &config.outstreams {
            let root = outstream_root(&config.general, spec);
            let manifest =
                Manifest::new(spec.name.clone(), input.manifest().version, "PNG").with_interval(input.interval());
            let mut stream = Timestream::open_or_create(&root, manifest)?;
            // An existing output without an interval takes the input's.
            if let (None, Some(minutes)) = (stream.interval(), input.interval()) {
                stream.set_interval(minutes)?;
            }
            log::info!("output timestream '{}' at {}", spec.name, root.display());
            context.outstreams.insert(spec.name.clone(), stream);
        }

        Ok(Self {
            stages,
            names,
            context,
            tracker: Arc::new(ProgressTracker::logging()),
        })
    }

    /// Replace the progress tracker.
    pub fn with_tracker(mut self, tracker: Arc<ProgressTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Handle for requesting a stop from another thread.
    pub fn tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    /// Names of the prepared stages, in order.
    pub fn stage_names(&self) -> &[String] {
        &self.names
    }

    /// Timestamps every output timestream already holds.
    pub fn completed_timestamps(&self) -> BTreeSet<NaiveDateTime> {
        let mut streams = self.context.outstreams.values();
        let Some(first) = streams.next() else {
            return BTreeSet::new();
        };
        streams.fold(first.timestamps(), |done, stream| {
            done.intersection(&stream.timestamps()).copied().collect()
        })
    }

    /// Frame selection from the `general` section.
    pub fn query(&self, skip: BTreeSet<NaiveDateTime>) -> TimepointQuery {
        let general = &self.context.general;
        TimepointQuery {
            start: general.start_date,
            end: general.end_date,
            interval: general.time_interval.map(|s| s as i64),
            start_hour: general.start_hour_range,
            end_hour: general.end_hour_range,
            skip,
            remove_gaps: true,
        }
    }

    /// Run one frame through every stage.
    pub fn process_frame(&mut self, image: TimestreamImage) -> Result<(), StageError> {
        self.context.begin_frame();
        let mut values = vec![Value::Image(image)];
        for (stage, name) in self.stages.iter_mut().zip(&self.names) {
            let mut ctx = ExecutionContext::new(name.clone(), values, &mut self.context);
            stage.execute(&mut ctx)?;
            values = ctx.take_outputs();
        }
        Ok(())
    }

    /// Process every selected frame of `input`.
    ///
    /// Frame errors are logged and the run continues.
    pub fn run(&mut self, input: &Timestream, options: &RunOptions) -> PipelineResult<RunSummary> {
        let start = Instant::now();
        let mut summary = RunSummary::default();

        let skip = if options.recalculate {
            BTreeSet::new()
        } else {
            self.completed_timestamps()
        };
        if !skip.is_empty() {
            log::info!("{} timepoints already processed", skip.len());
        }
        let query = self.query(skip);
        let slots = input.iter_by_timepoints(&query);
        summary.resumed = query.skip.len();

        self.tracker.start(slots.len());
        for slot in slots {
            if self.tracker.is_cancelled() {
                summary.stopped = true;
                break;
            }
            let frame_start = Instant::now();
            let timestamp = crate::timestream::ts_format_date(&slot.datetime());
            let result = match slot {
                FrameSlot::Image(image) => self.process_frame(image),
                FrameSlot::Missing(_) => Err(StageError::new("runner", FrameErrorKind::Missing, "no image at timepoint")),
            };
            match result {
                Ok(()) => {
                    summary.processed += 1;
                    self.tracker
                        .frame_completed(timestamp, frame_start.elapsed().as_millis() as u64);
                }
                Err(e) => {
                    if e.is_recoverable() {
                        log::info!("{}: {}", timestamp, e);
                    } else {
                        log::error!("{}: {}", timestamp, e);
                    }
                    summary.record(e.kind);
                    self.tracker.frame_failed(timestamp, e.kind, e.message);
                }
            }
        }

        for (name, stream) in &self.context.outstreams {
            if let Err(e) = stream.save_image_data() {
                log::warn!("cannot save image data of '{}': {}", name, e);
            }
        }
        summary.duration = start.elapsed();
        self.tracker.complete();
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::NaiveDate;
    use image::{Rgb, RgbImage};

    fn dt(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2013, 10, 30).unwrap().and_hms_opt(hour, 0, 0).unwrap()
    }

    fn input(root: &std::path::Path, hours: &[u32]) -> Timestream {
        let mut ts = Timestream::create(root, 1).unwrap();
        for hour in hours {
            let mut img = TimestreamImage::new(dt(*hour)).with_pixels(RgbImage::from_pixel(8, 6, Rgb([90, 90, 90])));
            ts.write_image(&mut img, crate::timestream::OverwriteMode::Raise).unwrap();
        }
        ts.set_interval(60).unwrap();
        Timestream::load(root).unwrap()
    }

    fn config(yaml: &str) -> PipelineConfig {
        PipelineConfig::from_config(&Config::from_yaml_str(yaml).unwrap()).unwrap()
    }

    #[test]
    fn test_outstream_root() {
        let general = GeneralConfig {
            output_path: Some(PathBuf::from("/out")),
            output_prefix: Some("bvz-".into()),
            ..GeneralConfig::default()
        };
        let named = OutstreamSpec {
            name: "corrected".into(),
            outpath: None,
        };
        assert_eq!(outstream_root(&general, &named), PathBuf::from("/out/bvz-corrected"));
        let placed = OutstreamSpec {
            name: "corrected".into(),
            outpath: Some(PathBuf::from("cc")),
        };
        assert_eq!(outstream_root(&general, &placed), PathBuf::from("/out/cc"));
    }

    #[test]
    fn test_build_rejects_invalid_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let ts = input(&dir.path().join("in"), &[1]);
        let registry = StageRegistry::with_builtins();
        let result = PipelineRunner::build(&config("pipeline:\n  - name: colorcorrect\n"), &registry, &ts);
        assert!(matches!(result, Err(PipelineError::Validation(_))));
    }

    #[test]
    fn test_run_writes_then_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let ts = input(&dir.path().join("in"), &[1, 2, 3]);
        let out = dir.path().join("out");
        let yaml = format!(
            "pipeline:\n  - name: imagewrite\n    outstream: copy\noutstreams:\n  - name: copy\ngeneral:\n  outputPath: {}\n",
            out.display()
        );
        let registry = StageRegistry::with_builtins();

        let mut runner = PipelineRunner::build(&config(&yaml), &registry, &ts).unwrap();
        let summary = runner.run(&ts, &RunOptions::new()).unwrap();
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.dropped_total(), 0);
        assert_eq!(Timestream::load(out.join("copy")).unwrap().image_count(), 3);

        let mut again = PipelineRunner::build(&config(&yaml), &registry, &ts).unwrap();
        let summary = again.run(&ts, &RunOptions::new()).unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.resumed, 3);

        let summary = again.run(&ts, &RunOptions::new().with_recalculate(true)).unwrap();
        assert_eq!(summary.processed, 3);
        assert_eq!(Timestream::load(out.join("copy")).unwrap().image_count(), 3);
    }

    #[test]
    fn test_outstream_keeps_input_timing() {
        let dir = tempfile::tempdir().unwrap();
        let ts = input(&dir.path().join("in"), &[1, 2, 3]);
        let out = dir.path().join("out");
        // An earlier output archive with no interval in its manifest.
        Timestream::create_with(out.join("copy"), Manifest::new("copy", 1, "PNG")).unwrap();
        let yaml = format!(
            "pipeline:\n  - name: imagewrite\n    outstream: copy\noutstreams:\n  - name: copy\ngeneral:\n  outputPath: {}\n",
            out.display()
        );
        let registry = StageRegistry::with_builtins();
        let mut runner = PipelineRunner::build(&config(&yaml), &registry, &ts).unwrap();
        runner.run(&ts, &RunOptions::new()).unwrap();

        let copy = Timestream::load(out.join("copy")).unwrap();
        assert_eq!(copy.interval(), Some(60));
        assert_eq!(copy.start(), Some(dt(1)));
        assert_eq!(copy.end(), Some(dt(3)));
        let slots = copy.iter_by_timepoints(&TimepointQuery::new());
        let times: Vec<NaiveDateTime> = slots.iter().map(|s| s.datetime()).collect();
        assert_eq!(times, vec![dt(1), dt(2), dt(3)]);
        assert!(slots.iter().all(|s| !s.is_missing()));
    }

    #[test]
    fn test_stop_before_first_frame() {
        let dir = tempfile::tempdir().unwrap();
        let ts = input(&dir.path().join("in"), &[1, 2]);
        let yaml = format!(
            "pipeline:\n  - name: imagewrite\n    outstream: copy\noutstreams:\n  - name: copy\ngeneral:\n  outputPath: {}\n",
            dir.path().join("out").display()
        );
        let registry = StageRegistry::with_builtins();
        let mut runner = PipelineRunner::build(&config(&yaml), &registry, &ts)
            .unwrap()
            .with_tracker(ProgressTracker::new_shared());
        runner.tracker().cancel();
        let summary = runner.run(&ts, &RunOptions::new()).unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.processed, 0);
    }
}
