//! End-to-end runs over a synthetic timestream with two trays.

use chrono::{NaiveDate, NaiveDateTime};
use image::{Rgb, RgbImage};
use phenostream::core::data::dejsonify_data;
use phenostream::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};

fn dt(hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2013, 10, 30)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

fn blocky(w: u32, h: u32, seed: u64) -> RgbImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let bw = w.div_ceil(4);
    let blocks: Vec<[u8; 3]> = (0..bw * h.div_ceil(4)).map(|_| rng.gen()).collect();
    RgbImage::from_fn(w, h, |x, y| Rgb(blocks[((y / 4) * bw + x / 4) as usize]))
}

fn paste(dst: &mut RgbImage, src: &RgbImage, x0: u32, y0: u32) {
    for (x, y, p) in src.enumerate_pixels() {
        dst.put_pixel(x0 + x, y0 + y, *p);
    }
}

/// Three complete frames (hours 1-3) and one frame missing its second
/// tray (hour 4).
fn fixture(root: &Path) -> Timestream {
    let mut ts = Timestream::create(root, 1).unwrap();
    for hour in 1..=4 {
        let mut pixels = blocky(256, 112, 99);
        paste(&mut pixels, &blocky(96, 64, 1), 16, 24);
        if hour < 4 {
            paste(&mut pixels, &blocky(96, 64, 2), 144, 24);
        }
        let mut img = TimestreamImage::new(dt(hour)).with_pixels(pixels);
        ts.write_image(&mut img, OverwriteMode::Raise).unwrap();
    }
    ts.set_interval(60).unwrap();
    blocky(96, 64, 1).save(ts.data_dir().join("tray_0.png")).unwrap();
    blocky(96, 64, 2).save(ts.data_dir().join("tray_1.png")).unwrap();
    Timestream::load(root).unwrap()
}

fn pipeline_yaml(out: &Path, writer: &str) -> String {
    format!(
        r#"
pipeline:
  - name: traydetect
    trayFiles: ["tray_*.png"]
    trayPositions: [[60, 60], [196, 52]]
    searchRadius: [24, 16]
    pyramidLevels: 3
  - name: potdetect
    pyramidLevels: 3
  - name: plantextract
    attempts: 2
  - name: featureextract
    features: [area, height]
  - name: {writer}
  - name: imagewrite
    outstream: segmented
outstreams:
  - name: segmented
general:
  outputPath: {out}
  outputPrefix: exp-
"#,
        writer = writer,
        out = out.display()
    )
}

fn build(yaml: &str, input: &Timestream) -> PipelineRunner {
    let config = PipelineConfig::from_config(&Config::from_yaml_str(yaml).unwrap()).unwrap();
    PipelineRunner::build(&config, &StageRegistry::with_builtins(), input)
        .unwrap()
        .with_tracker(ProgressTracker::new_shared())
}

struct Fixture {
    _dir: tempfile::TempDir,
    input: Timestream,
    out: PathBuf,
}

fn setup() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let input = fixture(&dir.path().join("BVZ0036-GC02L"));
    let out = dir.path().join("out");
    Fixture { _dir: dir, input, out }
}

#[test]
fn full_pipeline_writes_every_output() {
    let fx = setup();
    let mut runner = build(&pipeline_yaml(&fx.out, "writefeatures_csv"), &fx.input);
    let summary = runner.run(&fx.input, &RunOptions::new()).unwrap();

    assert_eq!(summary.processed, 3);
    assert_eq!(summary.dropped.get(&FrameErrorKind::Fatal), Some(&1));

    let segmented = Timestream::load(fx.out.join("exp-segmented")).unwrap();
    assert_eq!(segmented.image_count(), 3);
    assert!(!segmented.timestamps().contains(&dt(4)));
    assert_eq!(segmented.interval(), Some(60));
    let slots = segmented.iter_by_timepoints(&TimepointQuery::new());
    assert_eq!(slots.len(), 3);
    assert!(slots.iter().all(|s| matches!(s, FrameSlot::Image(_))));
    let times: Vec<NaiveDateTime> = slots.iter().map(|s| s.datetime()).collect();
    assert_eq!(times, vec![dt(1), dt(2), dt(3)]);
    // Hour 4 was dropped, so an explicit query past the end finds a gap.
    let gaps = segmented.iter_by_timepoints(&TimepointQuery {
        end: Some(dt(4)),
        remove_gaps: false,
        ..TimepointQuery::default()
    });
    assert!(gaps.last().map(|s| s.is_missing() && s.datetime() == dt(4)).unwrap_or(false));

    let pots = PotMatrix::from_data(&segmented.read_pot_data(&dt(2)).unwrap(), None).unwrap();
    assert_eq!(pots.len(), 40);
    assert!(pots.iter().all(|p| p.cached_mask().is_some()));
    let trays = segmented.image_data(&dt(2)).and_then(|d| d.get("trayLocations"));
    assert_eq!(trays.and_then(|t| t.as_list()).map(|l| l.len()), Some(2));

    for feature in ["area", "height"] {
        let text = fs::read_to_string(fx.out.join("features").join(format!("exp-{}.csv", feature))).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4, "{}", text);
        assert_eq!(lines[0].split(',').count(), 41);
        assert!(lines[1].starts_with("2013_10_30_01_00_00,"));
        assert!(lines[3].starts_with("2013_10_30_03_00_00,"));
    }
}

#[test]
fn rerun_without_recalculate_changes_nothing() {
    let fx = setup();
    let yaml = pipeline_yaml(&fx.out, "writefeatures_csv");
    build(&yaml, &fx.input).run(&fx.input, &RunOptions::new()).unwrap();
    let csv = fx.out.join("features").join("exp-area.csv");
    let before = fs::read_to_string(&csv).unwrap();

    let summary = build(&yaml, &fx.input).run(&fx.input, &RunOptions::new()).unwrap();
    assert_eq!(summary.resumed, 3);
    assert_eq!(summary.processed, 0);
    // The frame with a missing tray is retried and dropped again.
    assert_eq!(summary.dropped_total(), 1);
    assert_eq!(fs::read_to_string(&csv).unwrap(), before);
    assert_eq!(Timestream::load(fx.out.join("exp-segmented")).unwrap().image_count(), 3);
}

#[test]
fn ndarray_writer_builds_feature_tensor() {
    let fx = setup();
    let mut runner = build(&pipeline_yaml(&fx.out, "writefeatures_ndarray"), &fx.input);
    runner.run(&fx.input, &RunOptions::new()).unwrap();

    let text = fs::read_to_string(fx.out.join("features").join("exp-features.json")).unwrap();
    let data = dejsonify_data(&serde_json::from_str(&text).unwrap()).unwrap();
    let features: Vec<&str> = data
        .get("features")
        .and_then(|f| f.as_list())
        .unwrap()
        .iter()
        .filter_map(|f| f.as_str())
        .collect();
    assert_eq!(features, vec!["area", "height"]);
    let tensor = data.get("data").and_then(|d| d.as_array()).unwrap();
    assert_eq!(tensor.shape(), &[2, 40, 3]);
}

#[test]
fn invalid_configuration_is_rejected_before_any_frame() {
    let fx = setup();
    let yaml = pipeline_yaml(&fx.out, "writefeatures_csv").replace("outstream: segmented", "outstream: missing");
    let config = PipelineConfig::from_config(&Config::from_yaml_str(&yaml).unwrap()).unwrap();
    let result = PipelineRunner::build(&config, &StageRegistry::with_builtins(), &fx.input);
    assert!(matches!(
        result,
        Err(PipelineError::Validation(ValidationError::UnknownOutstream { .. }))
    ));
    assert!(!fx.out.join("features").exists());
}
