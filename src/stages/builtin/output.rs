//! Writers: feature tables, the feature tensor and output timestreams.

use super::{frame_pixels, POT_MATRIX_KEY};
use crate::core::context::{ExecutionContext, FrameArtifact, PipelineContext, ValidationContext};
use crate::core::data::{dejsonify_data, jsonify_data, DataValue, NdArray};
use crate::core::error::{StageError, ValidationError};
use crate::core::node::{Category, PipelineStage, StageMetadata};
use crate::core::port::{ArgType, Constraint, ParameterDefinition};
use crate::core::types::{PortType, Value};
use crate::pots::PotMatrix;
use crate::stages::registry::StageRegistry;
use crate::timestream::{ts_format_date, OverwriteMode, WriteOutcome};
use indexmap::IndexMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Register output stages.
pub fn register(registry: &mut StageRegistry) {
    registry.register(|| Box::new(WriteFeaturesCsv::default()));
    registry.register(|| Box::new(WriteFeaturesNdarray::default()));
    registry.register(|| Box::new(ImageWrite::default()));
}

fn outdir_parameter() -> ParameterDefinition {
    ParameterDefinition::new("outdir", ArgType::String, "features")
        .with_description("Directory for the output, relative to general.outputPath")
        .with_constraint(Constraint::NotEmpty)
}

fn resolve_outdir(pipeline: &PipelineContext, outdir: &str) -> PathBuf {
    let path = Path::new(outdir);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        pipeline.output_root().join(path)
    }
}

// ============================================================================
// CSV tables
// ============================================================================

/// Appends one row per frame to `<prefix><feature>.csv` for every computed
/// feature.
///
/// Columns are the pot ids in ascending order. A pot first seen in a later
/// frame adds a column and earlier rows get NaN for it. Rows for timestamps
/// already in a file are not written again.
#[derive(Debug, Default)]
pub struct WriteFeaturesCsv {
    outdir: String,
}

/// Append a row unless `stamp` is already present; returns whether a row
/// was written.
fn append_csv_row(path: &Path, matrix: &PotMatrix, feature: &str, stamp: &str) -> io::Result<bool> {
    let existing = match fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => Some(text),
        Ok(_) => None,
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };

    let (ids, header) = match existing {
        Some(text) => {
            let mut lines = text.lines();
            let known: Vec<u32> = lines
                .next()
                .unwrap_or_default()
                .split(',')
                .skip(1)
                .filter_map(|id| id.trim().parse().ok())
                .collect();
            let rows: Vec<&str> = lines.collect();
            if rows.iter().any(|line| line.split(',').next() == Some(stamp)) {
                return Ok(false);
            }
            let added: Vec<u32> = matrix.ids().filter(|id| !known.contains(id)).collect();
            if added.is_empty() {
                (known, false)
            } else {
                log::info!("{}: adding columns for pots {:?}", path.display(), added);
                let mut ids = known.clone();
                ids.extend(added);
                ids.sort_unstable();
                rewrite_csv_columns(path, &known, &ids, &rows)?;
                (ids, false)
            }
        }
        None => (matrix.ids().collect(), true),
    };

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if header {
        writeln!(file, "{}", csv_header(&ids))?;
    }
    let cells: Vec<String> = ids
        .iter()
        .map(|id| {
            matrix
                .get(*id)
                .and_then(|pot| pot.features().get(feature))
                .map(|v| v.to_string())
                .unwrap_or_else(|| "NaN".to_string())
        })
        .collect();
    writeln!(file, "{},{}", stamp, cells.join(","))?;
    Ok(true)
}

fn csv_header(ids: &[u32]) -> String {
    let ids: Vec<String> = ids.iter().map(u32::to_string).collect();
    format!("timestamp,{}", ids.join(","))
}

/// Rewrite a table whose rows follow `known` columns so they follow `ids`.
fn rewrite_csv_columns(path: &Path, known: &[u32], ids: &[u32], rows: &[&str]) -> io::Result<()> {
    let mut text = csv_header(ids);
    text.push('\n');
    for row in rows.iter().filter(|r| !r.trim().is_empty()) {
        let mut cells = row.split(',');
        let stamp = cells.next().unwrap_or_default();
        let values: IndexMap<u32, &str> = known.iter().copied().zip(cells).collect();
        let widened: Vec<&str> = ids.iter().map(|id| values.get(id).copied().unwrap_or("NaN")).collect();
        text.push_str(&format!("{},{}\n", stamp, widened.join(",")));
    }
    let tmp = path.with_extension("csv.tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)
}

impl PipelineStage for WriteFeaturesCsv {
    fn metadata(&self) -> StageMetadata {
        StageMetadata::builder("writefeatures_csv")
            .category(Category::Output)
            .description("Append pot features to one CSV table per feature")
            .expects(&[PortType::Image, PortType::PotMatrix])
            .returns(&[PortType::Image])
            .parameter(outdir_parameter())
            .build()
    }

    fn prepare(&mut self, ctx: &ValidationContext) -> Result<(), ValidationError> {
        self.outdir = ctx.get_str("outdir")?.to_string();
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), StageError> {
        let image = ctx.take_image()?;
        let matrix = ctx.take_pot_matrix()?;
        let dir = resolve_outdir(ctx.pipeline, &self.outdir);
        let stamp = image.timestamp_string();
        let io_error = |e: io::Error| StageError::failed(&ctx.stage, format!("{}: {}", dir.display(), e));

        fs::create_dir_all(&dir).map_err(io_error)?;
        for feature in matrix.feature_names() {
            let path = dir.join(format!("{}{}.csv", ctx.pipeline.output_prefix(), feature));
            if !append_csv_row(&path, &matrix, &feature, &stamp).map_err(io_error)? {
                log::debug!("{} already has {}", path.display(), stamp);
            }
        }
        ctx.push_output(Value::Image(image));
        Ok(())
    }
}

// ============================================================================
// Feature tensor
// ============================================================================

/// A (features x pots x time) tensor with its axis labels.
#[derive(Debug, Clone, PartialEq)]
struct FeatureTensor {
    features: Vec<String>,
    pot_ids: Vec<u32>,
    timestamps: Vec<String>,
    /// Row-major over `[feature][pot][time]`.
    data: Vec<f64>,
}

impl FeatureTensor {
    fn new(matrix: &PotMatrix) -> Self {
        Self {
            features: matrix.feature_names().into_iter().collect(),
            pot_ids: matrix.ids().collect(),
            timestamps: Vec::new(),
            data: Vec::new(),
        }
    }

    fn malformed(path: &Path) -> String {
        format!("{} is not a feature tensor", path.display())
    }

    fn load(path: &Path) -> Result<Option<Self>, String> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.to_string()),
        };
        let json: serde_json::Value = serde_json::from_str(&text).map_err(|e| e.to_string())?;
        let data = dejsonify_data(&json).map_err(|e| e.to_string())?;
        let strings = |key: &str| -> Option<Vec<String>> {
            data.get(key)?
                .as_list()?
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect()
        };
        let features = strings("features").ok_or_else(|| Self::malformed(path))?;
        let timestamps = strings("timestamps").ok_or_else(|| Self::malformed(path))?;
        let pot_ids = data
            .get("potIds")
            .and_then(DataValue::as_array)
            .map(|a| a.to_f64_vec().into_iter().map(|v| v as u32).collect::<Vec<_>>())
            .ok_or_else(|| Self::malformed(path))?;
        let values = data
            .get("data")
            .and_then(DataValue::as_array)
            .ok_or_else(|| Self::malformed(path))?;
        if values.shape() != [features.len(), pot_ids.len(), timestamps.len()] {
            return Err(Self::malformed(path));
        }
        Ok(Some(Self {
            features,
            pot_ids,
            timestamps,
            data: values.to_f64_vec(),
        }))
    }

    /// Grow the feature and pot axes to cover `matrix`, filling earlier
    /// time slices with NaN.
    fn extend_axes(&mut self, matrix: &PotMatrix) {
        let new_features: Vec<String> = matrix
            .feature_names()
            .into_iter()
            .filter(|f| !self.features.contains(f))
            .collect();
        let new_ids: Vec<u32> = matrix.ids().filter(|id| !self.pot_ids.contains(id)).collect();
        if new_features.is_empty() && new_ids.is_empty() {
            return;
        }
        if !new_features.is_empty() {
            log::info!("feature tensor: adding features {:?}", new_features);
        }
        if !new_ids.is_empty() {
            log::info!("feature tensor: adding pots {:?}", new_ids);
        }

        let t = self.timestamps.len();
        let mut features = self.features.clone();
        features.extend(new_features);
        let mut pot_ids = self.pot_ids.clone();
        pot_ids.extend(new_ids);
        pot_ids.sort_unstable();

        // Old features keep their index; old pots move to their sorted slot.
        let mut data = vec![f64::NAN; features.len() * pot_ids.len() * t];
        for f in 0..self.features.len() {
            for (p, id) in self.pot_ids.iter().enumerate() {
                let Ok(q) = pot_ids.binary_search(id) else { continue };
                let src = (f * self.pot_ids.len() + p) * t;
                let dst = (f * pot_ids.len() + q) * t;
                data[dst..dst + t].copy_from_slice(&self.data[src..src + t]);
            }
        }
        self.features = features;
        self.pot_ids = pot_ids;
        self.data = data;
    }

    /// Add a time slice; returns false when `stamp` is already present.
    fn append(&mut self, stamp: &str, matrix: &PotMatrix) -> bool {
        if self.timestamps.iter().any(|t| t == stamp) {
            return false;
        }
        self.extend_axes(matrix);
        let t_old = self.timestamps.len();
        let t_new = t_old + 1;
        let mut data = Vec::with_capacity(self.features.len() * self.pot_ids.len() * t_new);
        for feature in &self.features {
            for id in &self.pot_ids {
                let base = data.len() / t_new * t_old;
                data.extend_from_slice(&self.data[base..base + t_old]);
                let value = matrix
                    .get(*id)
                    .and_then(|pot| pot.features().get(feature))
                    .map(|v| v.as_f64())
                    .unwrap_or(f64::NAN);
                data.push(value);
            }
        }
        self.data = data;
        self.timestamps.push(stamp.to_string());
        true
    }

    fn to_data(&self) -> Result<DataValue, String> {
        let ids: Vec<i64> = self.pot_ids.iter().map(|id| *id as i64).collect();
        let shape = vec![self.features.len(), self.pot_ids.len(), self.timestamps.len()];
        let mut map = IndexMap::new();
        map.insert(
            "features".to_string(),
            DataValue::List(self.features.iter().map(|f| f.as_str().into()).collect()),
        );
        map.insert(
            "potIds".to_string(),
            NdArray::from_i64(vec![ids.len()], &ids).map_err(|e| e.to_string())?.into(),
        );
        map.insert(
            "timestamps".to_string(),
            DataValue::List(self.timestamps.iter().map(|t| t.as_str().into()).collect()),
        );
        map.insert(
            "data".to_string(),
            NdArray::from_f64(shape, &self.data).map_err(|e| e.to_string())?.into(),
        );
        Ok(DataValue::Map(map))
    }

    /// Write through a temporary file so a crash never leaves half a tensor.
    fn save(&self, path: &Path) -> Result<(), String> {
        let text = serde_json::to_string(&jsonify_data(&self.to_data()?)).map_err(|e| e.to_string())?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text).map_err(|e| e.to_string())?;
        fs::rename(&tmp, path).map_err(|e| e.to_string())
    }
}

/// Appends each frame's features to `<prefix>features.json`, a tensor of
/// shape (features x pots x time) stored with the feature names, pot ids
/// and timestamps of its axes.
///
/// Features or pots first seen in a later frame extend their axis; values
/// a frame lacks are NaN.
#[derive(Debug, Default)]
pub struct WriteFeaturesNdarray {
    outdir: String,
}

impl PipelineStage for WriteFeaturesNdarray {
    fn metadata(&self) -> StageMetadata {
        StageMetadata::builder("writefeatures_ndarray")
            .category(Category::Output)
            .description("Append pot features to a features x pots x time tensor")
            .expects(&[PortType::Image, PortType::PotMatrix])
            .returns(&[PortType::Image])
            .parameter(outdir_parameter())
            .build()
    }

    fn prepare(&mut self, ctx: &ValidationContext) -> Result<(), ValidationError> {
        self.outdir = ctx.get_str("outdir")?.to_string();
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), StageError> {
        let image = ctx.take_image()?;
        let matrix = ctx.take_pot_matrix()?;
        let dir = resolve_outdir(ctx.pipeline, &self.outdir);
        let path = dir.join(format!("{}features.json", ctx.pipeline.output_prefix()));
        let fail = |e: String| StageError::failed(&ctx.stage, e);

        fs::create_dir_all(&dir).map_err(|e| fail(e.to_string()))?;
        let mut tensor = FeatureTensor::load(&path)
            .map_err(fail)?
            .unwrap_or_else(|| FeatureTensor::new(&matrix));
        if tensor.append(&image.timestamp_string(), &matrix) {
            tensor.save(&path).map_err(fail)?;
        } else {
            log::debug!("{} already has {}", path.display(), image.timestamp_string());
        }
        ctx.push_output(Value::Image(image));
        Ok(())
    }
}

// ============================================================================
// Image writer
// ============================================================================

/// Writes the frame into a named output timestream, together with the
/// frame's metadata and pot matrix.
#[derive(Debug, Default)]
pub struct ImageWrite {
    outstream: String,
    mode: OverwriteMode,
}

impl ImageWrite {
    /// Name of the output timestream this stage writes to.
    pub fn outstream(&self) -> &str {
        &self.outstream
    }
}

impl PipelineStage for ImageWrite {
    fn metadata(&self) -> StageMetadata {
        StageMetadata::builder("imagewrite")
            .category(Category::Output)
            .description("Write the frame to an output timestream")
            .expects(&[PortType::Image])
            .returns(&[])
            .parameter(
                ParameterDefinition::required("outstream", ArgType::String)
                    .with_description("Name of an entry under 'outstreams'")
                    .with_constraint(Constraint::NotEmpty),
            )
            .parameter(
                ParameterDefinition::new("overwriteMode", ArgType::String, "overwrite")
                    .with_description("What to do when the image already exists")
                    .with_constraint(Constraint::OneOf(vec![
                        "skip".into(),
                        "increment".into(),
                        "overwrite".into(),
                        "raise".into(),
                    ])),
            )
            .build()
    }

    fn prepare(&mut self, ctx: &ValidationContext) -> Result<(), ValidationError> {
        self.outstream = ctx.get_str("outstream")?.to_string();
        self.mode = ctx
            .get_str("overwriteMode")?
            .parse()
            .map_err(|e| ctx.preparation_error(e))?;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), StageError> {
        let mut image = ctx.take_image()?;
        frame_pixels(ctx, &mut image)?;
        let stage = ctx.stage.clone();
        let fail = |e: crate::core::error::TimestreamError| StageError::failed(&stage, e.to_string());

        let pipeline = &mut *ctx.pipeline;
        let stream = pipeline.outstreams.get_mut(&self.outstream).ok_or_else(|| {
            StageError::failed(&stage, format!("unknown output timestream '{}'", self.outstream))
        })?;
        let dt = image.datetime();
        match stream.write_image(&mut image, self.mode).map_err(fail)? {
            WriteOutcome::Written(path) => log::debug!("{} -> {}", ts_format_date(&dt), path.display()),
            WriteOutcome::Skipped(path) => log::debug!("kept existing {}", path.display()),
        }

        stream.set_image_data(&dt, DataValue::Map(image.metadata.clone()));
        stream.save_image_data().map_err(fail)?;
        if let Some(FrameArtifact::PotMatrix(matrix)) = pipeline.output_with_image.get(POT_MATRIX_KEY) {
            stream.write_pot_data(&dt, &matrix.to_data()).map_err(fail)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeneralConfig;
    use crate::pots::{FeatureValue, PotSpec};
    use crate::timestream::{Timestream, TimestreamImage};
    use chrono::{NaiveDate, NaiveDateTime};
    use image::{Rgb, RgbImage};
    use std::sync::Arc;

    fn dt(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2013, 10, 30).unwrap().and_hms_opt(hour, 0, 0).unwrap()
    }

    fn frame(hour: u32) -> TimestreamImage {
        TimestreamImage::new(dt(hour)).with_pixels(RgbImage::from_pixel(40, 20, Rgb([10, 120, 10])))
    }

    fn matrix(hour: u32, area: f64) -> PotMatrix {
        let mut m = PotMatrix::from_specs(
            Arc::new(RgbImage::new(40, 20)),
            Some(dt(hour)),
            vec![
                PotSpec::Rect { id: 2, coords: [20, 0, 40, 20] },
                PotSpec::Rect { id: 1, coords: [0, 0, 20, 20] },
            ],
            (0.0, 0.0),
        )
        .unwrap();
        m.get_mut(1).unwrap().set_feature("area", FeatureValue::Value(area));
        m.get_mut(2).unwrap().set_feature("area", FeatureValue::Error("empty".into()));
        m
    }

    /// Three pots; pot 3 is absent from [`matrix`].
    fn wider_matrix(hour: u32) -> PotMatrix {
        let mut m = PotMatrix::from_specs(
            Arc::new(RgbImage::new(60, 20)),
            Some(dt(hour)),
            vec![
                PotSpec::Rect { id: 1, coords: [0, 0, 20, 20] },
                PotSpec::Rect { id: 2, coords: [20, 0, 40, 20] },
                PotSpec::Rect { id: 3, coords: [40, 0, 60, 20] },
            ],
            (0.0, 0.0),
        )
        .unwrap();
        for (id, area) in [(1, 11.0), (2, 21.0), (3, 31.0)] {
            m.get_mut(id).unwrap().set_feature("area", FeatureValue::Value(area));
        }
        m.get_mut(3).unwrap().set_feature("height", FeatureValue::Value(5.0));
        m
    }

    fn pipeline(root: &Path) -> PipelineContext {
        let general = GeneralConfig {
            output_path: Some(root.to_path_buf()),
            output_prefix: Some("exp1-".to_string()),
            ..GeneralConfig::default()
        };
        PipelineContext::new(general, root)
    }

    fn run(stage: &mut dyn PipelineStage, pipeline: &mut PipelineContext, inputs: Vec<Value>) -> Vec<Value> {
        let mut ctx = ExecutionContext::new(stage.metadata().id, inputs, pipeline);
        stage.execute(&mut ctx).unwrap();
        ctx.take_outputs()
    }

    #[test]
    fn test_csv_rows_appended_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path());
        let mut stage = WriteFeaturesCsv::default();
        stage
            .prepare(&ValidationContext::new("writefeatures_csv", 0, dir.path()).with_argument("outdir", "feat"))
            .unwrap();

        for (hour, area) in [(1, 10.0), (2, 12.5), (1, 99.0)] {
            let out = run(
                &mut stage,
                &mut pipeline,
                vec![Value::Image(frame(hour)), Value::PotMatrix(matrix(hour, area))],
            );
            assert_eq!(out.len(), 1);
        }
        let text = fs::read_to_string(dir.path().join("feat").join("exp1-area.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "timestamp,1,2",
                "2013_10_30_01_00_00,10,NaN",
                "2013_10_30_02_00_00,12.5,NaN",
            ]
        );
    }

    #[test]
    fn test_csv_adds_columns_for_new_pots() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path());
        let mut stage = WriteFeaturesCsv::default();
        stage
            .prepare(&ValidationContext::new("writefeatures_csv", 0, dir.path()).with_argument("outdir", "feat"))
            .unwrap();

        run(&mut stage, &mut pipeline, vec![Value::Image(frame(1)), Value::PotMatrix(matrix(1, 10.0))]);
        run(&mut stage, &mut pipeline, vec![Value::Image(frame(2)), Value::PotMatrix(wider_matrix(2))]);

        let text = fs::read_to_string(dir.path().join("feat").join("exp1-area.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "timestamp,1,2,3",
                "2013_10_30_01_00_00,10,NaN,NaN",
                "2013_10_30_02_00_00,11,21,31",
            ]
        );
        // A feature first computed in frame 2 starts its own table.
        let text = fs::read_to_string(dir.path().join("feat").join("exp1-height.csv")).unwrap();
        assert_eq!(
            text.lines().collect::<Vec<_>>(),
            vec!["timestamp,1,2,3", "2013_10_30_02_00_00,NaN,NaN,5"]
        );
    }

    #[test]
    fn test_tensor_adds_new_pots_and_features() {
        let mut tensor = FeatureTensor::new(&matrix(1, 10.0));
        assert!(tensor.append("t1", &matrix(1, 10.0)));
        assert!(tensor.append("t2", &wider_matrix(2)));

        assert_eq!(tensor.features, vec!["area", "height"]);
        assert_eq!(tensor.pot_ids, vec![1, 2, 3]);
        assert_eq!(tensor.data.len(), 2 * 3 * 2);
        // [area][pot 1], [area][pot 2], [area][pot 3], then height
        assert_eq!(tensor.data[0..2], [10.0, 11.0]);
        assert!(tensor.data[2].is_nan());
        assert_eq!(tensor.data[3], 21.0);
        assert!(tensor.data[4].is_nan());
        assert_eq!(tensor.data[5], 31.0);
        assert!(tensor.data[6..11].iter().all(|v| v.is_nan()));
        assert_eq!(tensor.data[11], 5.0);
    }

    #[test]
    fn test_tensor_grows_along_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path());
        let mut stage = WriteFeaturesNdarray::default();
        stage
            .prepare(&ValidationContext::new("writefeatures_ndarray", 0, dir.path()).with_argument("outdir", "feat"))
            .unwrap();
        for (hour, area) in [(1, 10.0), (2, 12.5), (2, 50.0)] {
            run(
                &mut stage,
                &mut pipeline,
                vec![Value::Image(frame(hour)), Value::PotMatrix(matrix(hour, area))],
            );
        }
        let tensor = FeatureTensor::load(&dir.path().join("feat").join("exp1-features.json"))
            .unwrap()
            .unwrap();
        assert_eq!(tensor.features, vec!["area"]);
        assert_eq!(tensor.pot_ids, vec![1, 2]);
        assert_eq!(tensor.timestamps, vec!["2013_10_30_01_00_00", "2013_10_30_02_00_00"]);
        assert_eq!(&tensor.data[..2], &[10.0, 12.5]);
        assert!(tensor.data[2..].iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_tensor_layout_with_two_features() {
        let mut m = matrix(1, 3.0);
        m.get_mut(1).unwrap().set_feature("height", FeatureValue::Value(7.0));
        m.get_mut(2).unwrap().set_feature("height", FeatureValue::Value(8.0));
        let mut tensor = FeatureTensor::new(&m);
        assert!(tensor.append("a", &m));
        m.get_mut(1).unwrap().set_feature("area", FeatureValue::Value(4.0));
        assert!(tensor.append("b", &m));
        assert!(!tensor.append("b", &m));
        // [area][pot 1][t], [area][pot 2][t], [height][pot 1][t], [height][pot 2][t]
        assert_eq!(tensor.data[0..2], [3.0, 4.0]);
        assert!(tensor.data[2].is_nan() && tensor.data[3].is_nan());
        assert_eq!(tensor.data[4..8], [7.0, 7.0, 8.0, 8.0]);
    }

    #[test]
    fn test_image_write_persists_metadata_and_pots() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path());
        let out_root = dir.path().join("exp1-out");
        pipeline
            .outstreams
            .insert("out".to_string(), Timestream::create(&out_root, 1).unwrap());
        pipeline
            .output_with_image
            .insert(POT_MATRIX_KEY.to_string(), FrameArtifact::PotMatrix(matrix(1, 10.0)));

        let mut stage = ImageWrite::default();
        stage
            .prepare(
                &ValidationContext::new("imagewrite", 0, dir.path())
                    .with_argument("outstream", "out")
                    .with_argument("overwriteMode", "skip"),
            )
            .unwrap();
        let mut img = frame(1);
        img.metadata.insert("trayLocations".to_string(), DataValue::List(Vec::new()));
        assert!(run(&mut stage, &mut pipeline, vec![Value::Image(img)]).is_empty());
        // A second write of the same frame keeps the existing file.
        run(&mut stage, &mut pipeline, vec![Value::Image(frame(1))]);

        let reloaded = Timestream::load(&out_root).unwrap();
        assert_eq!(reloaded.image_count(), 1);
        assert!(reloaded.image_data(&dt(1)).is_some());
        let pots = PotMatrix::from_data(&reloaded.read_pot_data(&dt(1)).unwrap(), None).unwrap();
        assert_eq!(pots.len(), 2);
        assert_eq!(pots.get(1).unwrap().features()["area"].as_f64(), 10.0);
    }

    #[test]
    fn test_image_write_rejects_bad_mode() {
        let ctx = ValidationContext::new("imagewrite", 0, "/tmp")
            .with_argument("outstream", "out")
            .with_argument("overwriteMode", "clobber");
        assert!(ImageWrite::default().prepare(&ctx).is_err());
    }
}
