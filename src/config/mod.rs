//! Pipeline configuration.
//!
//! The YAML file is loaded once into a [`Config`] tree of sections and
//! leaves. Command-line overrides are applied with dotted paths
//! (`pipeline.3.minScore=0.4`, `general.visualise=true`), the tree is
//! checked against the expected top-level layout, converted into the typed
//! [`PipelineConfig`] view and then locked.

use crate::core::error::{ConfigError, ConfigResult};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_yml::{Mapping, Value as YamlValue};
use std::fmt;
use std::path::{Path, PathBuf};

/// Top-level sections a pipeline file may contain.
pub const SECTIONS: &[&str] = &["pipeline", "outstreams", "general"];

// ============================================================================
// Configuration Tree
// ============================================================================

/// A node of the configuration tree.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigNode {
    /// A scalar or sequence.
    Leaf(YamlValue),
    /// A named mapping of child nodes.
    Section(IndexMap<String, ConfigNode>),
}

impl ConfigNode {
    /// Convert a YAML value, turning string-keyed mappings into sections.
    pub fn from_yaml(value: YamlValue) -> Self {
        match value {
            YamlValue::Mapping(map) if map.keys().all(|k| k.is_string()) => {
                let mut children = IndexMap::with_capacity(map.len());
                for (k, v) in map {
                    if let YamlValue::String(key) = k {
                        children.insert(key, ConfigNode::from_yaml(v));
                    }
                }
                ConfigNode::Section(children)
            }
            other => ConfigNode::Leaf(other),
        }
    }

    /// Convert back into a YAML value.
    pub fn to_yaml(&self) -> YamlValue {
        match self {
            ConfigNode::Leaf(v) => v.clone(),
            ConfigNode::Section(children) => {
                let mut map = Mapping::new();
                for (k, v) in children {
                    map.insert(YamlValue::String(k.clone()), v.to_yaml());
                }
                YamlValue::Mapping(map)
            }
        }
    }

    /// Child section lookup.
    pub fn child(&self, key: &str) -> Option<&ConfigNode> {
        match self {
            ConfigNode::Section(children) => children.get(key),
            ConfigNode::Leaf(_) => None,
        }
    }
}

/// The loaded configuration tree.
#[derive(Debug, Clone)]
pub struct Config {
    root: IndexMap<String, ConfigNode>,
    locked: bool,
    source: Option<PathBuf>,
}

impl Config {
    /// Create an empty, unlocked configuration.
    pub fn new() -> Self {
        Self {
            root: IndexMap::new(),
            locked: false,
            source: None,
        }
    }

    /// Parse a YAML document.
    pub fn from_yaml_str(text: &str) -> ConfigResult<Self> {
        let value: YamlValue =
            serde_yml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        match ConfigNode::from_yaml(value) {
            ConfigNode::Section(root) => Ok(Self {
                root,
                locked: false,
                source: None,
            }),
            ConfigNode::Leaf(YamlValue::Null) => Ok(Self::new()),
            ConfigNode::Leaf(_) => Err(ConfigError::Parse(
                "top level must be a mapping".to_string(),
            )),
        }
    }

    /// Load a YAML file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut config = Self::from_yaml_str(&text)?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// File the configuration was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Top-level section names.
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.root.keys().map(String::as_str)
    }

    /// Look up a node by dotted path.
    pub fn get(&self, path: &str) -> Option<&ConfigNode> {
        let mut parts = path.split('.');
        let mut node = self.root.get(parts.next()?)?;
        for part in parts {
            node = node.child(part)?;
        }
        Some(node)
    }

    /// Look up a value by dotted path, descending into sequences by index.
    pub fn get_value(&self, path: &str) -> Option<YamlValue> {
        let parts: Vec<&str> = path.split('.').collect();
        let mut node = self.root.get(parts[0])?;
        for (i, part) in parts.iter().enumerate().skip(1) {
            match node {
                ConfigNode::Section(children) => node = children.get(*part)?,
                ConfigNode::Leaf(value) => {
                    let mut current = value;
                    for p in &parts[i..] {
                        current = yaml_child(current, p)?;
                    }
                    return Some(current.clone());
                }
            }
        }
        Some(node.to_yaml())
    }

    /// Set a value by dotted path, creating sections as needed.
    pub fn set(&mut self, path: &str, value: YamlValue) -> ConfigResult<()> {
        if self.locked {
            return Err(ConfigError::Locked(path.to_string()));
        }
        let parts: Vec<&str> = path.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(ConfigError::InvalidOverride(path.to_string()));
        }

        let mut children = &mut self.root;
        for (i, part) in parts.iter().enumerate() {
            let last = i + 1 == parts.len();
            if last {
                children.insert(part.to_string(), ConfigNode::from_yaml(value));
                return Ok(());
            }
            let node = children
                .entry(part.to_string())
                .or_insert_with(|| ConfigNode::Section(IndexMap::new()));
            match node {
                ConfigNode::Section(next) => children = next,
                ConfigNode::Leaf(leaf) => {
                    return set_in_yaml(leaf, &parts[i + 1..], value)
                        .ok_or_else(|| ConfigError::MissingKey(path.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Forbid further mutation.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Apply `key=value[,key=value]` overrides; values are parsed as YAML.
    pub fn apply_overrides(&mut self, overrides: &str) -> ConfigResult<()> {
        for item in overrides.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, raw) = item
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidOverride(item.to_string()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::InvalidOverride(item.to_string()));
            }
            let value = serde_yml::from_str::<YamlValue>(raw.trim())
                .unwrap_or_else(|_| YamlValue::String(raw.trim().to_string()));
            log::debug!("override {} = {:?}", key, value);
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Merge every key of `other` into the section `section`.
    pub fn merge_into(&mut self, section: &str, other: &Config) -> ConfigResult<()> {
        for (key, node) in &other.root {
            self.set(&format!("{}.{}", section, key), node.to_yaml())?;
        }
        Ok(())
    }

    /// Check the top-level layout.
    pub fn validate_schema(&self) -> ConfigResult<()> {
        for key in self.root.keys() {
            if !SECTIONS.contains(&key.as_str()) {
                return Err(ConfigError::UnknownSection(key.clone()));
            }
        }
        match self.root.get("pipeline") {
            Some(ConfigNode::Leaf(YamlValue::Sequence(_))) => Ok(()),
            Some(_) => Err(ConfigError::InvalidValue {
                key: "pipeline".to_string(),
                reason: "expected a list of stages".to_string(),
            }),
            None => Err(ConfigError::MissingKey("pipeline".to_string())),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn yaml_child<'v>(value: &'v YamlValue, key: &str) -> Option<&'v YamlValue> {
    match value {
        YamlValue::Sequence(seq) => seq.get(key.parse::<usize>().ok()?),
        YamlValue::Mapping(map) => map.get(key),
        _ => None,
    }
}

fn set_in_yaml(target: &mut YamlValue, path: &[&str], value: YamlValue) -> Option<()> {
    let (first, rest) = path.split_first()?;
    let slot = match target {
        YamlValue::Sequence(seq) => seq.get_mut(first.parse::<usize>().ok()?)?,
        YamlValue::Mapping(map) => {
            let key = YamlValue::String(first.to_string());
            if rest.is_empty() {
                map.insert(key, value);
                return Some(());
            }
            map.get_mut(&key)?
        }
        _ => return None,
    };
    if rest.is_empty() {
        *slot = value;
        Some(())
    } else {
        set_in_yaml(slot, rest, value)
    }
}

// ============================================================================
// Typed Views
// ============================================================================

/// One configured stage: its name plus the remaining keys as arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub name: String,
    pub args: IndexMap<String, YamlValue>,
}

/// One configured output timestream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutstreamSpec {
    pub name: String,
    #[serde(default)]
    pub outpath: Option<PathBuf>,
}

/// The `general` section.
#[derive(Debug, Clone, Default)]
pub struct GeneralConfig {
    /// Prefix for writer output files.
    pub output_prefix: Option<String>,
    /// Root directory for outputs.
    pub output_path: Option<PathBuf>,
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
    /// Sampling interval in seconds.
    pub time_interval: Option<u64>,
    pub start_hour_range: Option<NaiveTime>,
    pub end_hour_range: Option<NaiveTime>,
    pub visualise: bool,
    /// `{metaName: {potId or trayPos: value}}`
    pub metas: IndexMap<String, IndexMap<String, YamlValue>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DateSpec {
    year: i32,
    month: u32,
    day: u32,
    #[serde(default)]
    hour: u32,
    #[serde(default)]
    minute: u32,
    #[serde(default)]
    second: u32,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HourSpec {
    Hour(u32),
    Time {
        hour: u32,
        #[serde(default)]
        minute: u32,
        #[serde(default)]
        second: u32,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawGeneral {
    output_prefix: Option<String>,
    output_path: Option<PathBuf>,
    start_date: Option<DateSpec>,
    end_date: Option<DateSpec>,
    time_interval: Option<u64>,
    start_hour_range: Option<HourSpec>,
    end_hour_range: Option<HourSpec>,
    visualise: bool,
    metas: IndexMap<String, IndexMap<String, YamlValue>>,
}

impl DateSpec {
    fn to_datetime(&self, key: &str) -> ConfigResult<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
            .and_then(|d| d.and_hms_opt(self.hour, self.minute, self.second))
            .ok_or_else(|| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02} is not a valid date",
                    self.year, self.month, self.day, self.hour, self.minute, self.second
                ),
            })
    }
}

impl HourSpec {
    fn to_time(&self, key: &str) -> ConfigResult<NaiveTime> {
        let (h, m, s) = match *self {
            HourSpec::Hour(h) => (h, 0, 0),
            HourSpec::Time { hour, minute, second } => (hour, minute, second),
        };
        NaiveTime::from_hms_opt(h, m, s).ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("{:02}:{:02}:{:02} is not a valid time", h, m, s),
        })
    }
}

impl GeneralConfig {
    /// Build from the YAML of the `general` section.
    pub fn from_yaml(value: YamlValue) -> ConfigResult<Self> {
        let raw: RawGeneral = serde_yml::from_value(value).map_err(|e| ConfigError::InvalidValue {
            key: "general".to_string(),
            reason: e.to_string(),
        })?;
        let general = Self {
            output_prefix: raw.output_prefix,
            output_path: raw.output_path,
            start_date: raw
                .start_date
                .map(|d| d.to_datetime("general.startDate"))
                .transpose()?,
            end_date: raw
                .end_date
                .map(|d| d.to_datetime("general.endDate"))
                .transpose()?,
            time_interval: raw.time_interval,
            start_hour_range: raw
                .start_hour_range
                .map(|h| h.to_time("general.startHourRange"))
                .transpose()?,
            end_hour_range: raw
                .end_hour_range
                .map(|h| h.to_time("general.endHourRange"))
                .transpose()?,
            visualise: raw.visualise,
            metas: raw.metas,
        };
        if let (Some(start), Some(end)) = (general.start_date, general.end_date) {
            if start > end {
                return Err(ConfigError::InvalidValue {
                    key: "general.endDate".to_string(),
                    reason: format!("end {} is before start {}", end, start),
                });
            }
        }
        if general.time_interval == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "general.timeInterval".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(general)
    }
}

/// Typed view of a validated configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub stages: Vec<StageSpec>,
    pub outstreams: Vec<OutstreamSpec>,
    pub general: GeneralConfig,
}

impl PipelineConfig {
    /// Validate the tree and build the typed view.
    pub fn from_config(config: &Config) -> ConfigResult<Self> {
        config.validate_schema()?;

        let stages = match config.get_value("pipeline") {
            Some(YamlValue::Sequence(entries)) => entries
                .into_iter()
                .enumerate()
                .map(|(i, entry)| parse_stage(i, entry))
                .collect::<ConfigResult<Vec<_>>>()?,
            _ => return Err(ConfigError::MissingKey("pipeline".to_string())),
        };

        let outstreams = match config.get_value("outstreams") {
            None | Some(YamlValue::Null) => Vec::new(),
            Some(value) => serde_yml::from_value::<Vec<OutstreamSpec>>(value).map_err(|e| {
                ConfigError::InvalidValue {
                    key: "outstreams".to_string(),
                    reason: e.to_string(),
                }
            })?,
        };

        let general = match config.get_value("general") {
            None | Some(YamlValue::Null) => GeneralConfig::default(),
            Some(value) => GeneralConfig::from_yaml(value)?,
        };

        Ok(Self {
            stages,
            outstreams,
            general,
        })
    }
}

fn parse_stage(index: usize, entry: YamlValue) -> ConfigResult<StageSpec> {
    let key = format!("pipeline.{}", index);
    let map = match entry {
        YamlValue::Mapping(map) => map,
        _ => {
            return Err(ConfigError::InvalidValue {
                key,
                reason: "expected a mapping with a 'name'".to_string(),
            })
        }
    };
    let mut name = None;
    let mut args = IndexMap::new();
    for (k, v) in map {
        let k = match k {
            YamlValue::String(s) => s,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key,
                    reason: "argument names must be strings".to_string(),
                })
            }
        };
        if k == "name" {
            name = v.as_str().map(str::to_string);
        } else {
            args.insert(k, v);
        }
    }
    let name = name.ok_or_else(|| ConfigError::MissingKey(format!("{}.name", key)))?;
    Ok(StageSpec { name, args })
}

impl fmt::Display for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.args.is_empty() {
            let keys: Vec<&str> = self.args.keys().map(String::as_str).collect();
            write!(f, "({})", keys.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"
pipeline:
  - name: undistort
    rotationAngle: 180
  - name: traydetect
    trayFiles: Tray_%02d.png
    minScore: 0.3
  - name: imagewrite
    outstream: cor
outstreams:
  - name: cor
  - name: seg
    outpath: /tmp/seg
general:
  outputPrefix: BVZ0036
  visualise: false
  startDate: {year: 2013, month: 10, day: 30, hour: 3}
  timeInterval: 1800
  startHourRange: {hour: 6}
  endHourRange: 18
"#;

    #[test]
    fn test_load_and_typed_view() {
        let config = Config::from_yaml_str(PIPELINE).unwrap();
        let typed = PipelineConfig::from_config(&config).unwrap();

        assert_eq!(typed.stages.len(), 3);
        assert_eq!(typed.stages[1].name, "traydetect");
        assert_eq!(typed.stages[1].args["minScore"].as_f64(), Some(0.3));
        assert_eq!(typed.outstreams[1].outpath, Some(PathBuf::from("/tmp/seg")));
        assert_eq!(typed.general.output_prefix.as_deref(), Some("BVZ0036"));
        assert_eq!(
            typed.general.start_date,
            NaiveDate::from_ymd_opt(2013, 10, 30).and_then(|d| d.and_hms_opt(3, 0, 0))
        );
        assert_eq!(typed.general.time_interval, Some(1800));
        assert_eq!(typed.general.start_hour_range, NaiveTime::from_hms_opt(6, 0, 0));
        assert_eq!(typed.general.end_hour_range, NaiveTime::from_hms_opt(18, 0, 0));
    }

    #[test]
    fn test_dotted_get_and_set() {
        let mut config = Config::from_yaml_str(PIPELINE).unwrap();
        assert_eq!(
            config.get_value("general.outputPrefix"),
            Some(YamlValue::String("BVZ0036".into()))
        );
        assert_eq!(
            config.get_value("pipeline.1.minScore").and_then(|v| v.as_f64()),
            Some(0.3)
        );

        config.set("general.visualise", YamlValue::Bool(true)).unwrap();
        config.set("general.new.deep", YamlValue::from(5)).unwrap();
        config.apply_overrides("pipeline.1.minScore=0.5, general.outputPrefix=X").unwrap();

        assert_eq!(config.get_value("general.visualise"), Some(YamlValue::Bool(true)));
        assert!(matches!(config.get("general.new"), Some(ConfigNode::Section(_))));
        assert_eq!(
            config.get_value("pipeline.1.minScore").and_then(|v| v.as_f64()),
            Some(0.5)
        );
        assert_eq!(config.get_value("general.outputPrefix"), Some(YamlValue::String("X".into())));
    }

    #[test]
    fn test_locking() {
        let mut config = Config::from_yaml_str(PIPELINE).unwrap();
        config.lock();
        assert!(matches!(
            config.set("general.visualise", YamlValue::Bool(true)),
            Err(ConfigError::Locked(_))
        ));
        assert!(config.apply_overrides("general.visualise=true").is_err());
    }

    #[test]
    fn test_bad_overrides() {
        let mut config = Config::new();
        assert!(matches!(
            config.apply_overrides("novalue"),
            Err(ConfigError::InvalidOverride(_))
        ));
        assert!(matches!(
            config.apply_overrides("=3"),
            Err(ConfigError::InvalidOverride(_))
        ));
    }

    #[test]
    fn test_schema_errors() {
        let config = Config::from_yaml_str("pipeline: []\nextras: 1\n").unwrap();
        assert!(matches!(
            config.validate_schema(),
            Err(ConfigError::UnknownSection(s)) if s == "extras"
        ));
        let config = Config::from_yaml_str("general: {}\n").unwrap();
        assert!(matches!(config.validate_schema(), Err(ConfigError::MissingKey(_))));
        let config = Config::from_yaml_str("pipeline:\n  - rotationAngle: 90\n").unwrap();
        assert!(PipelineConfig::from_config(&config).is_err());
    }

    #[test]
    fn test_strict_dates() {
        let bad_month = "pipeline: []\ngeneral:\n  startDate: {year: 2013, month: 14, day: 11}\n";
        let config = Config::from_yaml_str(bad_month).unwrap();
        assert!(matches!(
            PipelineConfig::from_config(&config),
            Err(ConfigError::InvalidValue { .. })
        ));

        let as_string = "pipeline: []\ngeneral:\n  startDate: 2013_10_30_03_00_00\n";
        let config = Config::from_yaml_str(as_string).unwrap();
        assert!(PipelineConfig::from_config(&config).is_err());

        let reversed = "pipeline: []\ngeneral:\n  startDate: {year: 2014, month: 1, day: 1}\n  endDate: {year: 2013, month: 1, day: 1}\n";
        let config = Config::from_yaml_str(reversed).unwrap();
        assert!(PipelineConfig::from_config(&config).is_err());
    }

    #[test]
    fn test_merge_timestream_config() {
        let mut config = Config::from_yaml_str(PIPELINE).unwrap();
        let ts = Config::from_yaml_str("outputPrefix: CHAMBER\ntimeInterval: 900\n").unwrap();
        config.merge_into("general", &ts).unwrap();
        let typed = PipelineConfig::from_config(&config).unwrap();
        assert_eq!(typed.general.output_prefix.as_deref(), Some("CHAMBER"));
        assert_eq!(typed.general.time_interval, Some(900));
        assert!(!typed.general.visualise);
    }
}
