use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::caption::CaptionGate;
use crate::detect::{ClassEntry, ClassTable};
use crate::engine::{EngineConfig, FrameStateSource};
use crate::filter::{parse_conf_floor_map, FilterThresholds};
use crate::ingest::{ClockMode, FrameErrorPolicy};
use crate::storage::StoreKind;

const DEFAULT_SOURCE: &str = "stub://cycle";
const DEFAULT_FPS: u32 = 30;
const DEFAULT_EVENTS_PATH: &str = "signal_events.json";
const DEFAULT_MIN_AREA: f32 = 120.0;
const DEFAULT_GLOBAL_CONF: f32 = 0.55;
const DEFAULT_TRACK_DEBOUNCE_MS: u64 = 800;
const DEFAULT_TRACK_EVICTION_MS: u64 = 10_000;
const DEFAULT_CAPTION_MIN_TRACKS: usize = 1;
const DEFAULT_CAPTION_MIN_CONF: f32 = 0.5;
const DEFAULT_CAPTION_MIN_FRAMES: u32 = 6;
const DEFAULT_CAPTION_DEBOUNCE_MS: u64 = 800;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SignalConfigFile {
    source: Option<SourceConfigFile>,
    roi: Option<RoiValue>,
    filter: Option<FilterConfigFile>,
    tracking: Option<TrackingConfigFile>,
    captions: Option<CaptionsConfigFile>,
    frame_state_source: Option<String>,
    frame_errors: Option<String>,
    events: Option<EventsConfigFile>,
    classes: Option<Vec<ClassEntry>>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    path: Option<String>,
    fps: Option<u32>,
    clock: Option<String>,
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RoiValue {
    Text(String),
    Values(Vec<f32>),
}

#[derive(Debug, Deserialize, Default)]
struct FilterConfigFile {
    min_area: Option<f32>,
    global_conf_floor: Option<f32>,
    per_class_conf_floor: Option<FloorValue>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FloorValue {
    Text(String),
    Map(BTreeMap<String, f32>),
}

#[derive(Debug, Deserialize, Default)]
struct TrackingConfigFile {
    debounce_ms: Option<u64>,
    eviction_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptionsConfigFile {
    enabled: Option<bool>,
    min_tracks: Option<usize>,
    min_conf: Option<f32>,
    min_frames: Option<u32>,
    debounce_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsConfigFile {
    path: Option<PathBuf>,
    store: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub source: SourceSettings,
    pub engine: EngineConfig,
    pub frame_errors: FrameErrorPolicy,
    pub events: EventSettings,
    pub classes: ClassTable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub path: String,
    pub fps: u32,
    pub clock: ClockMode,
    /// Seed for `stub://` scenarios.
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventSettings {
    pub path: PathBuf,
    pub store: StoreKind,
}

impl SignalConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SIGNAL_CONFIG").ok();
        Self::load_from(
            config_path
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .map(Path::new),
        )
    }

    /// Like `load`, with an explicit config file instead of `SIGNAL_CONFIG`.
    /// Environment overrides still apply.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SignalConfigFile) -> Result<Self> {
        let source_file = file.source.unwrap_or_default();
        let source = SourceSettings {
            path: source_file
                .path
                .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            fps: source_file.fps.unwrap_or(DEFAULT_FPS),
            clock: match source_file.clock.as_deref() {
                Some(raw) => ClockMode::parse(raw)?,
                None => ClockMode::Recorded,
            },
            seed: source_file.seed.unwrap_or(0),
        };

        let filter_file = file.filter.unwrap_or_default();
        let per_class_conf_floor = match filter_file.per_class_conf_floor {
            Some(FloorValue::Text(raw)) => parse_conf_floor_map(&raw),
            Some(FloorValue::Map(map)) => parse_floor_table(map)?,
            None => BTreeMap::new(),
        };
        let filter = FilterThresholds {
            min_area: filter_file.min_area.unwrap_or(DEFAULT_MIN_AREA),
            global_conf_floor: filter_file
                .global_conf_floor
                .unwrap_or(DEFAULT_GLOBAL_CONF),
            per_class_conf_floor,
        };

        let tracking = file.tracking.unwrap_or_default();
        let captions = file.captions.unwrap_or_default();
        let engine = EngineConfig {
            roi: file.roi.map(|roi| match roi {
                RoiValue::Text(raw) => raw,
                RoiValue::Values(values) => join_floats(&values),
            }),
            filter,
            track_debounce_ms: tracking.debounce_ms.unwrap_or(DEFAULT_TRACK_DEBOUNCE_MS),
            track_eviction_ms: eviction_window(
                tracking.eviction_ms.unwrap_or(DEFAULT_TRACK_EVICTION_MS),
            ),
            frame_state_source: match file.frame_state_source.as_deref() {
                Some(raw) => FrameStateSource::parse(raw)?,
                None => FrameStateSource::Auto,
            },
            captions_enabled: captions.enabled.unwrap_or(true),
            caption_gate: CaptionGate {
                min_tracks: captions.min_tracks.unwrap_or(DEFAULT_CAPTION_MIN_TRACKS),
                min_conf: captions.min_conf.unwrap_or(DEFAULT_CAPTION_MIN_CONF),
            },
            caption_min_frames: captions.min_frames.unwrap_or(DEFAULT_CAPTION_MIN_FRAMES),
            caption_debounce_ms: captions
                .debounce_ms
                .unwrap_or(DEFAULT_CAPTION_DEBOUNCE_MS),
        };

        let frame_errors = match file.frame_errors.as_deref() {
            Some(raw) => FrameErrorPolicy::parse(raw)?,
            None => FrameErrorPolicy::Skip,
        };

        let events_file = file.events.unwrap_or_default();
        let events = EventSettings {
            path: events_file
                .path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_EVENTS_PATH)),
            store: match events_file.store.as_deref() {
                Some(raw) => StoreKind::parse(raw)?,
                None => StoreKind::Json,
            },
        };

        let classes = match file.classes {
            Some(entries) => ClassTable::new(entries)?,
            None => ClassTable::default(),
        };

        Ok(Self {
            source,
            engine,
            frame_errors,
            events,
            classes,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(source) = std::env::var("SIGNAL_SOURCE") {
            if !source.trim().is_empty() {
                self.source.path = source;
            }
        }
        if let Ok(roi) = std::env::var("SIGNAL_ROI") {
            if !roi.trim().is_empty() {
                self.engine.roi = Some(roi);
            }
        }
        if let Ok(floors) = std::env::var("SIGNAL_MIN_CONF_BY_CLS") {
            if !floors.trim().is_empty() {
                self.engine.filter.per_class_conf_floor = parse_conf_floor_map(&floors);
            }
        }
        if let Ok(conf) = std::env::var("SIGNAL_GLOBAL_CONF") {
            self.engine.filter.global_conf_floor = conf
                .trim()
                .parse()
                .map_err(|_| anyhow!("config: SIGNAL_GLOBAL_CONF must be a number"))?;
        }
        if let Ok(ms) = std::env::var("SIGNAL_TRACK_DEBOUNCE_MS") {
            self.engine.track_debounce_ms = ms.trim().parse().map_err(|_| {
                anyhow!("config: SIGNAL_TRACK_DEBOUNCE_MS must be an integer number of milliseconds")
            })?;
        }
        if let Ok(ms) = std::env::var("SIGNAL_CAPTION_DEBOUNCE_MS") {
            self.engine.caption_debounce_ms = ms.trim().parse().map_err(|_| {
                anyhow!("config: SIGNAL_CAPTION_DEBOUNCE_MS must be an integer number of milliseconds")
            })?;
        }
        if let Ok(path) = std::env::var("SIGNAL_EVENTS_PATH") {
            if !path.trim().is_empty() {
                self.events.path = PathBuf::from(path);
            }
        }
        if let Ok(store) = std::env::var("SIGNAL_EVENTS_STORE") {
            if !store.trim().is_empty() {
                self.events.store = StoreKind::parse(&store)?;
            }
        }
        if let Ok(policy) = std::env::var("SIGNAL_FRAME_ERRORS") {
            if !policy.trim().is_empty() {
                self.frame_errors = FrameErrorPolicy::parse(&policy)?;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let filter = &self.engine.filter;
        check_unit("filter.global_conf_floor", filter.global_conf_floor)?;
        for (class_id, floor) in &filter.per_class_conf_floor {
            check_unit(&format!("filter.per_class_conf_floor[{}]", class_id), *floor)?;
        }
        if !filter.min_area.is_finite() || filter.min_area < 0.0 {
            return Err(anyhow!("config: filter.min_area must be a non-negative number"));
        }
        check_unit("captions.min_conf", self.engine.caption_gate.min_conf)?;
        if self.engine.caption_min_frames == 0 {
            return Err(anyhow!("config: captions.min_frames must be at least 1"));
        }
        if self.source.fps == 0 {
            return Err(anyhow!("config: source.fps must be at least 1"));
        }
        if self.source.path.trim().is_empty() {
            return Err(anyhow!("config: source.path must not be empty"));
        }
        if self.classes.is_empty() {
            return Err(anyhow!("config: class table must not be empty"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<SignalConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_floor_table(map: BTreeMap<String, f32>) -> Result<BTreeMap<u32, f32>> {
    map.into_iter()
        .map(|(class, floor)| {
            let class_id = class.trim().parse::<u32>().map_err(|_| {
                anyhow!("config: per_class_conf_floor key '{}' is not a class id", class)
            })?;
            Ok((class_id, floor))
        })
        .collect()
}

fn join_floats(values: &[f32]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn eviction_window(ms: u64) -> Option<u64> {
    (ms > 0).then_some(ms)
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("config: {} must be within [0, 1], got {}", name, value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Group;

    fn parse_json(raw: &str) -> Result<SignalConfig> {
        let file: SignalConfigFile = serde_json::from_str(raw)?;
        let mut cfg = SignalConfig::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn defaults_match_documented_values() -> Result<()> {
        let cfg = parse_json("{}")?;
        assert_eq!(cfg.source.path, DEFAULT_SOURCE);
        assert_eq!(cfg.engine.filter.global_conf_floor, 0.55);
        assert_eq!(cfg.engine.filter.min_area, 120.0);
        assert_eq!(cfg.engine.track_debounce_ms, 800);
        assert_eq!(cfg.engine.track_eviction_ms, Some(10_000));
        assert_eq!(cfg.engine.caption_min_frames, 6);
        assert_eq!(cfg.engine.caption_gate, CaptionGate::default());
        assert_eq!(cfg.frame_errors, FrameErrorPolicy::Skip);
        assert_eq!(cfg.events.store, StoreKind::Json);
        assert_eq!(cfg.classes.len(), 14);
        Ok(())
    }

    #[test]
    fn roi_accepts_string_or_list() -> Result<()> {
        let cfg = parse_json(r#"{"roi": "0.1,0.2,0.5,0.5"}"#)?;
        assert_eq!(cfg.engine.roi.as_deref(), Some("0.1,0.2,0.5,0.5"));
        let cfg = parse_json(r#"{"roi": [0.0, 0.0, 0.5, 0.25]}"#)?;
        assert_eq!(cfg.engine.roi.as_deref(), Some("0,0,0.5,0.25"));
        Ok(())
    }

    #[test]
    fn per_class_floor_accepts_string_or_table() -> Result<()> {
        let cfg = parse_json(r#"{"filter": {"per_class_conf_floor": "8:0.80,bogus,7:0.70"}}"#)?;
        assert_eq!(cfg.engine.filter.per_class_conf_floor.get(&8), Some(&0.8));
        assert_eq!(cfg.engine.filter.per_class_conf_floor.len(), 2);

        let cfg = parse_json(r#"{"filter": {"per_class_conf_floor": {"7": 0.7}}}"#)?;
        assert_eq!(cfg.engine.filter.per_class_conf_floor.get(&7), Some(&0.7));

        assert!(parse_json(r#"{"filter": {"per_class_conf_floor": {"red": 0.7}}}"#).is_err());
        Ok(())
    }

    #[test]
    fn zero_eviction_disables_it() -> Result<()> {
        let cfg = parse_json(r#"{"tracking": {"eviction_ms": 0}}"#)?;
        assert_eq!(cfg.engine.track_eviction_ms, None);
        Ok(())
    }

    #[test]
    fn class_table_replacement() -> Result<()> {
        let cfg = parse_json(
            r#"{"classes": [
                {"id": 0, "name": "stop", "group": "RED"},
                {"id": 1, "name": "go", "group": "GREEN"},
                {"id": 2, "name": "sign"}
            ]}"#,
        )?;
        assert_eq!(cfg.classes.group_of(0), Some(Group::Red));
        assert_eq!(cfg.classes.group_of(2), None);
        assert!(parse_json(
            r#"{"classes": [{"id": 0, "name": "a"}, {"id": 0, "name": "b"}]}"#
        )
        .is_err());
        Ok(())
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        assert!(parse_json(r#"{"filter": {"global_conf_floor": 1.5}}"#).is_err());
        assert!(parse_json(r#"{"filter": {"per_class_conf_floor": {"8": -0.1}}}"#).is_err());
        assert!(parse_json(r#"{"captions": {"min_conf": 2.0}}"#).is_err());
        assert!(parse_json(r#"{"captions": {"min_frames": 0}}"#).is_err());
        assert!(parse_json(r#"{"source": {"fps": 0}}"#).is_err());
        assert!(parse_json(r#"{"frame_errors": "retry"}"#).is_err());
        assert!(parse_json(r#"{"unknown_section": {}}"#).is_err());
    }

    #[test]
    fn toml_sections_parse() -> Result<()> {
        let file: SignalConfigFile = toml::from_str(
            r#"
            frame_state_source = "detections"

            [source]
            path = "replay.jsonl"
            fps = 15
            clock = "monotonic"

            [captions]
            enabled = false

            [events]
            store = "sqlite"
            path = "events.db"
            "#,
        )?;
        let cfg = SignalConfig::from_file(file)?;
        assert_eq!(cfg.source.fps, 15);
        assert_eq!(cfg.source.clock, ClockMode::Monotonic);
        assert_eq!(cfg.engine.frame_state_source, FrameStateSource::Detections);
        assert!(!cfg.engine.captions_enabled);
        assert_eq!(cfg.events.store, StoreKind::Sqlite);
        Ok(())
    }
}
