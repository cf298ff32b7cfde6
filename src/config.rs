use anyhow::{anyhow, bail, Context, Result};
use serde::de::IgnoredAny;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::accel::{DeviceSelection, WorkGroupSize, DEFAULT_WORK_GROUP};
use crate::estimator::{
    DEFAULT_BACKGROUND_RATIO, DEFAULT_HISTORY, DEFAULT_INITIAL_VARIANCE, DEFAULT_INITIAL_WEIGHT,
    DEFAULT_MIN_VARIANCE, DEFAULT_MIXTURES, DEFAULT_VARIANCE_THRESHOLD,
};
use crate::worker::{KernelTuning, PipelineStrategy, StreamSettings};

pub const STREAM_SLOTS: usize = 5;
pub const MIN_FRAME_INTERVAL_MS: u64 = 1;
pub const MAX_FRAME_INTERVAL_MS: u64 = 100;

const DEFAULT_FRAME_INTERVAL_MS: i64 = 30;
const DEFAULT_BAYER: &str = "RG";
const DEFAULT_LEARNING_RATE: f32 = -1.0;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct PipelineConfigFile {
    general: Option<GeneralFile>,
    mog_parameters: Option<MogParametersFile>,
    work_group_size: Option<WorkGroupSizeFile>,
    streams: Option<BTreeMap<String, StreamOverrideFile>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct GeneralFile {
    device_selection: Option<String>,
    #[serde(rename = "VideoStream1")]
    video_stream_1: Option<String>,
    #[serde(rename = "VideoStream2")]
    video_stream_2: Option<String>,
    #[serde(rename = "VideoStream3")]
    video_stream_3: Option<String>,
    #[serde(rename = "VideoStream4")]
    video_stream_4: Option<String>,
    #[serde(rename = "VideoStream5")]
    video_stream_5: Option<String>,
    frame_interval: Option<i64>,
    show_source_frame: Option<YesFlag>,
    show_intermediate_frame: Option<YesFlag>,
    bayer: Option<String>,
    pipeline: Option<String>,
}

/// Display switches: only the text "yes" turns them on.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum YesFlag {
    Text(String),
    Other(IgnoredAny),
}

impl YesFlag {
    fn enabled(&self) -> bool {
        matches!(self, YesFlag::Text(value) if value == "yes")
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct MogParametersFile {
    learning_rate: Option<f32>,
    num_mixtures: Option<i64>,
    history: Option<u32>,
    background_ratio: Option<f32>,
    variance_threshold: Option<f32>,
    initial_weight: Option<f32>,
    initial_variance: Option<f32>,
    min_variance: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct WorkGroupSizeFile {
    #[serde(rename = "X")]
    x: Option<i64>,
    #[serde(rename = "Y")]
    y: Option<i64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "PascalCase")]
struct StreamOverrideFile {
    learning_rate: Option<f32>,
    num_mixtures: Option<i64>,
    background_ratio: Option<f32>,
}

/// Model parameters shared by every stream unless overridden.
#[derive(Debug, Clone, PartialEq)]
pub struct MogSettings {
    pub learning_rate: f32,
    pub num_mixtures: i64,
    pub history: u32,
    pub background_ratio: f32,
    pub tuning: KernelTuning,
}

/// `[Streams.VideoStreamN]` values that replace the shared ones for slot N.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOverride {
    pub learning_rate: Option<f32>,
    pub num_mixtures: Option<i64>,
    pub background_ratio: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub device_selection: DeviceSelection,
    /// `VideoStream1`..`VideoStream5`; empty identifiers are `None`.
    pub video_streams: Vec<Option<String>>,
    /// Milliseconds, already clamped.
    pub frame_interval_ms: u64,
    pub show_source_frame: bool,
    pub show_intermediate_frame: bool,
    pub bayer: String,
    pub pipeline: PipelineStrategy,
    pub mog: MogSettings,
    /// Raw `WorkGroupSize.X` / `.Y`; see `work_group`.
    pub work_group_x: i64,
    pub work_group_y: i64,
    pub overrides: BTreeMap<usize, StreamOverride>,
}

impl PipelineConfig {
    /// Load from `path`, or start from defaults when there is none. Then
    /// apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => PipelineConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let general = file.general.unwrap_or_default();
        let mog = file.mog_parameters.unwrap_or_default();
        let work_group = file.work_group_size.unwrap_or_default();

        let device_selection = match general.device_selection.as_deref() {
            Some(value) => value.parse()?,
            None => DeviceSelection::default(),
        };
        let pipeline = match general.pipeline.as_deref() {
            Some(value) => value.parse()?,
            None => PipelineStrategy::default(),
        };
        let video_streams = [
            general.video_stream_1,
            general.video_stream_2,
            general.video_stream_3,
            general.video_stream_4,
            general.video_stream_5,
        ]
        .into_iter()
        .map(|slot| slot.map(|id| id.trim().to_string()).filter(|id| !id.is_empty()))
        .collect();

        let mut overrides = BTreeMap::new();
        for (key, value) in file.streams.unwrap_or_default() {
            let slot = stream_slot(&key)?;
            overrides.insert(
                slot,
                StreamOverride {
                    learning_rate: value.learning_rate,
                    num_mixtures: value.num_mixtures,
                    background_ratio: value.background_ratio,
                },
            );
        }

        Ok(Self {
            device_selection,
            video_streams,
            frame_interval_ms: clamp_frame_interval(
                general.frame_interval.unwrap_or(DEFAULT_FRAME_INTERVAL_MS),
            ),
            show_source_frame: general
                .show_source_frame
                .map(|flag| flag.enabled())
                .unwrap_or(false),
            show_intermediate_frame: general
                .show_intermediate_frame
                .map(|flag| flag.enabled())
                .unwrap_or(false),
            bayer: general
                .bayer
                .map(|bayer| bayer.trim().to_string())
                .unwrap_or_else(|| DEFAULT_BAYER.to_string()),
            pipeline,
            mog: MogSettings {
                learning_rate: mog.learning_rate.unwrap_or(DEFAULT_LEARNING_RATE),
                num_mixtures: mog.num_mixtures.unwrap_or(DEFAULT_MIXTURES as i64),
                history: mog.history.unwrap_or(DEFAULT_HISTORY),
                background_ratio: mog.background_ratio.unwrap_or(DEFAULT_BACKGROUND_RATIO),
                tuning: KernelTuning {
                    variance_threshold: mog
                        .variance_threshold
                        .unwrap_or(DEFAULT_VARIANCE_THRESHOLD),
                    initial_weight: mog.initial_weight.unwrap_or(DEFAULT_INITIAL_WEIGHT),
                    initial_variance: mog.initial_variance.unwrap_or(DEFAULT_INITIAL_VARIANCE),
                    min_variance: mog.min_variance.unwrap_or(DEFAULT_MIN_VARIANCE),
                },
            },
            work_group_x: work_group.x.unwrap_or(DEFAULT_WORK_GROUP as i64),
            work_group_y: work_group.y.unwrap_or(DEFAULT_WORK_GROUP as i64),
            overrides,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(interval) = std::env::var("MOG_FRAME_INTERVAL") {
            if !interval.trim().is_empty() {
                let ms: i64 = interval
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("MOG_FRAME_INTERVAL must be an integer number of milliseconds"))?;
                self.frame_interval_ms = clamp_frame_interval(ms);
            }
        }
        if let Ok(selection) = std::env::var("MOG_DEVICE_SELECTION") {
            if !selection.trim().is_empty() {
                self.device_selection = selection.parse()?;
            }
        }
        if let Ok(pipeline) = std::env::var("MOG_PIPELINE") {
            if !pipeline.trim().is_empty() {
                self.pipeline = pipeline.parse()?;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.pipeline == PipelineStrategy::Offload {
            self.work_group()?;
        }
        if !(0.0..=1.0).contains(&self.mog.background_ratio) {
            bail!(
                "MogParameters.BackgroundRatio must be within [0, 1] (got {})",
                self.mog.background_ratio
            );
        }
        for (slot, stream) in &self.overrides {
            if let Some(ratio) = stream.background_ratio {
                if !(0.0..=1.0).contains(&ratio) {
                    bail!(
                        "Streams.VideoStream{}.BackgroundRatio must be within [0, 1] (got {})",
                        slot,
                        ratio
                    );
                }
            }
        }
        Ok(())
    }

    pub fn work_group(&self) -> Result<WorkGroupSize> {
        WorkGroupSize::new(self.work_group_x, self.work_group_y)
    }

    /// Settings for every configured slot, in slot order. Empty slots are
    /// skipped.
    pub fn stream_settings(&self) -> Vec<StreamSettings> {
        self.video_streams
            .iter()
            .enumerate()
            .filter_map(|(index, identifier)| {
                let slot = index + 1;
                let identifier = identifier.as_ref()?;
                let overrides = self.overrides.get(&slot).cloned().unwrap_or_default();
                Some(StreamSettings {
                    title: format!("Video Stream {}", slot),
                    identifier: identifier.clone(),
                    bayer: self.bayer.clone(),
                    learning_rate: overrides.learning_rate.unwrap_or(self.mog.learning_rate),
                    history: self.mog.history,
                    mixtures: overrides.num_mixtures.unwrap_or(self.mog.num_mixtures),
                    background_ratio: overrides
                        .background_ratio
                        .unwrap_or(self.mog.background_ratio),
                    tuning: self.mog.tuning,
                    show_intermediate: self.show_intermediate_frame,
                })
            })
            .collect()
    }
}

/// Clamp a configured interval to `[1, 100]` ms.
pub fn clamp_frame_interval(ms: i64) -> u64 {
    let clamped = ms.clamp(MIN_FRAME_INTERVAL_MS as i64, MAX_FRAME_INTERVAL_MS as i64) as u64;
    if clamped as i64 != ms {
        log::warn!(
            "General.FrameInterval {} ms is out of range, using {} ms",
            ms,
            clamped
        );
    }
    clamped
}

fn stream_slot(key: &str) -> Result<usize> {
    key.strip_prefix("VideoStream")
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| (1..=STREAM_SLOTS).contains(n))
        .ok_or_else(|| {
            anyhow!(
                "Streams.{} does not name a stream slot (VideoStream1..VideoStream{})",
                key,
                STREAM_SLOTS
            )
        })
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
