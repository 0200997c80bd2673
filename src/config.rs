use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::{CameraSettings, RtspConfig};
use crate::monitor::{
    SamplingPolicy, DEFAULT_CHEATING_AFTER, DEFAULT_DETAILED_EVERY, DEFAULT_WARMUP_FRAMES,
};
use crate::pipeline::{PipelineSettings, DEFAULT_QUEUE_SIZE};
use crate::process::ProcessingSettings;
use crate::CameraId;

const DEFAULT_STUDENTS_DIR: &str = "students";
const DEFAULT_THRESHOLD: f32 = 0.7;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
const DEFAULT_MAX_RESULTS: usize = 5;
const DEFAULT_CAMERA_URL: &str = "stub://front_camera";
const DEFAULT_RTSP_FPS: u32 = 10;
const DEFAULT_RTSP_WIDTH: u32 = 640;
const DEFAULT_RTSP_HEIGHT: u32 = 480;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Deserialize, Default)]
struct SentinelConfigFile {
    students_dir: Option<PathBuf>,
    threshold: Option<f32>,
    queue_size: Option<usize>,
    exclude_categories: Option<Vec<String>>,
    cameras: Option<Vec<CameraConfigFile>>,
    processing: Option<ProcessingConfigFile>,
    rtsp: Option<RtspConfigFile>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    url: String,
    id: Option<CameraId>,
    name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ProcessingConfigFile {
    score_threshold: Option<f32>,
    max_results: Option<usize>,
    detailed_warmup_frames: Option<u64>,
    detailed_every: Option<u64>,
    cheating_after: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RtspConfigFile {
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    reconnect_attempts: Option<u32>,
    stop_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub students_dir: PathBuf,
    /// Minimum cosine similarity (exclusive) for a recognition match.
    pub threshold: f32,
    pub queue_size: usize,
    /// Lowercased detection labels to ignore.
    pub exclude_categories: Vec<String>,
    pub cameras: Vec<CameraSpec>,
    pub processing: ProcessingOptions,
    pub rtsp: RtspSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSpec {
    pub url: String,
    pub id: Option<CameraId>,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProcessingOptions {
    pub score_threshold: f32,
    pub max_results: usize,
    pub detailed_warmup_frames: u64,
    pub detailed_every: u64,
    pub cheating_after: u32,
}

#[derive(Debug, Clone)]
pub struct RtspSettings {
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub reconnect_attempts: u32,
    pub stop_timeout: Duration,
}

impl SentinelConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTINEL_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentinelConfigFile) -> Self {
        let processing = file.processing.unwrap_or_default();
        let rtsp = file.rtsp.unwrap_or_default();
        let cameras = match file.cameras {
            Some(cameras) => cameras
                .into_iter()
                .map(|c| CameraSpec {
                    url: c.url,
                    id: c.id,
                    name: c.name,
                })
                .collect(),
            None => vec![CameraSpec::url(DEFAULT_CAMERA_URL)],
        };
        Self {
            students_dir: file
                .students_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STUDENTS_DIR)),
            threshold: file.threshold.unwrap_or(DEFAULT_THRESHOLD),
            queue_size: file.queue_size.unwrap_or(DEFAULT_QUEUE_SIZE),
            exclude_categories: file.exclude_categories.unwrap_or_default(),
            cameras,
            processing: ProcessingOptions {
                score_threshold: processing
                    .score_threshold
                    .unwrap_or(DEFAULT_SCORE_THRESHOLD),
                max_results: processing.max_results.unwrap_or(DEFAULT_MAX_RESULTS),
                detailed_warmup_frames: processing
                    .detailed_warmup_frames
                    .unwrap_or(DEFAULT_WARMUP_FRAMES),
                detailed_every: processing.detailed_every.unwrap_or(DEFAULT_DETAILED_EVERY),
                cheating_after: processing.cheating_after.unwrap_or(DEFAULT_CHEATING_AFTER),
            },
            rtsp: RtspSettings {
                target_fps: rtsp.target_fps.unwrap_or(DEFAULT_RTSP_FPS),
                width: rtsp.width.unwrap_or(DEFAULT_RTSP_WIDTH),
                height: rtsp.height.unwrap_or(DEFAULT_RTSP_HEIGHT),
                reconnect_attempts: rtsp
                    .reconnect_attempts
                    .unwrap_or(DEFAULT_RECONNECT_ATTEMPTS),
                stop_timeout: Duration::from_millis(
                    rtsp.stop_timeout_ms.unwrap_or(DEFAULT_STOP_TIMEOUT_MS),
                ),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("SENTINEL_STUDENTS_DIR") {
            if !dir.trim().is_empty() {
                self.students_dir = PathBuf::from(dir);
            }
        }
        if let Ok(threshold) = std::env::var("SENTINEL_THRESHOLD") {
            self.threshold = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("SENTINEL_THRESHOLD must be a number in (0, 1]"))?;
        }
        if let Ok(queue_size) = std::env::var("SENTINEL_QUEUE_SIZE") {
            self.queue_size = queue_size
                .trim()
                .parse()
                .map_err(|_| anyhow!("SENTINEL_QUEUE_SIZE must be a positive integer"))?;
        }
        if let Ok(categories) = std::env::var("SENTINEL_EXCLUDE_CATEGORIES") {
            self.exclude_categories = split_csv(&categories);
        }
        if let Ok(cameras) = std::env::var("SENTINEL_CAMERAS") {
            let parsed = split_csv(&cameras);
            if !parsed.is_empty() {
                self.cameras = parsed.iter().map(|url| CameraSpec::url(url)).collect();
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(anyhow!(
                "threshold must be in (0, 1], got {}",
                self.threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.processing.score_threshold) {
            return Err(anyhow!(
                "score_threshold must be in [0, 1], got {}",
                self.processing.score_threshold
            ));
        }
        if self.queue_size == 0 {
            return Err(anyhow!("queue_size must be at least 1"));
        }
        if self.processing.detailed_every == 0 {
            return Err(anyhow!("detailed_every must be at least 1"));
        }
        if self.rtsp.width == 0 || self.rtsp.height == 0 {
            return Err(anyhow!("rtsp frame size must be non-zero"));
        }
        if self.cameras.iter().any(|c| c.url.trim().is_empty()) {
            return Err(anyhow!("camera url must not be empty"));
        }

        let mut categories: Vec<String> = self
            .exclude_categories
            .iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        categories.sort();
        categories.dedup();
        self.exclude_categories = categories;
        Ok(())
    }

    /// Runtime settings for `Pipeline`.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            queue_size: self.queue_size,
            camera: CameraSettings {
                reconnect_attempts: self.rtsp.reconnect_attempts,
                stop_timeout: self.rtsp.stop_timeout,
                ..CameraSettings::default()
            },
            processing: ProcessingSettings {
                threshold: self.threshold,
                score_threshold: self.processing.score_threshold,
                max_results: self.processing.max_results,
                sampling: SamplingPolicy {
                    warmup_frames: self.processing.detailed_warmup_frames,
                    every: self.processing.detailed_every,
                },
                cheating_after: self.processing.cheating_after,
                ..ProcessingSettings::default()
            },
            rtsp: RtspConfig {
                url: String::new(),
                target_fps: self.rtsp.target_fps,
                width: self.rtsp.width,
                height: self.rtsp.height,
            },
            exclude_categories: self.exclude_categories.clone(),
        }
    }
}

impl CameraSpec {
    fn url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            id: None,
            name: None,
        }
    }
}

fn read_config_file(path: &Path) -> Result<SentinelConfigFile> {
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

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
