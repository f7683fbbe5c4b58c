//! Capture configuration
//!
//! Plain serde structs handed to each worker at construction. Only the
//! transform and detection threshold are hot-changeable, through guarded
//! setters on the running components.

use crate::capture::Transform;
use crate::detection::{ForestParams, HeuristicConfig};
use crate::utils::fs::write_json_atomic;
use crate::utils::AppResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where a camera's frames come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CameraSource {
    /// Local capture device by index
    Device { index: u32 },
    /// Network stream (RTSP, HTTP MJPEG, anything ffmpeg opens)
    Network { url: String },
}

impl CameraSource {
    pub fn is_network(&self) -> bool {
        matches!(self, CameraSource::Network { .. })
    }
}

impl std::fmt::Display for CameraSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraSource::Device { index } => write!(f, "device {}", index),
            CameraSource::Network { url } => write!(f, "{}", url),
        }
    }
}

/// Per-camera configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraConfig {
    /// Stable camera identifier used in file names and events
    pub id: String,

    /// Human readable label
    #[serde(default)]
    pub label: String,

    pub source: CameraSource,

    #[serde(default)]
    pub transform: Transform,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl CameraConfig {
    pub fn new(id: impl Into<String>, source: CameraSource) -> Self {
        Self {
            id: id.into(),
            label: String::new(),
            source,
            transform: Transform::default(),
            enabled: true,
        }
    }

    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

/// Reconnection policy for camera sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// None retries for as long as the camera stays enabled
    pub max_attempts: Option<u32>,
    /// Consecutive empty reads tolerated before the stream counts as interrupted
    pub max_empty_reads: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: None,
            max_empty_reads: 30,
        }
    }
}

/// Classifier behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassifierConfig {
    /// Whether learned mode may ever be entered
    pub learned_mode: bool,
    /// Labeled samples needed before the first retrain
    pub retrain_threshold: usize,
    /// Once learned, retrain after this many new labels
    pub retrain_interval: usize,
    /// Confidence threshold at the default 30% sensitivity
    pub decision_threshold: f32,
    pub forest: ForestParams,
    pub heuristic: HeuristicConfig,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            learned_mode: true,
            retrain_threshold: 10,
            retrain_interval: 1,
            decision_threshold: 0.45,
            forest: ForestParams::default(),
            heuristic: HeuristicConfig::default(),
        }
    }
}

/// Sensitivity percentage that maps onto `decision_threshold` unchanged
pub const REFERENCE_THRESHOLD_PERCENT: f32 = 30.0;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureConfig {
    pub pre_trigger_seconds: f64,
    pub post_trigger_seconds: f64,
    pub fps: u32,

    pub audio_sample_rate: u32,
    pub audio_chunk_size: usize,
    /// Input device name (None = system default)
    pub audio_device: Option<String>,
    /// Detection sensitivity slider, 1-100
    pub detection_threshold_percent: f32,
    /// Whether audio triggers fire as soon as the session starts
    pub armed: bool,

    pub cameras: Vec<CameraConfig>,
    /// Camera whose clip file gets the bare shot name and the thumbnail
    pub primary_camera: Option<String>,

    /// Timestamped per launch, never read from or written to the settings file
    #[serde(skip)]
    pub session_dir: PathBuf,
    pub training_dir: PathBuf,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,

    pub reconnect: ReconnectConfig,
    pub classifier: ClassifierConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            pre_trigger_seconds: 1.0,
            post_trigger_seconds: 2.0,
            fps: 30,
            audio_sample_rate: 44_100,
            audio_chunk_size: 1_024,
            audio_device: None,
            detection_threshold_percent: REFERENCE_THRESHOLD_PERCENT,
            armed: true,
            cameras: Vec::new(),
            primary_camera: None,
            session_dir: default_session_dir(),
            training_dir: default_base_dir().join("training_data"),
            thumbnail_width: 160,
            thumbnail_height: 90,
            reconnect: ReconnectConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("GolfSwings")
}

fn default_session_dir() -> PathBuf {
    let name = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    default_base_dir().join(name)
}

impl CaptureConfig {
    /// Load from a JSON file. A missing file yields defaults; a corrupt file is
    /// moved aside to `<name>.corrupt` and defaults are used.
    pub fn load(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            tracing::info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<CaptureConfig>(&content) {
            Ok(mut config) => {
                config.validate();
                tracing::info!("Config loaded from {:?}", path);
                Ok(config)
            }
            Err(e) => {
                tracing::warn!("Corrupt config file, starting fresh: {}", e);
                let corrupt = path.with_extension("corrupt");
                if let Err(e) = std::fs::rename(path, &corrupt) {
                    tracing::warn!("Could not move corrupt config aside: {}", e);
                }
                Ok(Self::default())
            }
        }
    }

    /// Save to a JSON file with atomic replace
    pub fn save(&self, path: &Path) -> AppResult<()> {
        write_json_atomic(path, self)?;
        Ok(())
    }

    /// Clamp values to safe ranges
    pub fn validate(&mut self) {
        self.pre_trigger_seconds = clamp_f64(self.pre_trigger_seconds, 0.5, 30.0, 1.0);
        self.post_trigger_seconds = clamp_f64(self.post_trigger_seconds, 0.5, 30.0, 2.0);
        self.fps = self.fps.clamp(1, 120);
        self.audio_sample_rate = self.audio_sample_rate.clamp(8_000, 96_000);
        self.audio_chunk_size = self.audio_chunk_size.clamp(256, 8_192);
        self.detection_threshold_percent = if self.detection_threshold_percent.is_finite() {
            self.detection_threshold_percent.clamp(1.0, 100.0)
        } else {
            REFERENCE_THRESHOLD_PERCENT
        };
        self.thumbnail_width = self.thumbnail_width.max(1);
        self.thumbnail_height = self.thumbnail_height.max(1);
        self.reconnect.base_delay_ms = self.reconnect.base_delay_ms.max(1);
        self.reconnect.max_delay_ms = self.reconnect.max_delay_ms.max(self.reconnect.base_delay_ms);
        self.classifier.retrain_threshold = self.classifier.retrain_threshold.max(2);
        self.classifier.retrain_interval = self.classifier.retrain_interval.max(1);
        for camera in &mut self.cameras {
            camera.transform = camera.transform.normalized();
        }
    }

    pub fn pre_trigger_us(&self) -> u64 {
        (self.pre_trigger_seconds * 1_000_000.0).round() as u64
    }

    pub fn post_trigger_us(&self) -> u64 {
        (self.post_trigger_seconds * 1_000_000.0).round() as u64
    }

    pub fn chunks_per_second(&self) -> f64 {
        self.audio_sample_rate as f64 / self.audio_chunk_size as f64
    }

    /// Frames needed to cover the pre-trigger window
    pub fn frame_history_capacity(&self) -> usize {
        history_capacity(self.pre_trigger_seconds, self.fps as f64)
    }

    /// Audio chunks needed to cover the pre-trigger window
    pub fn audio_history_capacity(&self) -> usize {
        history_capacity(self.pre_trigger_seconds, self.chunks_per_second())
    }

    pub fn camera(&self, id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.id == id)
    }

    /// Primary camera id, falling back to the first enabled camera
    pub fn primary_camera_id(&self) -> Option<String> {
        self.primary_camera.clone().or_else(|| {
            self.cameras
                .iter()
                .find(|c| c.enabled)
                .map(|c| c.id.clone())
        })
    }

    /// Classifier confidence threshold for the current sensitivity
    pub fn effective_threshold(&self) -> f32 {
        effective_threshold(self.classifier.decision_threshold, self.detection_threshold_percent)
    }
}

/// `ceil(seconds × rate)`, at least one slot
pub fn history_capacity(seconds: f64, rate: f64) -> usize {
    ((seconds * rate).ceil() as usize).max(1)
}

/// Scale the decision threshold by the sensitivity slider. The reference
/// percentage leaves it unchanged; higher percentages demand more confidence.
pub fn effective_threshold(decision_threshold: f32, percent: f32) -> f32 {
    let percent = percent.clamp(1.0, 100.0);
    (decision_threshold * percent / REFERENCE_THRESHOLD_PERCENT).clamp(0.01, 1.0)
}

fn clamp_f64(value: f64, min: f64, max: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}
