// src/config.rs - Application configuration loaded from JSON
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "POSECAM_CONFIG";

/// Published BlazePose "full" landmark network (256x256 NHWC input, 39x5
/// screen landmarks followed by the pose presence score).
pub const DEFAULT_MODEL_URL: &str =
    "https://huggingface.co/unity/inference-engine-blaze-pose/resolve/main/models/pose_landmarks_detector_full.onnx";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub camera: CameraConfig,
    pub detector: DetectorConfig,
    pub table: TableConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub mirror: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: 640,
            height: 480,
            fps: 30,
            mirror: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Simulated,
    Onnx,
}

impl BackendKind {
    /// The real model when it is compiled in; the animated stand-in otherwise.
    pub fn compiled_default() -> Self {
        if cfg!(feature = "onnx") {
            BackendKind::Onnx
        } else {
            BackendKind::Simulated
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Delegate {
    Gpu,
    Cpu,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputLayout {
    Nchw,
    Nhwc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    pub backend: BackendKind,
    /// Remote location of the pose landmark model, fetched once at startup.
    pub model_url: Option<String>,
    /// Local model file, preferred over `model_url` when set.
    pub model_path: Option<PathBuf>,
    pub delegate: Delegate,
    pub max_poses: usize,
    pub input_size: u32,
    pub input_layout: InputLayout,
    pub presence_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::compiled_default(),
            model_url: Some(DEFAULT_MODEL_URL.to_string()),
            model_path: None,
            delegate: Delegate::Gpu,
            max_poses: 2,
            input_size: 256,
            input_layout: InputLayout::Nhwc,
            presence_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TableConfig {
    pub refresh_interval_ms: f64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 500.0,
        }
    }
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        directories::ProjectDirs::from("com", "posecam", "PoseCam")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Loads the config from the default location. A missing file yields the
    /// defaults; an unreadable one is logged and also yields the defaults.
    pub fn load() -> Self {
        let Some(path) = Self::default_path() else {
            warn!("No config directory available, using defaults");
            return Self::default();
        };

        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Self::default();
        }

        match Self::load_from(&path) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded config");
                config
            }
            Err(e) => {
                warn!("{:#}; falling back to defaults", e);
                Self::default()
            }
        }
    }
}
