// src/mediapipe_bridge.rs - Pose landmarker binding and backends
use anyhow::Result;
use async_trait::async_trait;
use image::DynamicImage;
use nalgebra::{Rotation2, Vector2};
use thiserror::Error;
use tracing::{error, info};

use crate::config::{BackendKind, DetectorConfig};
use crate::data::{Landmark, LandmarkSet, POSE_LANDMARK_COUNT};

/// Pairs of landmark indices joined by a connector in the skeleton overlay.
pub const POSE_CONNECTIONS: [(usize, usize); 35] = [
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 7),
    (0, 4),
    (4, 5),
    (5, 6),
    (6, 8),
    (9, 10),
    (11, 12),
    (11, 13),
    (13, 15),
    (15, 17),
    (15, 19),
    (15, 21),
    (17, 19),
    (12, 14),
    (14, 16),
    (16, 18),
    (16, 20),
    (16, 22),
    (18, 20),
    (11, 23),
    (12, 24),
    (23, 24),
    (23, 25),
    (24, 26),
    (25, 27),
    (26, 28),
    (27, 29),
    (28, 30),
    (29, 31),
    (30, 32),
    (27, 31),
    (28, 32),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningMode {
    /// Single still images. Every landmarker starts here.
    Image,
    /// Consecutive video frames with increasing timestamps.
    Video,
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("pose landmarker is not loaded")]
    NotLoaded,
    #[error("pose landmarker is in {0:?} mode")]
    WrongMode(RunningMode),
    #[error("timestamp {current} ms is earlier than the previous {previous} ms")]
    NonMonotonicTimestamp { previous: f64, current: f64 },
    #[error("inference failed: {0}")]
    Inference(String),
}

/// A pose landmark model able to process video frames.
#[async_trait(?Send)]
pub trait PoseBackend: Send {
    fn name(&self) -> &str;

    async fn set_running_mode(&mut self, mode: RunningMode) -> Result<(), DetectorError>;

    /// Returns one landmark set per detected person.
    async fn detect_for_video(
        &mut self,
        frame: &DynamicImage,
        timestamp_ms: f64,
    ) -> Result<Vec<LandmarkSet>, DetectorError>;
}

/// Call-through to the loaded backend. Never fails towards the caller:
/// detection errors are logged and reported as "no detections".
pub struct PoseDetector {
    backend: Option<Box<dyn PoseBackend>>,
    mode: RunningMode,
    last_timestamp_ms: Option<f64>,
}

impl PoseDetector {
    pub fn new(backend: Box<dyn PoseBackend>) -> Self {
        Self {
            backend: Some(backend),
            mode: RunningMode::Image,
            last_timestamp_ms: None,
        }
    }

    /// A detector whose model failed to load.
    pub fn unloaded() -> Self {
        Self {
            backend: None,
            mode: RunningMode::Image,
            last_timestamp_ms: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.backend.is_some()
    }

    pub fn mode(&self) -> RunningMode {
        self.mode
    }

    pub fn connections(&self) -> &'static [(usize, usize)] {
        &POSE_CONNECTIONS
    }

    /// Switches the backend to video mode the first time it is called.
    pub async fn ensure_streaming(&mut self) -> Result<(), DetectorError> {
        if self.mode == RunningMode::Video {
            return Ok(());
        }

        let backend = self.backend.as_mut().ok_or(DetectorError::NotLoaded)?;
        backend.set_running_mode(RunningMode::Video).await?;
        self.mode = RunningMode::Video;
        info!("{} landmarker switched to video mode", backend.name());
        Ok(())
    }

    pub async fn detect(&mut self, frame: &DynamicImage, timestamp_ms: f64) -> Vec<LandmarkSet> {
        match self.try_detect(frame, timestamp_ms).await {
            Ok(sets) => sets,
            Err(e) => {
                error!("Error during pose detection: {}", e);
                Vec::new()
            }
        }
    }

    async fn try_detect(
        &mut self,
        frame: &DynamicImage,
        timestamp_ms: f64,
    ) -> Result<Vec<LandmarkSet>, DetectorError> {
        let backend = self.backend.as_mut().ok_or(DetectorError::NotLoaded)?;
        if self.mode != RunningMode::Video {
            return Err(DetectorError::WrongMode(self.mode));
        }
        if let Some(previous) = self.last_timestamp_ms {
            if timestamp_ms < previous {
                return Err(DetectorError::NonMonotonicTimestamp {
                    previous,
                    current: timestamp_ms,
                });
            }
        }
        self.last_timestamp_ms = Some(timestamp_ms);

        backend.detect_for_video(frame, timestamp_ms).await
    }
}

/// Loads the configured backend. Runs once at startup.
pub async fn load_detector(config: DetectorConfig) -> Result<PoseDetector> {
    let backend: Box<dyn PoseBackend> = match config.backend {
        BackendKind::Simulated => Box::new(SimulatedBackend::new(config.max_poses)),
        #[cfg(feature = "onnx")]
        BackendKind::Onnx => Box::new(crate::onnx_backend::OnnxBackend::load(&config).await?),
        #[cfg(not(feature = "onnx"))]
        BackendKind::Onnx => {
            anyhow::bail!("the onnx backend was not compiled in (enable the `onnx` feature)")
        }
    };

    info!(
        "{} landmarker ready (max {} poses)",
        backend.name(),
        config.max_poses
    );
    Ok(PoseDetector::new(backend))
}

/// Rest pose of a person facing the camera, in normalized frame coordinates.
const REST_POSE: [[f32; 3]; POSE_LANDMARK_COUNT] = [
    [0.50, 0.20, -0.30],
    [0.52, 0.18, -0.28],
    [0.53, 0.18, -0.28],
    [0.54, 0.18, -0.28],
    [0.48, 0.18, -0.28],
    [0.47, 0.18, -0.28],
    [0.46, 0.18, -0.28],
    [0.56, 0.20, -0.15],
    [0.44, 0.20, -0.15],
    [0.52, 0.23, -0.26],
    [0.48, 0.23, -0.26],
    [0.60, 0.32, -0.05],
    [0.40, 0.32, -0.05],
    [0.65, 0.45, -0.05],
    [0.35, 0.45, -0.05],
    [0.67, 0.57, -0.10],
    [0.33, 0.57, -0.10],
    [0.68, 0.60, -0.12],
    [0.32, 0.60, -0.12],
    [0.67, 0.61, -0.12],
    [0.33, 0.61, -0.12],
    [0.66, 0.59, -0.11],
    [0.34, 0.59, -0.11],
    [0.56, 0.62, 0.00],
    [0.44, 0.62, 0.00],
    [0.57, 0.78, 0.02],
    [0.43, 0.78, 0.02],
    [0.57, 0.93, 0.06],
    [0.43, 0.93, 0.06],
    [0.56, 0.95, 0.07],
    [0.44, 0.95, 0.07],
    [0.59, 0.96, 0.03],
    [0.41, 0.96, 0.03],
];

const LEFT_SHOULDER: usize = 11;
const RIGHT_SHOULDER: usize = 12;
const LEFT_ARM: [usize; 5] = [13, 15, 17, 19, 21];
const RIGHT_ARM: [usize; 5] = [14, 16, 18, 20, 22];
/// Horizontal distance between consecutive simulated people.
const PERSON_SPACING: f32 = 0.3;

/// Animated stand-in for a real model: people waving their arms.
pub struct SimulatedBackend {
    mode: RunningMode,
    max_poses: usize,
}

impl SimulatedBackend {
    pub fn new(max_poses: usize) -> Self {
        Self {
            mode: RunningMode::Image,
            max_poses,
        }
    }

    fn person(&self, index: usize, t: f32) -> LandmarkSet {
        let phase = index as f32 * 1.5;
        let offset = index as f32 * PERSON_SPACING;
        let mut points = REST_POSE;

        swing(&mut points, LEFT_SHOULDER, &LEFT_ARM, -0.6 * (t + phase).sin() - 0.4);
        swing(&mut points, RIGHT_SHOULDER, &RIGHT_ARM, 0.6 * (t * 1.3 + phase).sin() + 0.4);

        let sway = 0.02 * (t * 0.5).sin();
        let reach = 0.08 * (t + phase).cos();
        LandmarkSet::new(
            points
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let z = if LEFT_ARM.contains(&i) || RIGHT_ARM.contains(&i) {
                        p[2] + reach
                    } else {
                        p[2]
                    };
                    Landmark::new(p[0] + offset + sway, p[1], z).with_visibility(0.99)
                })
                .collect(),
        )
    }
}

/// Rotates an arm chain around its shoulder in the image plane.
fn swing(points: &mut [[f32; 3]; POSE_LANDMARK_COUNT], pivot: usize, chain: &[usize], angle: f32) {
    let rotation = Rotation2::new(angle);
    let origin = Vector2::new(points[pivot][0], points[pivot][1]);
    for &i in chain {
        let rotated = origin + rotation * (Vector2::new(points[i][0], points[i][1]) - origin);
        points[i][0] = rotated.x;
        points[i][1] = rotated.y;
    }
}

#[async_trait(?Send)]
impl PoseBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn set_running_mode(&mut self, mode: RunningMode) -> Result<(), DetectorError> {
        self.mode = mode;
        Ok(())
    }

    async fn detect_for_video(
        &mut self,
        _frame: &DynamicImage,
        timestamp_ms: f64,
    ) -> Result<Vec<LandmarkSet>, DetectorError> {
        if self.mode != RunningMode::Video {
            return Err(DetectorError::WrongMode(self.mode));
        }

        let t = (timestamp_ms / 1000.0) as f32;
        Ok((0..self.max_poses).map(|i| self.person(i, t)).collect())
    }
}
