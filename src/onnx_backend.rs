// src/onnx_backend.rs - ONNX Runtime pose landmark backend
//
// Runs a BlazePose landmark network over the whole frame. The network has no
// person detector in front of it, so it reports at most one person and works
// best when the subject fills most of the frame.
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

use crate::config::{Delegate, DetectorConfig, InputLayout};
use crate::data::{Landmark, LandmarkSet, POSE_LANDMARK_COUNT};
use crate::mediapipe_bridge::{DetectorError, PoseBackend, RunningMode};

/// Values per landmark in the screen landmark output: x, y, z, visibility, presence.
const LANDMARK_STRIDE: usize = 5;

pub struct OnnxBackend {
    session: Session,
    input_name: String,
    landmarks_output: String,
    presence_output: String,
    input_size: u32,
    input_layout: InputLayout,
    presence_threshold: f32,
    mode: RunningMode,
}

impl OnnxBackend {
    pub async fn load(config: &DetectorConfig) -> Result<Self> {
        let model = fetch_model(config).await?;

        let mut builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
        builder = match config.delegate {
            Delegate::Gpu => builder.with_execution_providers([
                CUDAExecutionProvider::default().build(),
                CPUExecutionProvider::default().build(),
            ])?,
            Delegate::Cpu => builder.with_execution_providers([CPUExecutionProvider::default().build()])?,
        };
        let session = builder
            .commit_from_memory(&model)
            .context("Failed to load ONNX pose model")?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .context("Pose model has no inputs")?;
        if session.outputs.len() < 2 {
            bail!("Pose model must expose landmark and presence outputs");
        }
        let landmarks_output = session.outputs[0].name.clone();
        let presence_output = session.outputs[1].name.clone();

        if config.max_poses > 1 {
            info!(
                "ONNX landmark model tracks a single person; max_poses={} is capped at 1",
                config.max_poses
            );
        }

        Ok(Self {
            session,
            input_name,
            landmarks_output,
            presence_output,
            input_size: config.input_size,
            input_layout: config.input_layout,
            presence_threshold: config.presence_threshold,
            mode: RunningMode::Image,
        })
    }

    fn preprocess(&self, frame: &DynamicImage) -> Array4<f32> {
        let size = self.input_size;
        let resized = frame.resize_exact(size, size, FilterType::Triangle).to_rgb8();
        let n = size as usize;

        let mut input = match self.input_layout {
            InputLayout::Nchw => Array4::<f32>::zeros((1, 3, n, n)),
            InputLayout::Nhwc => Array4::<f32>::zeros((1, n, n, 3)),
        };
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                match self.input_layout {
                    InputLayout::Nchw => input[[0, c, y, x]] = value,
                    InputLayout::Nhwc => input[[0, y, x, c]] = value,
                }
            }
        }
        input
    }
}

async fn fetch_model(config: &DetectorConfig) -> Result<Vec<u8>> {
    if let Some(path) = &config.model_path {
        info!("Loading pose model from {}", path.display());
        return tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read model {}", path.display()));
    }

    let Some(url) = &config.model_url else {
        bail!("No pose model configured (set detector.model_url or detector.model_path)");
    };
    info!("Fetching pose model from {}", url);
    let bytes = reqwest::get(url)
        .await
        .with_context(|| format!("Failed to fetch {}", url))?
        .error_for_status()?
        .bytes()
        .await?;
    debug!("Fetched {} bytes of model data", bytes.len());
    Ok(bytes.to_vec())
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[async_trait(?Send)]
impl PoseBackend for OnnxBackend {
    fn name(&self) -> &str {
        "onnx"
    }

    async fn set_running_mode(&mut self, mode: RunningMode) -> Result<(), DetectorError> {
        self.mode = mode;
        Ok(())
    }

    async fn detect_for_video(
        &mut self,
        frame: &DynamicImage,
        _timestamp_ms: f64,
    ) -> Result<Vec<LandmarkSet>, DetectorError> {
        if self.mode != RunningMode::Video {
            return Err(DetectorError::WrongMode(self.mode));
        }

        let inference = |e: ort::Error| DetectorError::Inference(e.to_string());
        let input = Tensor::from_array(self.preprocess(frame)).map_err(inference)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .map_err(inference)?;

        let presence: ndarray::ArrayViewD<f32> = outputs[self.presence_output.as_str()]
            .try_extract_array()
            .map_err(inference)?;
        let presence = presence.iter().copied().next().unwrap_or(0.0);
        if presence < self.presence_threshold {
            return Ok(Vec::new());
        }

        let raw: ndarray::ArrayViewD<f32> = outputs[self.landmarks_output.as_str()]
            .try_extract_array()
            .map_err(inference)?;
        let values: Vec<f32> = raw.iter().copied().collect();
        if values.len() < POSE_LANDMARK_COUNT * LANDMARK_STRIDE {
            return Err(DetectorError::Inference(format!(
                "expected {} landmark values, got {}",
                POSE_LANDMARK_COUNT * LANDMARK_STRIDE,
                values.len()
            )));
        }

        let scale = self.input_size as f32;
        let landmarks = values
            .chunks_exact(LANDMARK_STRIDE)
            .take(POSE_LANDMARK_COUNT)
            .map(|v| Landmark::new(v[0] / scale, v[1] / scale, v[2] / scale).with_visibility(sigmoid(v[3])))
            .collect();

        Ok(vec![LandmarkSet::new(landmarks)])
    }
}
