// src/video.rs - Camera capture and the capture session flag
use chrono::{DateTime, Local};
use image::DynamicImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
    Resolution,
};
use nokhwa::Camera;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CameraConfig;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera access was denied")]
    PermissionDenied,
    #[error("no usable camera: {0}")]
    DeviceUnavailable(String),
    #[error("camera stream failed: {0}")]
    Stream(String),
}

/// Anything that can produce video frames for the render loop.
pub trait FrameSource {
    /// Acquires the device and blocks until the first frame has decoded.
    /// That frame is handed back so it can be shown right away.
    fn start(&mut self) -> Result<DynamicImage, CaptureError>;
    /// Releases the device. Calling it while stopped does nothing.
    fn stop(&mut self);
    fn is_active(&self) -> bool;
    /// Size of the current video, `(0, 0)` while stopped or not ready.
    fn dimensions(&self) -> (u32, u32);
    fn grab_frame(&mut self) -> Result<DynamicImage, CaptureError>;
}

/// Whether a capture session is live. Shared between the shell and the
/// render loop; only the UI thread ever writes it.
#[derive(Debug, Clone, Default)]
pub struct CaptureFlag(Arc<AtomicBool>);

impl CaptureFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, active: bool) {
        self.0.store(active, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

struct CaptureSession {
    camera: Camera,
    started_at: DateTime<Local>,
    width: u32,
    height: u32,
}

pub struct CameraSource {
    config: CameraConfig,
    session: Option<CaptureSession>,
}

impl CameraSource {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    fn open(&self) -> Result<Camera, CaptureError> {
        if !nokhwa::nokhwa_check() {
            return Err(CaptureError::PermissionDenied);
        }

        let cameras = nokhwa::query(ApiBackend::Auto)
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
        if cameras.is_empty() {
            return Err(CaptureError::DeviceUnavailable("no camera detected".to_string()));
        }
        for (i, camera) in cameras.iter().enumerate() {
            debug!("camera [{}] {}", i, camera.human_name());
        }

        let format = CameraFormat::new(
            Resolution::new(self.config.width, self.config.height),
            FrameFormat::MJPEG,
            self.config.fps,
        );
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(format));

        Camera::new(CameraIndex::Index(self.config.index), requested)
            .map_err(|e| classify(e.to_string()))
    }
}

fn decode(camera: &mut Camera, mirror: bool) -> Result<DynamicImage, CaptureError> {
    let buffer = camera
        .frame()
        .map_err(|e| CaptureError::Stream(format!("failed to capture frame: {}", e)))?;
    let decoded = buffer
        .decode_image::<RgbFormat>()
        .map_err(|e| CaptureError::Stream(format!("failed to decode frame: {}", e)))?;

    let mut frame = DynamicImage::ImageRgb8(decoded);
    if mirror {
        image::imageops::flip_horizontal_in_place(&mut frame);
    }
    Ok(frame)
}

/// Backends report permission problems as plain strings.
fn classify(message: String) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        CaptureError::PermissionDenied
    } else {
        CaptureError::DeviceUnavailable(message)
    }
}

impl FrameSource for CameraSource {
    fn start(&mut self) -> Result<DynamicImage, CaptureError> {
        if self.session.is_some() {
            debug!("camera already running");
            return self.grab_frame();
        }

        let mut camera = self.open()?;
        camera.open_stream().map_err(|e| classify(e.to_string()))?;

        let first = match decode(&mut camera, self.config.mirror) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = camera.stop_stream();
                return Err(e);
            }
        };

        info!(
            "Webcam video loaded: {}x{} @ {} fps",
            first.width(),
            first.height(),
            camera.frame_rate()
        );
        self.session = Some(CaptureSession {
            camera,
            started_at: Local::now(),
            width: first.width(),
            height: first.height(),
        });
        Ok(first)
    }

    fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if let Err(e) = session.camera.stop_stream() {
            warn!("failed to stop camera stream cleanly: {}", e);
        }
        let duration = Local::now().signed_duration_since(session.started_at);
        info!(
            "Webcam disabled after {}s",
            duration.num_milliseconds() as f64 / 1000.0
        );
    }

    fn is_active(&self) -> bool {
        self.session.is_some()
    }

    fn dimensions(&self) -> (u32, u32) {
        self.session
            .as_ref()
            .map(|s| (s.width, s.height))
            .unwrap_or((0, 0))
    }

    fn grab_frame(&mut self) -> Result<DynamicImage, CaptureError> {
        let mirror = self.config.mirror;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| CaptureError::Stream("camera is not running".to_string()))?;

        let frame = decode(&mut session.camera, mirror)?;
        if (frame.width(), frame.height()) != (session.width, session.height) {
            info!(
                "camera resolution changed to {}x{}",
                frame.width(),
                frame.height()
            );
            session.width = frame.width();
            session.height = frame.height();
        }
        Ok(frame)
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.stop();
    }
}
