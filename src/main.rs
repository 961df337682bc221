// src/main.rs
mod app;
mod config;
mod data;
mod mediapipe_bridge;
#[cfg(feature = "onnx")]
mod onnx_backend;
mod overlay;
mod tracking;
mod ui;
mod video;

use anyhow::Context;
use eframe::egui;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match nokhwa::query(nokhwa::utils::ApiBackend::Auto) {
        Ok(cameras) => {
            info!("Found {} camera(s)", cameras.len());
            for (i, camera) in cameras.iter().enumerate() {
                info!("  [{}] {}", i, camera.human_name());
            }
        }
        Err(e) => warn!("Failed to query cameras: {}", e),
    }

    let config = config::AppConfig::load();

    // Model loading is the only background task.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("pose-cam-loader")
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1280.0, 800.0])
            .with_min_inner_size([960.0, 600.0]),
        centered: true,
        ..Default::default()
    };

    eframe::run_native(
        "Pose Landmarks",
        options,
        Box::new(move |cc| Box::new(app::PoseCamApp::new(cc, config, runtime))),
    )
    .map_err(|e| anyhow::anyhow!("Error running application: {}", e))
}
