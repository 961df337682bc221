// src/app.rs
use crate::config::AppConfig;
use crate::data::LandmarkTable;
use crate::mediapipe_bridge::{load_detector, PoseDetector};
use crate::tracking::{MonotonicClock, RenderLoop, TickOutcome};
use crate::ui::{landmark_table, paint_overlay, MainLayout, Theme, VideoWidget};
use crate::video::{CameraSource, CaptureError, FrameSource};

use eframe::egui;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub struct PoseCamApp {
    runtime: Runtime,
    pending_detector: Option<JoinHandle<anyhow::Result<PoseDetector>>>,

    camera: CameraSource,
    render_loop: RenderLoop,
    clock: MonotonicClock,

    theme: Theme,
    video: VideoWidget,
}

impl PoseCamApp {
    pub fn new(cc: &eframe::CreationContext<'_>, config: AppConfig, runtime: Runtime) -> Self {
        let theme = Theme::default();
        cc.egui_ctx.set_visuals(theme.visuals());

        info!("Loading pose landmarker ({:?} backend)", config.detector.backend);
        let pending_detector = Some(runtime.spawn(load_detector(config.detector.clone())));

        Self {
            runtime,
            pending_detector,
            camera: CameraSource::new(config.camera.clone()),
            render_loop: RenderLoop::new(
                PoseDetector::unloaded(),
                LandmarkTable::new(config.table.refresh_interval_ms),
            ),
            clock: MonotonicClock::new(),
            theme,
            video: VideoWidget::new(),
        }
    }

    fn poll_detector(&mut self) {
        let finished = self
            .pending_detector
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(false);
        if !finished {
            return;
        }
        let Some(handle) = self.pending_detector.take() else {
            return;
        };

        match self.runtime.block_on(handle) {
            Ok(Ok(detector)) => self.render_loop.install_detector(detector),
            Ok(Err(e)) => error!("Failed to initialize PoseLandmarker: {:#}", e),
            Err(e) => error!("PoseLandmarker loader task failed: {}", e),
        }
    }

    fn webcam_enabled(&self) -> bool {
        self.render_loop.capture_flag().is_set()
    }

    fn toggle_webcam(&mut self, ctx: &egui::Context) {
        if !self.render_loop.detector().is_loaded() {
            error!("PoseLandmarker not loaded.");
            return;
        }

        if self.webcam_enabled() {
            self.end_session();
            return;
        }

        match self.camera.start() {
            Ok(first) => {
                self.video.update_frame(ctx, &first);
                self.render_loop.begin(first);
                ctx.request_repaint();
            }
            Err(CaptureError::PermissionDenied) => {
                error!("Camera permission denied; webcam stays off")
            }
            Err(e) => error!("Failed to start webcam: {}", e),
        }
    }

    fn end_session(&mut self) {
        self.camera.stop();
        self.render_loop.request_stop();
        self.video.clear();
    }

    fn run_tick(&mut self, ctx: &egui::Context) {
        if !self.render_loop.is_running() {
            return;
        }

        let outcome = self
            .runtime
            .block_on(self.render_loop.tick(&mut self.camera, &self.clock));

        match outcome {
            TickOutcome::Reschedule => {
                if let Some(frame) = self.render_loop.latest_frame() {
                    self.video.update_frame(ctx, frame);
                }
                ctx.request_repaint();
            }
            TickOutcome::Halted => {
                debug!("render loop halted, releasing the camera");
                self.end_session();
            }
            TickOutcome::Stopped => debug!("render loop stopped"),
        }
    }

    fn render_control_panel(&mut self, ctx: &egui::Context) {
        egui::TopBottomPanel::bottom("controls").show(ctx, |ui| {
            ui.add_space(8.0);
            ui.horizontal(|ui| {
                let label = if self.webcam_enabled() {
                    "DISABLE WEBCAM"
                } else {
                    "ENABLE WEBCAM"
                };
                let button = egui::Button::new(egui::RichText::new(label).color(egui::Color32::WHITE));
                if ui.add_sized([160.0, 36.0], button).clicked() {
                    self.toggle_webcam(ui.ctx());
                }

                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    if self.webcam_enabled() {
                        let metrics = self.render_loop.metrics();
                        ui.label(
                            egui::RichText::new(format!(
                                "{} frames, {:.1} ms/detection",
                                metrics.frames, metrics.avg_detection_ms
                            ))
                            .color(self.theme.text_secondary),
                        );
                    }
                });
            });
            ui.add_space(8.0);
        });
    }

    fn render_table_panel(&mut self, ctx: &egui::Context) {
        let width = ctx.screen_rect().width() * 0.3;
        egui::SidePanel::right("landmarks")
            .resizable(false)
            .exact_width(width)
            .frame(egui::Frame::side_top_panel(&ctx.style()).fill(self.theme.paper))
            .show(ctx, |ui| {
                ui.heading("Pose Landmarks");
                ui.separator();
                landmark_table(ui, self.render_loop.table().rows());
            });
    }

    fn render_video_panel(&mut self, ctx: &egui::Context) {
        let video = &self.video;
        let theme = &self.theme;
        let canvas = self.render_loop.canvas();

        egui::CentralPanel::default().show(ctx, |ui| {
            MainLayout::new(|ui: &mut egui::Ui| {
                let rect = video.show(ui, theme);
                paint_overlay(&ui.painter_at(rect), rect, canvas);
            })
            .show(ui);
        });
    }
}

impl eframe::App for PoseCamApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.poll_detector();
        self.run_tick(ctx);

        self.render_control_panel(ctx);
        self.render_table_panel(ctx);
        self.render_video_panel(ctx);

        if self.pending_detector.is_some() {
            ctx.request_repaint_after(std::time::Duration::from_millis(100));
        }
    }
}
