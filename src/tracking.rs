// src/tracking.rs - Per-frame detect-and-draw loop
use image::DynamicImage;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::data::LandmarkTable;
use crate::mediapipe_bridge::PoseDetector;
use crate::overlay::{render_overlay, OverlayCanvas};
use crate::video::{CaptureFlag, FrameSource};

/// Source of detection timestamps, in milliseconds.
pub trait Clock {
    fn now_ms(&self) -> f64;
}

/// High resolution clock counting from its creation.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// Consecutive failed grabs after which the stream is treated as ended.
pub const MAX_GRAB_FAILURES: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Capture is still active; run another tick on the next frame.
    Reschedule,
    /// The video reported no size, or its stream stopped delivering frames.
    /// The loop ends without another tick.
    Halted,
    /// Capture was switched off while the tick ran.
    Stopped,
}

#[derive(Clone, Debug, Default)]
pub struct LoopMetrics {
    pub frames: u64,
    pub avg_detection_ms: f32,
    detection_times: VecDeque<f32>,
}

impl LoopMetrics {
    const WINDOW: usize = 30;

    fn record(&mut self, elapsed_ms: f32) {
        self.frames += 1;
        self.detection_times.push_front(elapsed_ms);
        if self.detection_times.len() > Self::WINDOW {
            self.detection_times.pop_back();
        }
        self.avg_detection_ms =
            self.detection_times.iter().sum::<f32>() / self.detection_times.len() as f32;
    }
}

/// Context for the render loop. Owns everything that lives across ticks:
/// the capture flag, the detector, the overlay surface and the table.
pub struct RenderLoop {
    state: LoopState,
    capture: CaptureFlag,
    detector: PoseDetector,
    canvas: OverlayCanvas,
    table: LandmarkTable,
    latest_frame: Option<DynamicImage>,
    grab_failures: u32,
    metrics: LoopMetrics,
}

impl RenderLoop {
    pub fn new(detector: PoseDetector, table: LandmarkTable) -> Self {
        Self {
            state: LoopState::Idle,
            capture: CaptureFlag::new(),
            detector,
            canvas: OverlayCanvas::new(),
            table,
            latest_frame: None,
            grab_failures: 0,
            metrics: LoopMetrics::default(),
        }
    }

    pub fn install_detector(&mut self, detector: PoseDetector) {
        self.detector = detector;
    }

    pub fn detector(&self) -> &PoseDetector {
        &self.detector
    }

    pub fn capture_flag(&self) -> CaptureFlag {
        self.capture.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == LoopState::Running
    }

    /// Enters the running state with the frame that proved the stream ready.
    pub fn begin(&mut self, first_frame: DynamicImage) {
        self.capture.set(true);
        self.state = LoopState::Running;
        self.grab_failures = 0;
        self.latest_frame = Some(first_frame);
        info!("render loop started");
    }

    /// Switches capture off. A tick already in progress finishes normally.
    pub fn request_stop(&mut self) {
        self.capture.set(false);
        self.canvas.clear();
        self.latest_frame = None;
    }

    pub fn canvas(&self) -> &OverlayCanvas {
        &self.canvas
    }

    pub fn table(&self) -> &LandmarkTable {
        &self.table
    }

    pub fn latest_frame(&self) -> Option<&DynamicImage> {
        self.latest_frame.as_ref()
    }

    pub fn metrics(&self) -> &LoopMetrics {
        &self.metrics
    }

    /// Runs one detect-and-draw cycle.
    pub async fn tick<S>(&mut self, source: &mut S, clock: &dyn Clock) -> TickOutcome
    where
        S: FrameSource + ?Sized,
    {
        let (width, height) = source.dimensions();
        if width == 0 || height == 0 {
            debug!("video not available or has been stopped");
            self.state = LoopState::Idle;
            return TickOutcome::Halted;
        }

        if let Err(e) = self.detector.ensure_streaming().await {
            error!("failed to switch landmarker to video mode: {}", e);
        }

        let timestamp_ms = clock.now_ms();
        let started = Instant::now();
        let detections = match source.grab_frame() {
            Ok(frame) => {
                self.grab_failures = 0;
                let size = (frame.width(), frame.height());
                if self.canvas.size() != size {
                    self.canvas.resize(size.0, size.1);
                }
                let sets = self.detector.detect(&frame, timestamp_ms).await;
                self.latest_frame = Some(frame);
                sets
            }
            Err(e) => {
                self.grab_failures += 1;
                if self.grab_failures >= MAX_GRAB_FAILURES {
                    error!(
                        "camera stream lost after {} failed frames: {}",
                        self.grab_failures, e
                    );
                    source.stop();
                    self.canvas.clear();
                    self.state = LoopState::Idle;
                    return TickOutcome::Halted;
                }
                if self.grab_failures == 1 {
                    warn!("skipping frame: {}", e);
                } else {
                    debug!("skipping frame ({} in a row): {}", self.grab_failures, e);
                }
                Vec::new()
            }
        };
        self.metrics.record(started.elapsed().as_secs_f32() * 1000.0);

        self.canvas.clear();
        if let Some(first) = detections.first() {
            let (w, h) = self.canvas.size();
            self.canvas.draw(render_overlay(
                first,
                self.detector.connections(),
                w as f32,
                h as f32,
            ));
            self.table.offer(first, timestamp_ms);
        }

        if self.metrics.frames % 300 == 0 {
            debug!(
                frames = self.metrics.frames,
                avg_detection_ms = self.metrics.avg_detection_ms,
                "render loop stats"
            );
        }

        if self.capture.is_set() {
            TickOutcome::Reschedule
        } else {
            self.state = LoopState::Idle;
            info!("render loop stopped after {} frames", self.metrics.frames);
            TickOutcome::Stopped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Landmark, LandmarkSet, NOT_AVAILABLE, POSE_LANDMARK_COUNT};
    use crate::mediapipe_bridge::{DetectorError, PoseBackend, RunningMode, POSE_CONNECTIONS};
    use crate::overlay::DrawCommand;
    use crate::video::tests::SyntheticSource;
    use crate::video::CaptureError;
    use approx::assert_relative_eq;
    use async_trait::async_trait;
    use std::cell::Cell;
    use std::sync::{Arc, Mutex};

    /// Clock advancing by a fixed step on every read.
    struct SteppingClock {
        now: Cell<f64>,
        step: f64,
    }

    impl SteppingClock {
        fn new(step: f64) -> Self {
            Self {
                now: Cell::new(0.0),
                step,
            }
        }
    }

    impl Clock for SteppingClock {
        fn now_ms(&self) -> f64 {
            let now = self.now.get() + self.step;
            self.now.set(now);
            now
        }
    }

    #[derive(Default)]
    struct Calls {
        mode_switches: usize,
        timestamps: Vec<f64>,
        in_flight: usize,
        max_in_flight: usize,
    }

    /// Backend returning a fixed answer, optionally dropping the capture
    /// flag while a detection is in flight.
    struct StubBackend {
        result: Vec<LandmarkSet>,
        calls: Arc<Mutex<Calls>>,
        stop_during_detect: Option<CaptureFlag>,
        fail: bool,
    }

    impl StubBackend {
        fn new(result: Vec<LandmarkSet>) -> (Self, Arc<Mutex<Calls>>) {
            let calls = Arc::new(Mutex::new(Calls::default()));
            let backend = Self {
                result,
                calls: calls.clone(),
                stop_during_detect: None,
                fail: false,
            };
            (backend, calls)
        }
    }

    #[async_trait(?Send)]
    impl PoseBackend for StubBackend {
        fn name(&self) -> &str {
            "stub"
        }

        async fn set_running_mode(&mut self, _mode: RunningMode) -> Result<(), DetectorError> {
            self.calls.lock().unwrap().mode_switches += 1;
            Ok(())
        }

        async fn detect_for_video(
            &mut self,
            _frame: &DynamicImage,
            timestamp_ms: f64,
        ) -> Result<Vec<LandmarkSet>, DetectorError> {
            {
                let mut calls = self.calls.lock().unwrap();
                calls.in_flight += 1;
                calls.max_in_flight = calls.max_in_flight.max(calls.in_flight);
                calls.timestamps.push(timestamp_ms);
            }
            tokio::task::yield_now().await;
            if let Some(flag) = &self.stop_during_detect {
                flag.set(false);
            }
            self.calls.lock().unwrap().in_flight -= 1;

            if self.fail {
                Err(DetectorError::Inference("stub failure".to_string()))
            } else {
                Ok(self.result.clone())
            }
        }
    }

    fn fixed_set() -> LandmarkSet {
        LandmarkSet::new(
            (0..POSE_LANDMARK_COUNT)
                .map(|i| {
                    let t = i as f32 / POSE_LANDMARK_COUNT as f32;
                    Landmark::new(0.1 + 0.8 * t, 0.9 - 0.7 * t, -0.1 + 0.2 * t)
                })
                .collect(),
        )
    }

    /// Source whose reported size and delivered frame size can differ, and
    /// whose grabs can fail.
    struct ScriptedSource {
        active: bool,
        reported: (u32, u32),
        frame: (u32, u32),
        failures_left: u32,
    }

    impl ScriptedSource {
        fn new(reported: (u32, u32)) -> Self {
            Self {
                active: false,
                reported,
                frame: reported,
                failures_left: 0,
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn start(&mut self) -> Result<DynamicImage, CaptureError> {
            self.active = true;
            Ok(DynamicImage::new_rgb8(self.reported.0, self.reported.1))
        }

        fn stop(&mut self) {
            self.active = false;
        }

        fn is_active(&self) -> bool {
            self.active
        }

        fn dimensions(&self) -> (u32, u32) {
            if self.active {
                self.reported
            } else {
                (0, 0)
            }
        }

        fn grab_frame(&mut self) -> Result<DynamicImage, CaptureError> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(CaptureError::Stream("device unplugged".to_string()));
            }
            Ok(DynamicImage::new_rgb8(self.frame.0, self.frame.1))
        }
    }

    fn scripted_loop(backend: StubBackend, mut source: ScriptedSource) -> (RenderLoop, ScriptedSource) {
        let mut render_loop = RenderLoop::new(
            PoseDetector::new(Box::new(backend)),
            LandmarkTable::new(500.0),
        );
        let first = source.start().unwrap();
        render_loop.begin(first);
        (render_loop, source)
    }

    fn running_loop(backend: StubBackend) -> (RenderLoop, SyntheticSource) {
        let mut render_loop = RenderLoop::new(
            PoseDetector::new(Box::new(backend)),
            LandmarkTable::new(500.0),
        );
        let mut source = SyntheticSource::new(640, 480);
        let first = source.start().unwrap();
        render_loop.begin(first);
        (render_loop, source)
    }

    #[tokio::test]
    async fn end_to_end_overlay_for_synthetic_frame() {
        let set = fixed_set();
        let (backend, _) = StubBackend::new(vec![set.clone()]);
        let (mut render_loop, mut source) = running_loop(backend);
        let clock = SteppingClock::new(16.0);

        assert_eq!(render_loop.tick(&mut source, &clock).await, TickOutcome::Reschedule);

        let commands = render_loop.canvas().commands();
        let connectors: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                DrawCommand::Connectors { segments, .. } => Some(segments),
                _ => None,
            })
            .collect();
        assert_eq!(connectors.len(), 1);
        assert_eq!(connectors[0].len(), POSE_CONNECTIONS.len());

        let markers = commands
            .iter()
            .filter(|c| matches!(c, DrawCommand::Marker { .. }))
            .count();
        assert_eq!(markers, POSE_LANDMARK_COUNT);

        let labels: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                DrawCommand::Label { anchor, .. } => Some(*anchor),
                _ => None,
            })
            .collect();
        assert_eq!(labels.len(), POSE_LANDMARK_COUNT);
        for (anchor, lm) in labels.iter().zip(set.iter()) {
            assert_relative_eq!(anchor.x, lm.x.unwrap() * 640.0, epsilon = 1e-3);
            assert_relative_eq!(anchor.y, lm.y.unwrap() * 480.0, epsilon = 1e-3);
        }

        assert_eq!(render_loop.canvas().size(), (640, 480));
        assert_eq!(render_loop.table().rows().len(), POSE_LANDMARK_COUNT);
        assert!(render_loop.latest_frame().is_some());
    }

    #[tokio::test]
    async fn detections_are_sequential_with_increasing_timestamps() {
        let (backend, calls) = StubBackend::new(vec![fixed_set()]);
        let (mut render_loop, mut source) = running_loop(backend);
        let clock = SteppingClock::new(16.0);

        let ticks = 10;
        for _ in 0..ticks {
            assert_eq!(render_loop.tick(&mut source, &clock).await, TickOutcome::Reschedule);
        }

        let calls = calls.lock().unwrap();
        assert!(calls.timestamps.len() <= ticks);
        assert_eq!(calls.max_in_flight, 1);
        assert!(calls.timestamps.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(calls.mode_switches, 1);
    }

    #[tokio::test]
    async fn only_first_person_is_drawn() {
        let second = LandmarkSet::new(vec![Landmark::new(0.5, 0.5, 0.0)]);
        let (backend, _) = StubBackend::new(vec![fixed_set(), second]);
        let (mut render_loop, mut source) = running_loop(backend);

        render_loop.tick(&mut source, &SteppingClock::new(16.0)).await;

        let markers = render_loop
            .canvas()
            .commands()
            .iter()
            .filter(|c| matches!(c, DrawCommand::Marker { .. }))
            .count();
        assert_eq!(markers, POSE_LANDMARK_COUNT);
    }

    #[tokio::test]
    async fn stop_during_detection_draws_once_and_ends() {
        let (mut backend, calls) = StubBackend::new(vec![fixed_set()]);
        let mut render_loop = RenderLoop::new(PoseDetector::unloaded(), LandmarkTable::default());
        backend.stop_during_detect = Some(render_loop.capture_flag());
        render_loop.install_detector(PoseDetector::new(Box::new(backend)));

        let mut source = SyntheticSource::new(640, 480);
        let first = source.start().unwrap();
        render_loop.begin(first);

        let outcome = render_loop.tick(&mut source, &SteppingClock::new(16.0)).await;

        assert_eq!(outcome, TickOutcome::Stopped);
        assert!(!render_loop.capture_flag().is_set());
        assert_eq!(render_loop.state(), LoopState::Idle);
        let connector_draws = render_loop
            .canvas()
            .commands()
            .iter()
            .filter(|c| matches!(c, DrawCommand::Connectors { .. }))
            .count();
        assert_eq!(connector_draws, 1);
        assert_eq!(calls.lock().unwrap().timestamps.len(), 1);
    }

    #[tokio::test]
    async fn zero_sized_video_halts_without_detection() {
        let (backend, calls) = StubBackend::new(vec![fixed_set()]);
        let (mut render_loop, mut source) = running_loop(backend);
        source.stop();

        let outcome = render_loop.tick(&mut source, &SteppingClock::new(16.0)).await;

        assert_eq!(outcome, TickOutcome::Halted);
        assert_eq!(render_loop.state(), LoopState::Idle);
        assert_eq!(source.grabs, 0);
        assert!(calls.lock().unwrap().timestamps.is_empty());
    }

    #[tokio::test]
    async fn failed_detection_clears_overlay_and_continues() {
        let (mut backend, _) = StubBackend::new(vec![fixed_set()]);
        backend.fail = true;
        let (mut render_loop, mut source) = running_loop(backend);

        let outcome = render_loop.tick(&mut source, &SteppingClock::new(16.0)).await;

        assert_eq!(outcome, TickOutcome::Reschedule);
        assert!(render_loop.canvas().commands().is_empty());
        assert!(render_loop.table().rows().is_empty());
    }

    #[tokio::test]
    async fn table_is_throttled_while_overlay_follows_every_frame() {
        let (backend, _) = StubBackend::new(vec![fixed_set()]);
        let (mut render_loop, mut source) = running_loop(backend);
        let clock = SteppingClock::new(100.0);

        render_loop.tick(&mut source, &clock).await;
        let first_update = render_loop.table().last_update_ms();
        render_loop.tick(&mut source, &clock).await;

        assert_eq!(render_loop.table().last_update_ms(), first_update);
        assert!(!render_loop.canvas().commands().is_empty());
        assert_eq!(render_loop.metrics().frames, 2);
    }

    #[tokio::test]
    async fn first_frame_is_available_before_any_tick() {
        let (backend, _) = StubBackend::new(vec![fixed_set()]);
        let (render_loop, _source) = running_loop(backend);

        let frame = render_loop.latest_frame().unwrap();
        assert_eq!((frame.width(), frame.height()), (640, 480));
        assert!(render_loop.capture_flag().is_set());
    }

    #[tokio::test]
    async fn persistent_grab_failures_end_the_session() {
        let (backend, calls) = StubBackend::new(vec![fixed_set()]);
        let mut source = ScriptedSource::new((640, 480));
        source.failures_left = u32::MAX;
        let (mut render_loop, mut source) = scripted_loop(backend, source);
        let clock = SteppingClock::new(16.0);

        for _ in 1..MAX_GRAB_FAILURES {
            assert_eq!(render_loop.tick(&mut source, &clock).await, TickOutcome::Reschedule);
        }
        assert_eq!(render_loop.tick(&mut source, &clock).await, TickOutcome::Halted);

        assert_eq!(render_loop.state(), LoopState::Idle);
        assert!(!source.is_active());
        assert_eq!(source.dimensions(), (0, 0));
        assert!(calls.lock().unwrap().timestamps.is_empty());
        assert_eq!(render_loop.tick(&mut source, &clock).await, TickOutcome::Halted);
    }

    #[tokio::test]
    async fn a_good_frame_resets_the_failure_count() {
        let (backend, _) = StubBackend::new(vec![fixed_set()]);
        let mut source = ScriptedSource::new((640, 480));
        source.failures_left = MAX_GRAB_FAILURES - 1;
        let (mut render_loop, mut source) = scripted_loop(backend, source);
        let clock = SteppingClock::new(16.0);

        for _ in 0..MAX_GRAB_FAILURES {
            assert_eq!(render_loop.tick(&mut source, &clock).await, TickOutcome::Reschedule);
        }
        source.failures_left = MAX_GRAB_FAILURES - 1;
        for _ in 0..MAX_GRAB_FAILURES - 1 {
            assert_eq!(render_loop.tick(&mut source, &clock).await, TickOutcome::Reschedule);
        }
        assert!(source.is_active());
    }

    #[tokio::test]
    async fn overlay_follows_the_grabbed_frame_size() {
        let set = fixed_set();
        let (backend, _) = StubBackend::new(vec![set.clone()]);
        let mut source = ScriptedSource::new((640, 480));
        source.frame = (1280, 720);
        let (mut render_loop, mut source) = scripted_loop(backend, source);

        render_loop.tick(&mut source, &SteppingClock::new(16.0)).await;

        assert_eq!(render_loop.canvas().size(), (1280, 720));
        let first_label = render_loop.canvas().commands().iter().find_map(|c| match c {
            DrawCommand::Label { anchor, .. } => Some(*anchor),
            _ => None,
        });
        let lm = set.get(0).unwrap();
        let anchor = first_label.unwrap();
        assert_relative_eq!(anchor.x, lm.x.unwrap() * 1280.0, epsilon = 1e-3);
        assert_relative_eq!(anchor.y, lm.y.unwrap() * 720.0, epsilon = 1e-3);
    }

    #[tokio::test]
    async fn missing_coordinates_show_na_and_the_loop_continues() {
        let mut landmarks = fixed_set().iter().cloned().collect::<Vec<_>>();
        landmarks[3].y = None;
        landmarks[7].y = None;
        let (backend, calls) = StubBackend::new(vec![LandmarkSet::new(landmarks)]);
        let (mut render_loop, mut source) = running_loop(backend);
        let clock = SteppingClock::new(16.0);

        assert_eq!(render_loop.tick(&mut source, &clock).await, TickOutcome::Reschedule);
        assert_eq!(render_loop.tick(&mut source, &clock).await, TickOutcome::Reschedule);
        assert_eq!(calls.lock().unwrap().timestamps.len(), 2);

        let rows = render_loop.table().rows();
        assert_eq!(rows.len(), POSE_LANDMARK_COUNT);
        assert_eq!(rows[3].y, NOT_AVAILABLE);
        assert_eq!(rows[7].y, NOT_AVAILABLE);
        assert_ne!(rows[3].x, NOT_AVAILABLE);

        let commands = render_loop.canvas().commands();
        let markers = commands
            .iter()
            .filter(|c| matches!(c, DrawCommand::Marker { .. }))
            .count();
        let labels = commands
            .iter()
            .filter(|c| matches!(c, DrawCommand::Label { .. }))
            .count();
        assert_eq!(markers, POSE_LANDMARK_COUNT - 2);
        assert_eq!(labels, POSE_LANDMARK_COUNT - 2);
    }
}
