// src/overlay.rs - Skeleton overlay drawing commands
use crate::data::LandmarkSet;
use egui::Color32;
use nalgebra::Point2;

/// Depth at which markers reach their largest radius.
const NEAR_DEPTH: f32 = -0.15;
/// Depth at which markers shrink to their smallest radius.
const FAR_DEPTH: f32 = 0.1;
const NEAR_RADIUS: f32 = 5.0;
const FAR_RADIUS: f32 = 1.0;
/// Used when the model did not report a depth.
const FALLBACK_RADIUS: f32 = 3.0;

pub const CONNECTOR_COLOR: Color32 = Color32::WHITE;
pub const CONNECTOR_WIDTH: f32 = 4.0;
pub const MARKER_COLOR: Color32 = Color32::from_rgb(0, 128, 0);
pub const LABEL_COLOR: Color32 = Color32::from_rgb(0, 0, 255);
pub const LABEL_SIZE: f32 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    /// All skeleton connector segments, drawn in one pass.
    Connectors {
        segments: Vec<[Point2<f32>; 2]>,
        color: Color32,
        width: f32,
    },
    Marker {
        center: Point2<f32>,
        radius: f32,
        color: Color32,
    },
    Label {
        anchor: Point2<f32>,
        text: String,
        color: Color32,
        size: f32,
    },
}

/// Maps `value` from `[from, to]` onto `[out_from, out_to]`, clamping at both ends.
pub fn lerp(value: f32, from: f32, to: f32, out_from: f32, out_to: f32) -> f32 {
    let t = ((value - from) / (to - from)).clamp(0.0, 1.0);
    out_from * (1.0 - t) + out_to * t
}

pub fn marker_radius(z: Option<f32>) -> f32 {
    match z {
        Some(z) => lerp(z, NEAR_DEPTH, FAR_DEPTH, NEAR_RADIUS, FAR_RADIUS),
        None => FALLBACK_RADIUS,
    }
}

/// Produces the overlay for one landmark set on a `width` x `height` surface.
///
/// Landmarks without an x or y component get no marker or label, and
/// connectors touching them are skipped.
pub fn render_overlay(
    set: &LandmarkSet,
    connections: &[(usize, usize)],
    width: f32,
    height: f32,
) -> Vec<DrawCommand> {
    let pixel = |index: usize| {
        set.get(index)
            .and_then(|lm| lm.to_pixel(width, height))
            .map(|(x, y)| Point2::new(x, y))
    };

    let segments = connections
        .iter()
        .filter_map(|&(a, b)| Some([pixel(a)?, pixel(b)?]))
        .collect();

    let mut commands = Vec::with_capacity(1 + set.len() * 2);
    commands.push(DrawCommand::Connectors {
        segments,
        color: CONNECTOR_COLOR,
        width: CONNECTOR_WIDTH,
    });

    for lm in set.iter() {
        if let Some((x, y)) = lm.to_pixel(width, height) {
            commands.push(DrawCommand::Marker {
                center: Point2::new(x, y),
                radius: marker_radius(lm.z),
                color: MARKER_COLOR,
            });
        }
    }

    for (index, lm) in set.iter().enumerate() {
        if let Some((x, y)) = lm.to_pixel(width, height) {
            commands.push(DrawCommand::Label {
                anchor: Point2::new(x, y),
                text: format!("ID {}", index),
                color: LABEL_COLOR,
                size: LABEL_SIZE,
            });
        }
    }

    commands
}

/// Drawing surface matching the video dimensions. Holds the commands for the
/// current frame until the next clear.
#[derive(Debug, Clone, Default)]
pub struct OverlayCanvas {
    width: u32,
    height: u32,
    commands: Vec<DrawCommand>,
}

impl OverlayCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resizing wipes the surface, like a browser canvas does.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.commands.clear();
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn draw(&mut self, commands: impl IntoIterator<Item = DrawCommand>) {
        self.commands.extend(commands);
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }
}
