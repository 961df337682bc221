// src/ui.rs - Theme, video surface, overlay painting and the landmark table
use eframe::egui::{self, Color32, Pos2, Rect, Stroke, Vec2};
use egui_extras::{Column, TableBuilder};
use image::DynamicImage;
use nalgebra::Point2;

use crate::data::{DisplayRow, POSE_LANDMARK_COUNT};
use crate::overlay::{DrawCommand, OverlayCanvas};

#[derive(Debug, Clone)]
pub struct Theme {
    pub background: Color32,
    pub paper: Color32,
    pub text_primary: Color32,
    pub text_secondary: Color32,
    pub accent: Color32,
    pub divider: Color32,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            background: Color32::from_rgb(0xf5, 0xf5, 0xf5),
            paper: Color32::WHITE,
            text_primary: Color32::from_rgb(0x33, 0x33, 0x33),
            text_secondary: Color32::from_rgb(0x75, 0x75, 0x75),
            accent: Color32::from_rgb(0x19, 0x76, 0xd2),
            divider: Color32::from_rgb(0xe0, 0xe0, 0xe0),
        }
    }
}

impl Theme {
    pub fn visuals(&self) -> egui::Visuals {
        let mut visuals = egui::Visuals::light();
        visuals.panel_fill = self.background;
        visuals.window_fill = self.paper;
        visuals.extreme_bg_color = self.paper;
        visuals.override_text_color = Some(self.text_primary);
        visuals.widgets.noninteractive.bg_stroke = Stroke::new(1.0, self.divider);
        visuals.widgets.inactive.weak_bg_fill = self.accent;
        visuals.widgets.hovered.weak_bg_fill = self.accent.linear_multiply(0.85);
        visuals.widgets.active.weak_bg_fill = self.accent.linear_multiply(0.7);
        visuals.widgets.inactive.rounding = egui::Rounding::same(4.0);
        visuals.widgets.hovered.rounding = egui::Rounding::same(4.0);
        visuals.widgets.active.rounding = egui::Rounding::same(4.0);
        visuals
    }
}

/// Container that renders exactly one content tree, stacked vertically.
pub struct MainLayout<C> {
    content: C,
}

impl<C> MainLayout<C>
where
    C: FnOnce(&mut egui::Ui),
{
    pub fn new(content: C) -> Self {
        Self { content }
    }

    pub fn show(self, ui: &mut egui::Ui) {
        ui.vertical(self.content);
    }
}

/// Webcam frame shown as a texture, letterboxed into the available space.
pub struct VideoWidget {
    texture: Option<egui::TextureHandle>,
    frame_size: [usize; 2],
}

impl VideoWidget {
    pub fn new() -> Self {
        Self {
            texture: None,
            frame_size: [0, 0],
        }
    }

    pub fn update_frame(&mut self, ctx: &egui::Context, frame: &DynamicImage) {
        let size = [frame.width() as usize, frame.height() as usize];
        let rgba = frame.to_rgba8();
        let color_image = egui::ColorImage::from_rgba_unmultiplied(size, rgba.as_raw());

        match &mut self.texture {
            Some(texture) => texture.set(color_image, egui::TextureOptions::LINEAR),
            None => {
                self.texture = Some(ctx.load_texture(
                    "video_frame",
                    color_image,
                    egui::TextureOptions::LINEAR,
                ))
            }
        }
        self.frame_size = size;
    }

    /// Drops the current frame, e.g. once the webcam is disabled.
    pub fn clear(&mut self) {
        self.texture = None;
        self.frame_size = [0, 0];
    }

    /// Paints the frame and returns the screen rectangle it occupies.
    pub fn show(&self, ui: &mut egui::Ui, theme: &Theme) -> Rect {
        let available = ui.available_size();
        let size = match self.frame_size {
            [w, h] if w > 0 && h > 0 => fit_size(available, Vec2::new(w as f32, h as f32)),
            _ => available,
        };

        let outer = ui.available_rect_before_wrap();
        let rect = Rect::from_center_size(outer.center(), size);
        ui.allocate_rect(outer, egui::Sense::hover());

        let painter = ui.painter_at(outer);
        painter.rect_filled(outer, egui::Rounding::ZERO, theme.paper);
        match &self.texture {
            Some(texture) => {
                painter.image(
                    texture.id(),
                    rect,
                    Rect::from_min_max(Pos2::ZERO, Pos2::new(1.0, 1.0)),
                    Color32::WHITE,
                );
            }
            None => {
                painter.text(
                    rect.center(),
                    egui::Align2::CENTER_CENTER,
                    "Webcam off",
                    egui::FontId::proportional(16.0),
                    theme.text_secondary,
                );
            }
        }
        rect
    }
}

impl Default for VideoWidget {
    fn default() -> Self {
        Self::new()
    }
}

/// Largest size with the frame's aspect ratio that fits into `available`.
pub fn fit_size(available: Vec2, frame: Vec2) -> Vec2 {
    let scale = (available.x / frame.x).min(available.y / frame.y);
    frame * scale.max(0.0)
}

/// Maps a point on the overlay surface to screen space inside `rect`.
pub fn to_screen(point: Point2<f32>, surface: (u32, u32), rect: Rect) -> Pos2 {
    let sx = rect.width() / surface.0.max(1) as f32;
    let sy = rect.height() / surface.1.max(1) as f32;
    Pos2::new(rect.left() + point.x * sx, rect.top() + point.y * sy)
}

/// Replays the overlay canvas on top of the video rectangle.
pub fn paint_overlay(painter: &egui::Painter, rect: Rect, canvas: &OverlayCanvas) {
    let surface = canvas.size();
    if surface.0 == 0 || surface.1 == 0 {
        return;
    }
    let scale = rect.width() / surface.0 as f32;

    for command in canvas.commands() {
        match command {
            DrawCommand::Connectors {
                segments,
                color,
                width,
            } => {
                let stroke = Stroke::new(width * scale, *color);
                for [a, b] in segments {
                    painter.line_segment([to_screen(*a, surface, rect), to_screen(*b, surface, rect)], stroke);
                }
            }
            DrawCommand::Marker {
                center,
                radius,
                color,
            } => {
                painter.circle_filled(to_screen(*center, surface, rect), radius * scale, *color);
            }
            DrawCommand::Label {
                anchor,
                text,
                color,
                size,
            } => {
                painter.text(
                    to_screen(*anchor, surface, rect),
                    egui::Align2::LEFT_BOTTOM,
                    text,
                    egui::FontId::proportional(size * scale),
                    *color,
                );
            }
        }
    }
}

/// Read-only table with one row per landmark.
pub fn landmark_table(ui: &mut egui::Ui, rows: &[DisplayRow]) {
    TableBuilder::new(ui)
        .striped(true)
        .resizable(false)
        .cell_layout(egui::Layout::left_to_right(egui::Align::Center))
        .column(Column::exact(30.0))
        .column(Column::initial(140.0).at_least(140.0))
        .column(Column::exact(60.0))
        .column(Column::exact(60.0))
        .column(Column::remainder().at_least(60.0))
        .header(22.0, |mut header| {
            for title in ["ID", "Landmark", "X", "Y", "Z"] {
                header.col(|ui| {
                    ui.strong(title);
                });
            }
        })
        .body(|mut body| {
            for row in rows.iter().take(POSE_LANDMARK_COUNT) {
                body.row(18.0, |mut table_row| {
                    table_row.col(|ui| {
                        ui.label(row.id.to_string());
                    });
                    table_row.col(|ui| {
                        ui.label(row.name);
                    });
                    for value in [&row.x, &row.y, &row.z] {
                        table_row.col(|ui| {
                            ui.monospace(value.as_str());
                        });
                    }
                });
            }
        });
}
