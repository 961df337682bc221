// src/data.rs - Landmark data model and the throttled landmark table
use tracing::trace;

/// Number of body landmarks reported by the pose model.
pub const POSE_LANDMARK_COUNT: usize = 33;

/// Shown in the table in place of a coordinate the model did not report.
pub const NOT_AVAILABLE: &str = "NA";

pub const LANDMARK_NAMES: [&str; POSE_LANDMARK_COUNT] = [
    "NOSE",
    "LEFT_EYE_INNER",
    "LEFT_EYE",
    "LEFT_EYE_OUTER",
    "RIGHT_EYE_INNER",
    "RIGHT_EYE",
    "RIGHT_EYE_OUTER",
    "LEFT_EAR",
    "RIGHT_EAR",
    "MOUTH_LEFT",
    "MOUTH_RIGHT",
    "LEFT_SHOULDER",
    "RIGHT_SHOULDER",
    "LEFT_ELBOW",
    "RIGHT_ELBOW",
    "LEFT_WRIST",
    "RIGHT_WRIST",
    "LEFT_PINKY",
    "RIGHT_PINKY",
    "LEFT_INDEX",
    "RIGHT_INDEX",
    "LEFT_THUMB",
    "RIGHT_THUMB",
    "LEFT_HIP",
    "RIGHT_HIP",
    "LEFT_KNEE",
    "RIGHT_KNEE",
    "LEFT_ANKLE",
    "RIGHT_ANKLE",
    "LEFT_HEEL",
    "RIGHT_HEEL",
    "LEFT_FOOT_INDEX",
    "RIGHT_FOOT_INDEX",
];

/// A single normalized keypoint estimate. x and y are relative to the frame,
/// z is depth relative to the hips (smaller is closer to the camera).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Landmark {
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub z: Option<f32>,
    pub visibility: Option<f32>,
}

impl Landmark {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            z: Some(z),
            visibility: None,
        }
    }

    pub fn with_visibility(mut self, visibility: f32) -> Self {
        self.visibility = Some(visibility);
        self
    }

    /// Pixel position on a surface of the given size.
    pub fn to_pixel(&self, width: f32, height: f32) -> Option<(f32, f32)> {
        Some((self.x? * width, self.y? * height))
    }
}

/// Landmarks of one detected person, indexed by anatomical landmark id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LandmarkSet {
    landmarks: Vec<Landmark>,
}

impl LandmarkSet {
    /// Builds a set, dropping anything past the 33 known landmarks.
    pub fn new(mut landmarks: Vec<Landmark>) -> Self {
        landmarks.truncate(POSE_LANDMARK_COUNT);
        Self { landmarks }
    }

    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Landmark> {
        self.landmarks.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Landmark> + '_ {
        self.landmarks.iter()
    }
}

pub fn landmark_name(index: usize) -> &'static str {
    LANDMARK_NAMES.get(index).copied().unwrap_or("UNKNOWN")
}

/// String projection of one landmark as shown in the landmark table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayRow {
    pub id: usize,
    pub name: &'static str,
    pub x: String,
    pub y: String,
    pub z: String,
}

impl DisplayRow {
    pub fn from_landmark(id: usize, landmark: &Landmark) -> Self {
        Self {
            id,
            name: landmark_name(id),
            x: format_coordinate(landmark.x),
            y: format_coordinate(landmark.y),
            z: format_coordinate(landmark.z),
        }
    }
}

fn format_coordinate(value: Option<f32>) -> String {
    match value {
        Some(v) => format!("{:.2}", v),
        None => NOT_AVAILABLE.to_string(),
    }
}

/// Throttled view of the most recent landmark set.
///
/// Rows are replaced wholesale from a single accepted set, so the table never
/// mixes landmarks from two frames.
#[derive(Debug, Clone)]
pub struct LandmarkTable {
    rows: Vec<DisplayRow>,
    last_update_ms: Option<f64>,
    refresh_interval_ms: f64,
}

impl LandmarkTable {
    pub fn new(refresh_interval_ms: f64) -> Self {
        Self {
            rows: Vec::with_capacity(POSE_LANDMARK_COUNT),
            last_update_ms: None,
            refresh_interval_ms,
        }
    }

    /// Offers a freshly detected set. Returns whether it was accepted.
    pub fn offer(&mut self, set: &LandmarkSet, now_ms: f64) -> bool {
        if let Some(last) = self.last_update_ms {
            if now_ms - last < self.refresh_interval_ms {
                return false;
            }
        }

        self.last_update_ms = Some(now_ms);
        self.rows = set
            .iter()
            .enumerate()
            .map(|(id, lm)| DisplayRow::from_landmark(id, lm))
            .collect();
        trace!(rows = self.rows.len(), at_ms = now_ms, "landmark table refreshed");
        true
    }

    pub fn rows(&self) -> &[DisplayRow] {
        &self.rows
    }

    pub fn last_update_ms(&self) -> Option<f64> {
        self.last_update_ms
    }
}

impl Default for LandmarkTable {
    fn default() -> Self {
        Self::new(500.0)
    }
}
