use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Axis-aligned box in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl BoundingBox {
    pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self { x_min, y_min, x_max, y_max }
    }

    pub fn width(&self) -> f32 {
        (self.x_max - self.x_min).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y_max - self.y_min).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn is_empty(&self) -> bool {
        self.width() < 1.0 || self.height() < 1.0
    }

    /// Clamp the box to a `width` × `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x_min: self.x_min.clamp(0.0, w),
            y_min: self.y_min.clamp(0.0, h),
            x_max: self.x_max.clamp(0.0, w),
            y_max: self.y_max.clamp(0.0, h),
        }
    }

    /// Grow the box by half its width on the left and right and half its
    /// height on the top and bottom, clamped to the frame.
    pub fn expand_half(&self, width: u32, height: u32) -> Self {
        let dx = self.width() / 2.0;
        let dy = self.height() / 2.0;
        Self {
            x_min: self.x_min - dx,
            y_min: self.y_min - dy,
            x_max: self.x_max + dx,
            y_max: self.y_max + dy,
        }
        .clamp_to(width, height)
    }

    pub fn translate(&self, dx: f32, dy: f32) -> Self {
        Self {
            x_min: self.x_min + dx,
            y_min: self.y_min + dy,
            x_max: self.x_max + dx,
            y_max: self.y_max + dy,
        }
    }

    /// Intersection-over-Union between two boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = BoundingBox {
            x_min: self.x_min.max(other.x_min),
            y_min: self.y_min.max(other.y_min),
            x_max: self.x_max.min(other.x_max),
            y_max: self.y_max.min(other.y_max),
        }
        .area();
        let union_area = self.area() + other.area() - inter;
        if union_area > 0.0 { inter / union_area } else { 0.0 }
    }

    /// Integer pixel rectangle `(x, y, w, h)` covering the box.
    pub(crate) fn pixel_rect(&self) -> (u32, u32, u32, u32) {
        let x = self.x_min.max(0.0).floor() as u32;
        let y = self.y_min.max(0.0).floor() as u32;
        let x2 = self.x_max.max(0.0).ceil() as u32;
        let y2 = self.y_max.max(0.0).ceil() as u32;
        (x, y, x2.saturating_sub(x), y2.saturating_sub(y))
    }
}

/// One detector hit. Confidence is in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Two facial reference points used to estimate roll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkPair {
    pub first: (f32, f32),
    pub second: (f32, f32),
}

impl LandmarkPair {
    /// Rescale crop-relative normalized points to pixel coordinates.
    pub fn to_pixels(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            first: (self.first.0 * w, self.first.1 * h),
            second: (self.second.0 * w, self.second.1 * h),
        }
    }
}

/// An upright, size-normalized face crop ready for embedding.
#[derive(Debug, Clone)]
pub struct AlignedFace {
    pub image: RgbImage,
    /// Box of the final re-detection, in source-frame coordinates.
    pub bbox: BoundingBox,
    /// The first-pass detection this face was aligned from.
    pub source: Detection,
    /// Estimated roll in degrees that was corrected.
    pub roll_degrees: f32,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Zero vectors
    /// compare as 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 { dot / denom } else { 0.0 }
}
