//! Face alignment by roll correction.
//!
//! Each confident detection is cropped, its roll is estimated from two
//! landmark reference points, the surrounding region (the box grown by half
//! its size on every side) is rotated upright, and the detector runs again on
//! the rotated region to produce the final crop.

use crate::detector::{Detector, DetectorError};
use crate::landmarks::{LandmarkError, LandmarkLocator};
use crate::types::{AlignedFace, BoundingBox, Detection};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use thiserror::Error;

/// Below this the roll triangle is degenerate.
const ROLL_EPSILON: f32 = 1e-6;

#[derive(Error, Debug)]
pub enum AlignError {
    #[error("no face detected")]
    DetectionEmpty,
    #[error("re-detection after rotation found no face")]
    AlignmentFailure,
    #[error("detected region is empty")]
    EmptyRegion,
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("landmarks: {0}")]
    Landmark(#[from] LandmarkError),
}

/// Roll angle in degrees of the line from `p0` to `p1` relative to the
/// horizontal. Positive when `p1` lies below `p0` (image y grows downward).
pub fn roll_angle(p0: (f32, f32), p1: (f32, f32)) -> f32 {
    let dy = p1.1 - p0.1;
    let a = dy.abs();
    let b = (p1.0 - p0.0).abs();
    let c = (a * a + b * b).sqrt();

    let sign = if dy > 0.0 {
        1.0
    } else if dy < 0.0 {
        -1.0
    } else {
        0.0
    };

    let denom = 2.0 * b * c;
    if denom <= ROLL_EPSILON {
        // Coincident points carry no angle; vertically stacked ones are a quarter turn.
        return if a <= ROLL_EPSILON { 0.0 } else { sign * 90.0 };
    }

    let cos_alpha = ((b * b + c * c - a * a) / denom).clamp(-1.0, 1.0);
    sign * cos_alpha.acos().to_degrees()
}

/// 2×3 matrix rotating by `angle_deg` about `(cx, cy)`, counter-clockwise as
/// displayed (y down).
///
/// ```text
/// |  cos  sin  (1-cos)·cx - sin·cy |
/// | -sin  cos  sin·cx + (1-cos)·cy |
/// ```
pub fn rotation_matrix(cx: f32, cy: f32, angle_deg: f32) -> [f32; 6] {
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    [
        cos,
        sin,
        (1.0 - cos) * cx - sin * cy,
        -sin,
        cos,
        sin * cx + (1.0 - cos) * cy,
    ]
}

pub fn apply_matrix(m: &[f32; 6], p: (f32, f32)) -> (f32, f32) {
    (
        m[0] * p.0 + m[1] * p.1 + m[2],
        m[3] * p.0 + m[4] * p.1 + m[5],
    )
}

/// Rotate an image about its center, keeping its dimensions.
///
/// Uses bilinear interpolation. Out-of-bounds pixels are filled with black.
pub fn rotate_about_center(image: &RgbImage, angle_deg: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    let cx = width as f32 / 2.0;
    let cy = height as f32 / 2.0;
    let (sin, cos) = angle_deg.to_radians().sin_cos();

    let sample = |x: i32, y: i32| -> [f32; 3] {
        if x >= 0 && x < width as i32 && y >= 0 && y < height as i32 {
            let p = image.get_pixel(x as u32, y as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let mut output = RgbImage::new(width, height);
    for (ox, oy, out) in output.enumerate_pixels_mut() {
        // Map output pixel back to source through the inverse rotation
        let dx = ox as f32 - cx;
        let dy = oy as f32 - cy;
        let sx = cos * dx - sin * dy + cx;
        let sy = sin * dx + cos * dy + cy;

        let x0 = sx.floor() as i32;
        let y0 = sy.floor() as i32;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let tl = sample(x0, y0);
        let tr = sample(x0 + 1, y0);
        let bl = sample(x0, y0 + 1);
        let br = sample(x0 + 1, y0 + 1);

        let mut px = [0u8; 3];
        for c in 0..3 {
            let val = tl[c] * (1.0 - fx) * (1.0 - fy)
                + tr[c] * fx * (1.0 - fy)
                + bl[c] * (1.0 - fx) * fy
                + br[c] * fx * fy;
            px[c] = val.round().clamp(0.0, 255.0) as u8;
        }
        *out = Rgb(px);
    }

    output
}

/// Crop `bbox` out of `image` (clamped) and resize it to `size` × `size`.
pub fn crop_resized(image: &RgbImage, bbox: &BoundingBox, size: u32) -> Option<RgbImage> {
    let (x, y, w, h) = bbox.clamp_to(image.width(), image.height()).pixel_rect();
    if w == 0 || h == 0 {
        return None;
    }
    let crop = imageops::crop_imm(image, x, y, w, h).to_image();
    Some(imageops::resize(&crop, size, size, FilterType::Triangle))
}

/// Turns raw frames into upright face crops.
pub struct GeometryAligner {
    detector: Box<dyn Detector>,
    landmarks: Box<dyn LandmarkLocator>,
    confidence_threshold: f32,
    face_size: u32,
}

impl GeometryAligner {
    pub fn new(
        detector: Box<dyn Detector>,
        landmarks: Box<dyn LandmarkLocator>,
        confidence_threshold: f32,
        face_size: u32,
    ) -> Self {
        Self {
            detector,
            landmarks,
            confidence_threshold,
            face_size,
        }
    }

    /// Locate and align every confident face in `frame`.
    ///
    /// Returns an empty list when nothing clears the confidence threshold.
    /// A candidate whose landmarks or re-detection fail is dropped without
    /// affecting the others.
    pub fn locate(&mut self, frame: &RgbImage) -> Result<Vec<AlignedFace>, AlignError> {
        let detections = self.detect_confident(frame)?;
        if detections.is_empty() {
            tracing::debug!(
                width = frame.width(),
                height = frame.height(),
                "no confident face in frame"
            );
            return Ok(Vec::new());
        }

        let mut faces = Vec::with_capacity(detections.len());
        for (i, detection) in detections.iter().enumerate() {
            match self.align_candidate(frame, detection) {
                Ok(face) => faces.push(face),
                Err(err) => {
                    tracing::debug!(
                        candidate = i,
                        confidence = detection.confidence,
                        error = %err,
                        "dropping face candidate"
                    );
                }
            }
        }

        tracing::debug!(
            detected = detections.len(),
            aligned = faces.len(),
            "alignment finished"
        );
        Ok(faces)
    }

    fn detect_confident(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let threshold = self.confidence_threshold;
        Ok(self
            .detector
            .detect(image)?
            .into_iter()
            .filter(|d| d.confidence >= threshold)
            .collect())
    }

    fn align_candidate(
        &mut self,
        frame: &RgbImage,
        detection: &Detection,
    ) -> Result<AlignedFace, AlignError> {
        let crop =
            crop_resized(frame, &detection.bbox, self.face_size).ok_or(AlignError::EmptyRegion)?;

        let points = self
            .landmarks
            .reference_points(&crop)?
            .to_pixels(crop.width(), crop.height());
        let roll = roll_angle(points.first, points.second);

        let region = detection.bbox.expand_half(frame.width(), frame.height());
        let (rx, ry, rw, rh) = region.pixel_rect();
        if rw == 0 || rh == 0 {
            return Err(AlignError::EmptyRegion);
        }
        let region_image = imageops::crop_imm(frame, rx, ry, rw, rh).to_image();
        let upright = rotate_about_center(&region_image, roll);

        // Several faces may share the grown region; keep the most confident.
        let best = self
            .detect_confident(&upright)?
            .into_iter()
            .fold(None::<Detection>, |best, d| match best {
                Some(b) if b.confidence >= d.confidence => Some(b),
                _ => Some(d),
            })
            .ok_or(AlignError::AlignmentFailure)?;

        let image =
            crop_resized(&upright, &best.bbox, self.face_size).ok_or(AlignError::EmptyRegion)?;

        Ok(AlignedFace {
            image,
            bbox: best.bbox.translate(rx as f32, ry as f32),
            source: *detection,
            roll_degrees: roll,
        })
    }
}
