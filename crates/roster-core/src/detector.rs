//! Face detector capability and its SSD implementation via ONNX Runtime.
//!
//! The SSD model emits one `[image_id, label, confidence, x_min, y_min,
//! x_max, y_max]` row per candidate with normalized coordinates; suppression
//! is already applied inside the network.

use crate::types::{BoundingBox, Detection};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SSD_INPUT_SIZE: u32 = 300;
const SSD_ROW_LEN: usize = 7;
/// Rows below this score are noise the network pads its output with.
const SSD_MIN_SCORE: f32 = 0.05;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in a full frame.
pub trait Detector: Send {
    /// Returns detections in source-pixel coordinates, sorted by descending
    /// confidence.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError>;
}

/// SSD-based face detector.
pub struct SsdFaceDetector {
    session: Session,
}

impl SsdFaceDetector {
    /// Load the SSD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded SSD face detector"
        );

        Ok(Self { session })
    }

    /// Resize to the network input and lay out as NCHW in BGR order, raw
    /// 0–255 values.
    fn preprocess(image: &RgbImage) -> Array4<f32> {
        let size = SSD_INPUT_SIZE as usize;
        let resized = imageops::resize(image, SSD_INPUT_SIZE, SSD_INPUT_SIZE, FilterType::Triangle);
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            tensor[[0, 0, y, x]] = pixel[2] as f32;
            tensor[[0, 1, y, x]] = pixel[1] as f32;
            tensor[[0, 2, y, x]] = pixel[0] as f32;
        }

        tensor
    }
}

impl Detector for SsdFaceDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let input = Self::preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, rows) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("detection output: {e}")))?;

        Ok(decode_rows(rows, image.width(), image.height()))
    }
}

/// Decode SSD output rows into pixel-space detections.
fn decode_rows(rows: &[f32], width: u32, height: u32) -> Vec<Detection> {
    let (w, h) = (width as f32, height as f32);
    let mut detections: Vec<Detection> = rows
        .chunks_exact(SSD_ROW_LEN)
        // image_id < 0 terminates the valid rows
        .take_while(|row| row[0] >= 0.0)
        .filter(|row| row[2] >= SSD_MIN_SCORE)
        .map(|row| Detection {
            bbox: BoundingBox::new(row[3] * w, row[4] * h, row[5] * w, row[6] * h)
                .clamp_to(width, height),
            confidence: row[2].clamp(0.0, 1.0),
        })
        .filter(|d| !d.bbox.is_empty())
        .collect();

    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    detections
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rows_scales_and_sorts() {
        let rows = vec![
            0.0, 1.0, 0.6, 0.1, 0.1, 0.3, 0.4, //
            0.0, 1.0, 0.9, 0.5, 0.5, 0.75, 1.0,
        ];
        let dets = decode_rows(&rows, 200, 100);
        assert_eq!(dets.len(), 2);
        assert!((dets[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(dets[0].bbox, BoundingBox::new(100.0, 50.0, 150.0, 100.0));
        let b = dets[1].bbox;
        for (got, want) in [(b.x_min, 20.0), (b.y_min, 10.0), (b.x_max, 60.0), (b.y_max, 40.0)] {
            assert!((got - want).abs() < 1e-3, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_decode_rows_stops_at_terminator() {
        let rows = vec![
            0.0, 1.0, 0.8, 0.1, 0.1, 0.3, 0.4, //
            -1.0, 0.0, 0.9, 0.5, 0.5, 0.7, 0.9,
        ];
        assert_eq!(decode_rows(&rows, 100, 100).len(), 1);
    }

    #[test]
    fn test_decode_rows_clamps_and_drops_empty() {
        let rows = vec![
            0.0, 1.0, 0.8, -0.2, -0.1, 1.3, 0.5, //
            0.0, 1.0, 0.8, 0.4, 0.4, 0.4, 0.4,
        ];
        let dets = decode_rows(&rows, 100, 100);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].bbox, BoundingBox::new(0.0, 0.0, 100.0, 50.0));
    }

    #[test]
    fn test_preprocess_bgr_layout() {
        let image = RgbImage::from_pixel(10, 10, image::Rgb([10, 20, 30]));
        let tensor = SsdFaceDetector::preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, 300, 300]);
        assert_eq!(tensor[[0, 0, 5, 5]], 30.0);
        assert_eq!(tensor[[0, 1, 5, 5]], 20.0);
        assert_eq!(tensor[[0, 2, 5, 5]], 10.0);
    }
}
