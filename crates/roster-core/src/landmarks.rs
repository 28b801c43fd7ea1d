//! Landmark capability: two reference points per face crop for roll
//! estimation.

use crate::types::LandmarkPair;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const LANDMARK_INPUT_SIZE: u32 = 60;
const LANDMARK_POINT_COUNT: usize = 35;
/// Indices of the two eye points used as the roll reference.
const REFERENCE_POINTS: (usize, usize) = (1, 3);

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub trait LandmarkLocator: Send {
    /// Two reference points in crop-relative normalized coordinates.
    fn reference_points(&mut self, crop: &RgbImage) -> Result<LandmarkPair, LandmarkError>;
}

/// 35-point facial landmark regressor.
pub struct OnnxLandmarkLocator {
    session: Session,
}

impl OnnxLandmarkLocator {
    pub fn load(model_path: &str) -> Result<Self, LandmarkError> {
        if !Path::new(model_path).exists() {
            return Err(LandmarkError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded landmark model"
        );

        Ok(Self { session })
    }

    fn preprocess(crop: &RgbImage) -> Array4<f32> {
        let size = LANDMARK_INPUT_SIZE as usize;
        let resized = imageops::resize(
            crop,
            LANDMARK_INPUT_SIZE,
            LANDMARK_INPUT_SIZE,
            FilterType::Triangle,
        );
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

impl LandmarkLocator for OnnxLandmarkLocator {
    fn reference_points(&mut self, crop: &RgbImage) -> Result<LandmarkPair, LandmarkError> {
        let input = Self::preprocess(crop);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, coords) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LandmarkError::InferenceFailed(format!("landmark output: {e}")))?;

        pick_reference_points(coords)
    }
}

fn pick_reference_points(coords: &[f32]) -> Result<LandmarkPair, LandmarkError> {
    if coords.len() < LANDMARK_POINT_COUNT * 2 {
        return Err(LandmarkError::InferenceFailed(format!(
            "expected {} landmark coordinates, got {}",
            LANDMARK_POINT_COUNT * 2,
            coords.len()
        )));
    }
    let point = |i: usize| (coords[i * 2], coords[i * 2 + 1]);
    Ok(LandmarkPair {
        first: point(REFERENCE_POINTS.0),
        second: point(REFERENCE_POINTS.1),
    })
}
