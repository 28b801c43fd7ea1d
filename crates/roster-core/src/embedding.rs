//! Embedding capability and the adapter the pipeline calls through.
//!
//! `ArcFaceEmbedder` extracts 512-dimensional embeddings from aligned
//! 112×112 crops using the ArcFace model via ONNX Runtime.

use crate::types::{AlignedFace, Embedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric normalization

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("embedding unavailable: {0}")]
    Unavailable(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces one feature vector per fixed-size face crop.
pub trait Embedder: Send {
    fn embed(&mut self, crop: &RgbImage) -> Result<Vec<f32>, EmbeddingError>;
}

/// ArcFace-based embedder.
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbeddingError> {
        if !Path::new(model_path).exists() {
            return Err(EmbeddingError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Preprocess an RGB crop into a normalized NCHW float tensor.
    fn preprocess(crop: &RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE as usize;
        let resized;
        let crop = if crop.dimensions() == (ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE) {
            crop
        } else {
            resized = imageops::resize(
                crop,
                ARCFACE_INPUT_SIZE,
                ARCFACE_INPUT_SIZE,
                FilterType::Triangle,
            );
            &resized
        };

        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in crop.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                tensor[[0, c, y, x]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }
        tensor
    }
}

impl Embedder for ArcFaceEmbedder {
    fn embed(&mut self, crop: &RgbImage) -> Result<Vec<f32>, EmbeddingError> {
        let input = Self::preprocess(crop);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbeddingError::InferenceFailed(format!("embedding extraction: {e}")))?;

        Ok(l2_normalize(raw.to_vec()))
    }
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

/// Validating wrapper around an [`Embedder`].
pub struct EmbeddingAdapter {
    embedder: Box<dyn Embedder>,
    face_size: u32,
    dim: usize,
}

impl EmbeddingAdapter {
    pub fn new(embedder: Box<dyn Embedder>, face_size: u32, dim: usize) -> Self {
        Self { embedder, face_size, dim }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn embed(&mut self, face: &AlignedFace) -> Result<Embedding, EmbeddingError> {
        let (w, h) = face.image.dimensions();
        if w == 0 || h == 0 {
            return Err(EmbeddingError::Unavailable("empty face crop".into()));
        }
        if (w, h) != (self.face_size, self.face_size) {
            return Err(EmbeddingError::Unavailable(format!(
                "face crop is {w}x{h}, expected {0}x{0}",
                self.face_size
            )));
        }

        let values = self.embedder.embed(&face.image)?;
        if values.len() != self.dim {
            return Err(EmbeddingError::Unavailable(format!(
                "expected {}-dim embedding, got {}",
                self.dim,
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::Unavailable("non-finite embedding values".into()));
        }

        Ok(Embedding::new(values))
    }
}
