//! Named pipeline parameters shared by every component.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_REQUIRED_POSE_COUNT: usize = 11;
pub const DEFAULT_DETECTION_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_RECOGNITION_THRESHOLD: f32 = 0.7;
pub const DEFAULT_EMBEDDING_DIM: usize = 512;
pub const DEFAULT_FACE_SIZE: u32 = 112;
pub const DEFAULT_NOVELTY_SIMILARITY: f32 = 0.40;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be between {min} and {max}, got {value}")]
    OutOfRange {
        name: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Embeddings a profile needs before it is eligible for training.
    #[serde(default = "default_required_pose_count")]
    pub required_pose_count: usize,
    /// Minimum detector confidence for a face to be kept.
    #[serde(default = "default_detection_confidence")]
    pub detection_confidence: f32,
    /// Minimum class probability for a positive identification.
    #[serde(default = "default_recognition_threshold")]
    pub recognition_threshold: f32,
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    /// Side length of aligned face crops fed to the embedder.
    #[serde(default = "default_face_size")]
    pub face_size: u32,
    /// Minimum cosine similarity to the winning identity's centroid.
    /// Set to -1.0 to disable the gate.
    #[serde(default = "default_novelty_similarity")]
    pub novelty_similarity: f32,
    /// Mirror enrollment images horizontally before alignment (front cameras).
    #[serde(default)]
    pub mirror_enrollment_images: bool,
    #[serde(default)]
    pub training: TrainingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default = "default_l2_penalty")]
    pub l2_penalty: f32,
    /// Build a single-identity model instead of failing when only one
    /// identity is trainable.
    #[serde(default = "default_true")]
    pub allow_single_identity: bool,
}

fn default_required_pose_count() -> usize {
    DEFAULT_REQUIRED_POSE_COUNT
}

fn default_detection_confidence() -> f32 {
    DEFAULT_DETECTION_CONFIDENCE
}

fn default_recognition_threshold() -> f32 {
    DEFAULT_RECOGNITION_THRESHOLD
}

fn default_embedding_dim() -> usize {
    DEFAULT_EMBEDDING_DIM
}

fn default_face_size() -> u32 {
    DEFAULT_FACE_SIZE
}

fn default_novelty_similarity() -> f32 {
    DEFAULT_NOVELTY_SIMILARITY
}

fn default_iterations() -> usize {
    300
}

fn default_learning_rate() -> f32 {
    0.5
}

fn default_l2_penalty() -> f32 {
    1e-3
}

fn default_true() -> bool {
    true
}


impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            required_pose_count: default_required_pose_count(),
            detection_confidence: default_detection_confidence(),
            recognition_threshold: default_recognition_threshold(),
            embedding_dim: default_embedding_dim(),
            face_size: default_face_size(),
            novelty_similarity: default_novelty_similarity(),
            mirror_enrollment_images: false,
            training: TrainingConfig::default(),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            learning_rate: default_learning_rate(),
            l2_penalty: default_l2_penalty(),
            allow_single_identity: default_true(),
        }
    }
}

fn check(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_nan() || value < min || value > max {
        return Err(ConfigError::OutOfRange { name, min, max, value });
    }
    Ok(())
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check("required_pose_count", self.required_pose_count as f64, 1.0, 1000.0)?;
        check("detection_confidence", self.detection_confidence as f64, 0.0, 1.0)?;
        check("recognition_threshold", self.recognition_threshold as f64, 0.0, 1.0)?;
        check("embedding_dim", self.embedding_dim as f64, 1.0, 8192.0)?;
        check("face_size", self.face_size as f64, 16.0, 1024.0)?;
        check("novelty_similarity", self.novelty_similarity as f64, -1.0, 1.0)?;
        check("training.iterations", self.training.iterations as f64, 1.0, 100_000.0)?;
        check("training.learning_rate", self.training.learning_rate as f64, 1e-6, 10.0)?;
        check("training.l2_penalty", self.training.l2_penalty as f64, 0.0, 10.0)?;
        Ok(())
    }
}
