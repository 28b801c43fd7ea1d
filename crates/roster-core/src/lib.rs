//! roster-core: face enrollment and open-set recognition pipeline.
//!
//! Detected faces are roll-corrected from two landmark points, embedded by
//! an ArcFace-style network, collected into identity profiles, and
//! classified by a logistic-regression model that is retrained whenever the
//! enrolled set changes. Models run via ONNX Runtime for CPU inference.

pub mod alignment;
pub mod classifier;
pub mod config;
pub mod detector;
pub mod embedding;
pub mod landmarks;
pub mod persist;
pub mod recognizer;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod types;

pub use alignment::{AlignError, GeometryAligner};
pub use classifier::{ClassifierModel, ModelKind, Trainer, TrainingError};
pub use config::{ConfigError, PipelineConfig, TrainingConfig};
pub use detector::{Detector, DetectorError, SsdFaceDetector};
pub use embedding::{ArcFaceEmbedder, Embedder, EmbeddingAdapter, EmbeddingError};
pub use landmarks::{LandmarkError, LandmarkLocator, OnnxLandmarkLocator};
pub use persist::{MemoryRepository, PersistError, ProfileRecord, Repository};
pub use recognizer::{ModelSlot, RecognitionEngine, RecognitionError, Verdict, UNKNOWN_LABEL};
pub use scheduler::{RetrainOutcome, RetrainScheduler};
pub use service::{
    Capabilities, EnrollReport, EnrollStatus, FaceRecognition, IdentitySummary, PipelineError,
    PoseOutcome, PoseStatus, RetrainSummary, RosterService, ServiceStatus, UpdateReport,
};
pub use store::{
    Completeness, DirtyFlags, IdentityProfile, IdentityStore, ProfileFields, ProfileUpdate,
    StoreError, UpdateMode,
};
pub use types::{AlignedFace, BoundingBox, Detection, Embedding, LandmarkPair};
