//! Open-set recognition against the currently published classifier.

use crate::classifier::ClassifierModel;
use crate::embedding::{EmbeddingAdapter, EmbeddingError};
use crate::types::{cosine_similarity, AlignedFace, Embedding};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Label reported for faces that match no enrolled identity.
pub const UNKNOWN_LABEL: &str = "Unknown";

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("embedding: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("probe has {found} dimensions, model expects {expected}")]
    DimensionMismatch { expected: usize, found: usize },
}

/// Holder for the published classifier. Clones share the same slot.
///
/// Publishing swaps the whole model; readers keep whatever `Arc` they
/// snapshotted, so a retrain never changes a model mid-prediction.
#[derive(Clone, Default)]
pub struct ModelSlot {
    current: Arc<RwLock<Option<Arc<ClassifierModel>>>>,
    version: Arc<AtomicU64>,
}

impl ModelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new model and return its version.
    pub fn publish(&self, model: ClassifierModel) -> u64 {
        let model = Arc::new(model);
        let mut guard = self.current.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some(model);
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn withdraw(&self) {
        let mut guard = self.current.write().unwrap_or_else(|p| p.into_inner());
        if guard.take().is_some() {
            tracing::info!("classifier withdrawn");
        }
    }

    pub fn snapshot(&self) -> Option<Arc<ClassifierModel>> {
        self.current.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Number of models published so far; 0 means never trained.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Identified { id: String, probability: f32 },
    /// Best class failed the probability threshold or the novelty gate.
    Unknown { probability: f32 },
    /// No model has been published.
    Untrained,
}

impl Verdict {
    /// The identity id, or `"Unknown"` for anything else.
    pub fn label(&self) -> &str {
        match self {
            Verdict::Identified { id, .. } => id,
            _ => UNKNOWN_LABEL,
        }
    }
}

pub struct RecognitionEngine {
    slot: ModelSlot,
    threshold: f32,
    novelty_similarity: f32,
}

impl RecognitionEngine {
    pub fn new(slot: ModelSlot, threshold: f32, novelty_similarity: f32) -> Self {
        Self {
            slot,
            threshold,
            novelty_similarity,
        }
    }

    pub fn slot(&self) -> &ModelSlot {
        &self.slot
    }

    pub fn recognize(
        &self,
        face: &AlignedFace,
        adapter: &mut EmbeddingAdapter,
    ) -> Result<Verdict, RecognitionError> {
        let embedding = adapter.embed(face)?;
        self.classify(&embedding)
    }

    /// Classify an already-computed embedding.
    pub fn classify(&self, embedding: &Embedding) -> Result<Verdict, RecognitionError> {
        let Some(model) = self.slot.snapshot() else {
            return Ok(Verdict::Untrained);
        };
        if embedding.dim() != model.dim() {
            return Err(RecognitionError::DimensionMismatch {
                expected: model.dim(),
                found: embedding.dim(),
            });
        }

        let proba = model.predict_proba(&embedding.values);
        let Some((best, probability)) = argmax(&proba) else {
            return Ok(Verdict::Unknown { probability: 0.0 });
        };

        if probability < self.threshold {
            tracing::debug!(probability, threshold = self.threshold, "below recognition threshold");
            return Ok(Verdict::Unknown { probability });
        }

        let similarity = model
            .centroid(best)
            .map(|c| cosine_similarity(&embedding.values, c))
            .unwrap_or(0.0);
        if similarity < self.novelty_similarity {
            tracing::debug!(
                similarity,
                floor = self.novelty_similarity,
                "probe is novel, rejecting"
            );
            return Ok(Verdict::Unknown { probability });
        }

        match model.encoder().decode(best) {
            Some(id) => Ok(Verdict::Identified {
                id: id.to_string(),
                probability,
            }),
            None => Ok(Verdict::Unknown { probability }),
        }
    }
}

/// Index and value of the largest entry; ties keep the lowest index.
fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best
}
