//! Classifier training: multinomial logistic regression over standardized
//! embeddings from complete profiles.

use crate::config::TrainingConfig;
use crate::store::IdentityProfile;
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Column deviations below this are treated as constant features.
const MIN_FEATURE_STD: f32 = 1e-8;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("no complete profiles to train on")]
    NoTrainableData,
    #[error("only one identity is trainable and single-identity models are disabled")]
    SingleIdentity,
    #[error("embedding dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("training diverged (non-finite weights)")]
    Diverged,
    #[error("shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Bidirectional mapping between class indices and identity ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelEncoder {
    labels: Vec<String>,
}

impl LabelEncoder {
    /// Build an encoding in first-seen order.
    pub fn fit<'a, I>(labels: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen: Vec<String> = Vec::new();
        for label in labels {
            if !seen.iter().any(|l| l == label) {
                seen.push(label.to_string());
            }
        }
        Self { labels: seen }
    }

    pub fn encode(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn decode(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Per-feature mean/std scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    mean: Vec<f32>,
    scale: Vec<f32>,
}

impl Standardizer {
    fn fit(x: &Array2<f32>) -> Self {
        let dim = x.ncols();
        let mean = x
            .mean_axis(Axis(0))
            .map(|m| m.to_vec())
            .unwrap_or_else(|| vec![0.0; dim]);
        let scale = x
            .std_axis(Axis(0), 0.0)
            .iter()
            .map(|&s| if s > MIN_FEATURE_STD { s } else { 1.0 })
            .collect();
        Self { mean, scale }
    }

    fn apply(&self, x: &Array2<f32>) -> Array2<f32> {
        let mean = Array1::from(self.mean.clone());
        let scale = Array1::from(self.scale.clone());
        (x - &mean) / &scale
    }

    fn transform(&self, values: &[f32]) -> Vec<f32> {
        values
            .iter()
            .zip(self.mean.iter().zip(self.scale.iter()))
            .map(|(v, (m, s))| (v - m) / s)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Softmax over two or more identities.
    Multinomial,
    /// Exactly one trainable identity: every probe scores 1.0 for it and
    /// rejection is left to the novelty gate.
    SingleIdentity,
}

/// A trained label→probability function. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierModel {
    kind: ModelKind,
    encoder: LabelEncoder,
    dim: usize,
    standardizer: Standardizer,
    /// `dim × classes`, row-major.
    weights: Vec<f32>,
    bias: Vec<f32>,
    /// Mean raw embedding per class.
    centroids: Vec<Vec<f32>>,
    sample_count: usize,
    trained_at: DateTime<Utc>,
}

impl ClassifierModel {
    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn encoder(&self) -> &LabelEncoder {
        &self.encoder
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn classes(&self) -> usize {
        self.encoder.len()
    }

    pub fn centroid(&self, class: usize) -> Option<&[f32]> {
        self.centroids.get(class).map(Vec::as_slice)
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    /// Structural sanity check for models read back from storage.
    pub fn is_consistent(&self) -> bool {
        let k = self.classes();
        let shapes_ok = self.standardizer.mean.len() == self.dim
            && self.standardizer.scale.len() == self.dim
            && self.centroids.len() == k
            && self.centroids.iter().all(|c| c.len() == self.dim);
        let params_ok = match self.kind {
            ModelKind::SingleIdentity => k == 1,
            ModelKind::Multinomial => {
                k >= 2 && self.weights.len() == self.dim * k && self.bias.len() == k
            }
        };
        self.dim > 0 && shapes_ok && params_ok && self.is_finite()
    }

    fn is_finite(&self) -> bool {
        let finite = |v: &[f32]| v.iter().all(|x| x.is_finite());
        finite(&self.standardizer.mean)
            && finite(&self.standardizer.scale)
            && self.standardizer.scale.iter().all(|s| *s != 0.0)
            && finite(&self.weights)
            && finite(&self.bias)
            && self.centroids.iter().all(|c| finite(c))
    }

    /// Per-class probabilities for one embedding of length `dim()`.
    pub fn predict_proba(&self, embedding: &[f32]) -> Vec<f32> {
        let k = self.classes();
        if self.kind == ModelKind::SingleIdentity {
            return vec![1.0];
        }

        let z = self.standardizer.transform(embedding);
        let mut logits = self.bias.clone();
        for (d, zd) in z.iter().enumerate() {
            let row = &self.weights[d * k..(d + 1) * k];
            for (logit, w) in logits.iter_mut().zip(row) {
                *logit += zd * w;
            }
        }
        softmax(&mut logits);
        logits
    }
}

fn softmax(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

fn softmax_rows(m: &mut Array2<f32>) {
    for mut row in m.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |a, &v| a.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row /= sum;
        }
    }
}

/// Full-batch gradient descent on the L2-penalized softmax cross-entropy.
fn fit_softmax(
    x: &Array2<f32>,
    y: &[usize],
    classes: usize,
    config: &TrainingConfig,
) -> (Array2<f32>, Array1<f32>) {
    let (n, d) = x.dim();
    let mut w = Array2::<f32>::zeros((d, classes));
    let mut b = Array1::<f32>::zeros(classes);

    let mut targets = Array2::<f32>::zeros((n, classes));
    for (i, &label) in y.iter().enumerate() {
        targets[[i, label]] = 1.0;
    }

    let inv_n = 1.0 / n as f32;
    for _ in 0..config.iterations {
        let mut probs = x.dot(&w) + &b;
        softmax_rows(&mut probs);
        let residual = probs - &targets;

        let grad_w = x.t().dot(&residual) * inv_n + &w * config.l2_penalty;
        let grad_b = residual.sum_axis(Axis(0)) * inv_n;

        w.scaled_add(-config.learning_rate, &grad_w);
        b.scaled_add(-config.learning_rate, &grad_b);
    }

    (w, b)
}

pub struct Trainer {
    config: TrainingConfig,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    /// Train a fresh model from every complete profile.
    pub fn train(&self, profiles: &[IdentityProfile]) -> Result<ClassifierModel, TrainingError> {
        let complete: Vec<&IdentityProfile> = profiles
            .iter()
            .filter(|p| p.is_complete() && !p.embeddings().is_empty())
            .collect();
        if complete.is_empty() {
            return Err(TrainingError::NoTrainableData);
        }

        let encoder = LabelEncoder::fit(complete.iter().map(|p| p.id()));
        let dim = complete[0].embeddings()[0].dim();

        let mut flat = Vec::new();
        let mut labels = Vec::new();
        let mut centroids = vec![vec![0.0f32; dim]; encoder.len()];
        for profile in &complete {
            let class = encoder.encode(profile.id()).ok_or(TrainingError::NoTrainableData)?;
            for embedding in profile.embeddings() {
                if embedding.dim() != dim {
                    return Err(TrainingError::DimensionMismatch {
                        expected: dim,
                        found: embedding.dim(),
                    });
                }
                flat.extend_from_slice(&embedding.values);
                labels.push(class);
                for (c, v) in centroids[class].iter_mut().zip(&embedding.values) {
                    *c += v;
                }
            }
            let count = profile.embeddings().len() as f32;
            centroids[class].iter_mut().for_each(|c| *c /= count);
        }

        let n = labels.len();
        let x = Array2::from_shape_vec((n, dim), flat)?;
        let standardizer = Standardizer::fit(&x);

        let (kind, weights, bias) = if encoder.len() == 1 {
            if !self.config.allow_single_identity {
                return Err(TrainingError::SingleIdentity);
            }
            tracing::warn!(
                id = encoder.decode(0).unwrap_or_default(),
                "only one trainable identity; building a single-identity model"
            );
            (ModelKind::SingleIdentity, Vec::new(), Vec::new())
        } else {
            let z = standardizer.apply(&x);
            let (w, b) = fit_softmax(&z, &labels, encoder.len(), &self.config);
            if w.iter().chain(b.iter()).any(|v| !v.is_finite()) {
                return Err(TrainingError::Diverged);
            }
            (ModelKind::Multinomial, w.iter().copied().collect(), b.to_vec())
        };

        tracing::info!(
            classes = encoder.len(),
            samples = n,
            dim,
            kind = ?kind,
            "classifier trained"
        );

        Ok(ClassifierModel {
            kind,
            encoder,
            dim,
            standardizer,
            weights,
            bias,
            centroids,
            sample_count: n,
            trained_at: Utc::now(),
        })
    }
}
