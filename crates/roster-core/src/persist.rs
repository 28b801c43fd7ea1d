//! Persistence port for the profile collection and the trained model.

use crate::classifier::ClassifierModel;
use crate::store::ProfileFields;
use crate::types::Embedding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("corrupt persisted data: {0}")]
    Corrupt(String),
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Storage form of an identity profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: String,
    pub fields: ProfileFields,
    pub embeddings: Vec<Embedding>,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub trait Repository: Send {
    fn load_profiles(&self) -> Result<Vec<ProfileRecord>, PersistError>;
    /// Replace the whole stored collection.
    fn save_profiles(&mut self, profiles: &[ProfileRecord]) -> Result<(), PersistError>;
    fn load_model(&self) -> Result<Option<ClassifierModel>, PersistError>;
    fn save_model(&mut self, model: &ClassifierModel) -> Result<(), PersistError>;
    fn clear_model(&mut self) -> Result<(), PersistError>;
}

/// Decode a persisted model body, rejecting structurally broken models.
pub fn decode_model(body: &str) -> Result<ClassifierModel, PersistError> {
    let model: ClassifierModel = serde_json::from_str(body)
        .map_err(|e| PersistError::Corrupt(format!("classifier: {e}")))?;
    if !model.is_consistent() {
        return Err(PersistError::Corrupt(
            "classifier: inconsistent or non-finite parameters".into(),
        ));
    }
    Ok(model)
}

pub fn encode_model(model: &ClassifierModel) -> Result<String, PersistError> {
    serde_json::to_string(model)
        .map_err(|e| PersistError::Backend(format!("encode classifier: {e}")))
}

#[derive(Default)]
struct MemoryState {
    profiles: Vec<ProfileRecord>,
    model: Option<String>,
}

/// In-process repository. Clones share the same contents.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the stored model body verbatim.
    pub fn with_model_body(body: impl Into<String>) -> Self {
        let repo = Self::default();
        if let Ok(mut state) = repo.state.lock() {
            state.model = Some(body.into());
        }
        repo
    }

    pub fn has_model(&self) -> bool {
        self.state.lock().map(|s| s.model.is_some()).unwrap_or(false)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> Result<T, PersistError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PersistError::Backend("memory repository lock poisoned".into()))?;
        Ok(f(&mut state))
    }
}

impl Repository for MemoryRepository {
    fn load_profiles(&self) -> Result<Vec<ProfileRecord>, PersistError> {
        self.with_state(|s| s.profiles.clone())
    }

    fn save_profiles(&mut self, profiles: &[ProfileRecord]) -> Result<(), PersistError> {
        self.with_state(|s| s.profiles = profiles.to_vec())
    }

    fn load_model(&self) -> Result<Option<ClassifierModel>, PersistError> {
        let body = self.with_state(|s| s.model.clone())?;
        body.as_deref().map(decode_model).transpose()
    }

    fn save_model(&mut self, model: &ClassifierModel) -> Result<(), PersistError> {
        let body = encode_model(model)?;
        self.with_state(|s| s.model = Some(body))
    }

    fn clear_model(&mut self) -> Result<(), PersistError> {
        self.with_state(|s| s.model = None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Trainer;
    use crate::config::TrainingConfig;
    use crate::store::IdentityStore;

    fn record(id: &str) -> ProfileRecord {
        let now = Utc::now();
        ProfileRecord {
            id: id.into(),
            fields: ProfileFields {
                name: id.to_uppercase(),
                email: None,
            },
            embeddings: vec![Embedding::new(vec![0.1, 0.2])],
            enrolled_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_memory_profiles_replace() {
        let mut repo = MemoryRepository::new();
        repo.save_profiles(&[record("a"), record("b")]).unwrap();
        repo.save_profiles(&[record("c")]).unwrap();
        let loaded = repo.load_profiles().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "c");
    }

    #[test]
    fn test_clones_share_state() {
        let mut repo = MemoryRepository::new();
        let view = repo.clone();
        repo.save_profiles(&[record("a")]).unwrap();
        assert_eq!(view.load_profiles().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_model_body() {
        let repo = MemoryRepository::with_model_body("{ not json");
        assert!(matches!(repo.load_model(), Err(PersistError::Corrupt(_))));
    }

    #[test]
    fn test_overflowing_weights_are_corrupt() {
        let with = |id: &str, points: [[f32; 2]; 2]| ProfileRecord {
            embeddings: points.iter().map(|p| Embedding::new(p.to_vec())).collect(),
            ..record(id)
        };
        let records = vec![
            with("a", [[1.0, 0.0], [0.9, 0.1]]),
            with("b", [[0.0, 1.0], [0.1, 0.9]]),
        ];
        let store = IdentityStore::from_records(records, 2);
        let model = Trainer::new(TrainingConfig::default())
            .train(store.profiles())
            .unwrap();

        // 1e39 parses as f32 infinity.
        let mut body: serde_json::Value =
            serde_json::from_str(&encode_model(&model).unwrap()).unwrap();
        body["weights"][0] = serde_json::json!(1e39);
        let repo = MemoryRepository::with_model_body(body.to_string());
        assert!(matches!(repo.load_model(), Err(PersistError::Corrupt(_))));

        let repo = MemoryRepository::with_model_body(encode_model(&model).unwrap());
        assert!(repo.load_model().unwrap().is_some());
    }

    #[test]
    fn test_empty_model() {
        let repo = MemoryRepository::new();
        assert!(repo.load_model().unwrap().is_none());
        assert!(!repo.has_model());
    }
}
