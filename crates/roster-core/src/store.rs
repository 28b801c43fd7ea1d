//! Identity store: enrolled profiles, completeness, and dirty flags.
//!
//! The store does no locking of its own. Callers serialize mutations; the
//! daemon does so by owning the store on a single engine thread.

use crate::embedding::EmbeddingAdapter;
use crate::persist::ProfileRecord;
use crate::types::{AlignedFace, Embedding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum StoreError {
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("invalid update mode: {0} (expected \"add\" or \"replace\")")]
    InvalidMode(String),
}

/// Descriptive metadata for an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileFields {
    pub name: String,
    pub email: Option<String>,
}

/// Metadata replacements carried by a `replace` update. Absent fields keep
/// their current value.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Completeness {
    Incomplete { count: usize },
    Complete,
}

impl Completeness {
    fn for_count(count: usize, required: usize) -> Self {
        if count >= required {
            Completeness::Complete
        } else {
            Completeness::Incomplete { count }
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Completeness::Complete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Append new embeddings after the existing ones.
    Add,
    /// Discard existing embeddings and install the new batch.
    Replace,
}

impl FromStr for UpdateMode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "add" => Ok(UpdateMode::Add),
            "replace" => Ok(UpdateMode::Replace),
            other => Err(StoreError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateMode::Add => f.write_str("add"),
            UpdateMode::Replace => f.write_str("replace"),
        }
    }
}

/// One enrolled person.
#[derive(Debug, Clone)]
pub struct IdentityProfile {
    id: String,
    fields: ProfileFields,
    embeddings: Vec<Embedding>,
    completeness: Completeness,
    enrolled_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl IdentityProfile {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fields(&self) -> &ProfileFields {
        &self.fields
    }

    /// Embeddings in enrollment order, oldest first.
    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }

    pub fn completeness(&self) -> Completeness {
        self.completeness
    }

    pub fn is_complete(&self) -> bool {
        self.completeness.is_complete()
    }

    pub fn enrolled_at(&self) -> DateTime<Utc> {
        self.enrolled_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn refresh(&mut self, required: usize) {
        self.completeness = Completeness::for_count(self.embeddings.len(), required);
    }

    pub fn to_record(&self) -> ProfileRecord {
        ProfileRecord {
            id: self.id.clone(),
            fields: self.fields.clone(),
            embeddings: self.embeddings.clone(),
            enrolled_at: self.enrolled_at,
            updated_at: self.updated_at,
        }
    }
}

/// Pending retrain triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyFlags {
    pub mutated: bool,
    pub has_new_complete_profile: bool,
}

impl DirtyFlags {
    pub fn any(&self) -> bool {
        self.mutated || self.has_new_complete_profile
    }

    fn merge(&mut self, other: DirtyFlags) {
        self.mutated |= other.mutated;
        self.has_new_complete_profile |= other.has_new_complete_profile;
    }
}

/// Result of a store call plus the dirty-flag transitions it caused.
#[derive(Debug, Clone)]
pub struct Mutation<T> {
    pub outcome: T,
    pub change: DirtyFlags,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrollmentResult {
    /// The id was already enrolled; nothing changed.
    AlreadyExists,
    /// No face produced an embedding; no profile was created.
    NothingAccepted,
    Created {
        /// Whether each input face produced an embedding, in input order.
        accepted: Vec<bool>,
        completeness: Completeness,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
    pub accepted: Vec<bool>,
    pub before: Completeness,
    pub after: Completeness,
}

#[derive(Debug, Clone)]
pub struct IdentityStore {
    profiles: Vec<IdentityProfile>,
    required_pose_count: usize,
    dirty: DirtyFlags,
}

impl IdentityStore {
    pub fn new(required_pose_count: usize) -> Self {
        Self {
            profiles: Vec::new(),
            required_pose_count,
            dirty: DirtyFlags::default(),
        }
    }

    /// Rebuild a store from persisted records. Completeness is recomputed
    /// against the current required pose count; duplicate ids keep the
    /// first record.
    pub fn from_records(records: Vec<ProfileRecord>, required_pose_count: usize) -> Self {
        let mut store = Self::new(required_pose_count);
        for record in records {
            if store.contains(&record.id) {
                tracing::warn!(id = %record.id, "skipping duplicate persisted profile");
                continue;
            }
            let mut profile = IdentityProfile {
                id: record.id,
                fields: record.fields,
                embeddings: record.embeddings,
                completeness: Completeness::Incomplete { count: 0 },
                enrolled_at: record.enrolled_at,
                updated_at: record.updated_at,
            };
            profile.refresh(required_pose_count);
            store.profiles.push(profile);
        }
        store
    }

    pub fn records(&self) -> Vec<ProfileRecord> {
        self.profiles.iter().map(IdentityProfile::to_record).collect()
    }

    pub fn required_pose_count(&self) -> usize {
        self.required_pose_count
    }

    /// Profiles in insertion order.
    pub fn profiles(&self) -> &[IdentityProfile] {
        &self.profiles
    }

    pub fn get(&self, id: &str) -> Option<&IdentityProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn complete_count(&self) -> usize {
        self.profiles.iter().filter(|p| p.is_complete()).count()
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    /// Reset both flags. Only a successful retrain should call this.
    pub fn clear_dirty(&mut self) {
        self.dirty = DirtyFlags::default();
    }

    fn record(&mut self, change: DirtyFlags) -> DirtyFlags {
        self.dirty.merge(change);
        change
    }

    fn embed_all(
        faces: &[AlignedFace],
        adapter: &mut EmbeddingAdapter,
    ) -> (Vec<Embedding>, Vec<bool>) {
        let mut embeddings = Vec::with_capacity(faces.len());
        let mut accepted = Vec::with_capacity(faces.len());
        for (i, face) in faces.iter().enumerate() {
            match adapter.embed(face) {
                Ok(embedding) => {
                    embeddings.push(embedding);
                    accepted.push(true);
                }
                Err(err) => {
                    tracing::warn!(face = i, error = %err, "face rejected");
                    accepted.push(false);
                }
            }
        }
        (embeddings, accepted)
    }

    /// Enroll a new identity. An existing id is left untouched.
    pub fn enroll(
        &mut self,
        id: &str,
        fields: ProfileFields,
        faces: &[AlignedFace],
        adapter: &mut EmbeddingAdapter,
    ) -> Mutation<EnrollmentResult> {
        if self.contains(id) {
            tracing::info!(id, "identity already enrolled, ignoring");
            return Mutation {
                outcome: EnrollmentResult::AlreadyExists,
                change: DirtyFlags::default(),
            };
        }

        let (embeddings, accepted) = Self::embed_all(faces, adapter);
        if embeddings.is_empty() {
            return Mutation {
                outcome: EnrollmentResult::NothingAccepted,
                change: DirtyFlags::default(),
            };
        }

        let now = Utc::now();
        let mut profile = IdentityProfile {
            id: id.to_string(),
            fields,
            embeddings,
            completeness: Completeness::Incomplete { count: 0 },
            enrolled_at: now,
            updated_at: now,
        };
        profile.refresh(self.required_pose_count);
        let completeness = profile.completeness;

        tracing::info!(
            id,
            embeddings = profile.embeddings.len(),
            complete = completeness.is_complete(),
            "identity enrolled"
        );
        self.profiles.push(profile);

        let change = self.record(DirtyFlags {
            mutated: true,
            has_new_complete_profile: completeness.is_complete(),
        });
        Mutation {
            outcome: EnrollmentResult::Created { accepted, completeness },
            change,
        }
    }

    /// Add to or replace an identity's embeddings.
    pub fn update(
        &mut self,
        id: &str,
        faces: &[AlignedFace],
        mode: UpdateMode,
        update: ProfileUpdate,
        adapter: &mut EmbeddingAdapter,
    ) -> Result<Mutation<UpdateResult>, StoreError> {
        let required = self.required_pose_count;
        let index = self
            .profiles
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let (embeddings, accepted) = Self::embed_all(faces, adapter);

        let profile = &mut self.profiles[index];
        let before = profile.completeness;
        if mode == UpdateMode::Replace && embeddings.is_empty() {
            tracing::info!(id, "replace accepted no faces, profile left unchanged");
            return Ok(Mutation {
                outcome: UpdateResult { accepted, before, after: before },
                change: DirtyFlags::default(),
            });
        }
        match mode {
            UpdateMode::Add => profile.embeddings.extend(embeddings),
            UpdateMode::Replace => {
                profile.embeddings = embeddings;
                if let Some(name) = update.name {
                    profile.fields.name = name;
                }
                if let Some(email) = update.email {
                    profile.fields.email = Some(email);
                }
            }
        }
        profile.refresh(required);
        profile.updated_at = Utc::now();
        let after = profile.completeness;

        tracing::info!(
            id,
            %mode,
            embeddings = profile.embeddings.len(),
            ?before,
            ?after,
            "identity updated"
        );

        let change = self.record(DirtyFlags {
            mutated: true,
            has_new_complete_profile: !before.is_complete() && after.is_complete(),
        });
        Ok(Mutation {
            outcome: UpdateResult { accepted, before, after },
            change,
        })
    }

    /// Remove an identity. Returns whether it existed.
    pub fn delete(&mut self, id: &str) -> Mutation<bool> {
        let Some(index) = self.profiles.iter().position(|p| p.id == id) else {
            return Mutation {
                outcome: false,
                change: DirtyFlags::default(),
            };
        };
        self.profiles.remove(index);
        tracing::info!(id, "identity deleted");

        let change = self.record(DirtyFlags {
            mutated: true,
            has_new_complete_profile: false,
        });
        Mutation { outcome: true, change }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::embedding::{Embedder, EmbeddingError};
    use crate::types::{BoundingBox, Detection};
    use image::{Rgb, RgbImage};

    /// Embeds a crop as its top-left color; black crops are unusable.
    pub(crate) struct ColorEmbedder;

    impl Embedder for ColorEmbedder {
        fn embed(&mut self, crop: &RgbImage) -> Result<Vec<f32>, EmbeddingError> {
            let p = crop.get_pixel(0, 0);
            if p[0] == 0 && p[1] == 0 && p[2] == 0 {
                return Err(EmbeddingError::Unavailable("black crop".into()));
            }
            Ok(vec![p[0] as f32 / 255.0, p[1] as f32 / 255.0, p[2] as f32 / 255.0])
        }
    }

    pub(crate) fn adapter() -> EmbeddingAdapter {
        EmbeddingAdapter::new(Box::new(ColorEmbedder), 16, 3)
    }

    pub(crate) fn face(color: [u8; 3]) -> AlignedFace {
        let bbox = BoundingBox::new(0.0, 0.0, 16.0, 16.0);
        AlignedFace {
            image: RgbImage::from_pixel(16, 16, Rgb(color)),
            bbox,
            source: Detection { bbox, confidence: 0.9 },
            roll_degrees: 0.0,
        }
    }

    fn faces(n: usize) -> Vec<AlignedFace> {
        (0..n).map(|i| face([100 + i as u8, 50, 50])).collect()
    }

    fn fields(name: &str) -> ProfileFields {
        ProfileFields {
            name: name.into(),
            email: Some(format!("{}@example.com", name.to_lowercase())),
        }
    }

    fn assert_invariant(store: &IdentityStore) {
        for p in store.profiles() {
            assert_eq!(
                p.is_complete(),
                p.embeddings().len() >= store.required_pose_count(),
                "completeness out of sync for {}",
                p.id()
            );
        }
    }

    #[test]
    fn test_enroll_complete_sets_both_flags() {
        let mut store = IdentityStore::new(3);
        let m = store.enroll("alice", fields("Alice"), &faces(3), &mut adapter());
        assert!(matches!(
            m.outcome,
            EnrollmentResult::Created {
                completeness: Completeness::Complete,
                ..
            }
        ));
        assert_eq!(
            m.change,
            DirtyFlags {
                mutated: true,
                has_new_complete_profile: true
            }
        );
        assert_eq!(store.dirty(), m.change);
        assert_invariant(&store);
    }

    #[test]
    fn test_enroll_incomplete_sets_only_mutated() {
        let mut store = IdentityStore::new(3);
        let m = store.enroll("bob", fields("Bob"), &faces(2), &mut adapter());
        assert!(matches!(
            m.outcome,
            EnrollmentResult::Created { completeness: Completeness::Incomplete { count: 2 }, .. }
        ));
        assert_eq!(
            m.change,
            DirtyFlags {
                mutated: true,
                has_new_complete_profile: false
            }
        );
    }

    #[test]
    fn test_enroll_existing_is_noop() {
        let mut store = IdentityStore::new(3);
        store.enroll("alice", fields("Alice"), &faces(2), &mut adapter());
        store.clear_dirty();

        let m = store.enroll("alice", fields("Mallory"), &faces(5), &mut adapter());
        assert_eq!(m.outcome, EnrollmentResult::AlreadyExists);
        assert!(!m.change.any());
        assert!(!store.dirty().any());
        let alice = store.get("alice").unwrap();
        assert_eq!(alice.embeddings().len(), 2);
        assert_eq!(alice.fields().name, "Alice");
    }

    #[test]
    fn test_enroll_reports_rejected_faces() {
        let mut store = IdentityStore::new(2);
        let batch = vec![face([10, 10, 10]), face([0, 0, 0]), face([20, 20, 20])];
        let m = store.enroll("carol", fields("Carol"), &batch, &mut adapter());
        match m.outcome {
            EnrollmentResult::Created { accepted, completeness } => {
                assert_eq!(accepted, vec![true, false, true]);
                assert_eq!(completeness, Completeness::Complete);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_enroll_nothing_accepted_leaves_store_unchanged() {
        let mut store = IdentityStore::new(2);
        let m = store.enroll("dave", fields("Dave"), &[face([0, 0, 0])], &mut adapter());
        assert_eq!(m.outcome, EnrollmentResult::NothingAccepted);
        assert!(store.is_empty());
        assert!(!store.dirty().any());
    }

    #[test]
    fn test_add_completes_profile_once() {
        let mut store = IdentityStore::new(3);
        store.enroll("alice", fields("Alice"), &faces(2), &mut adapter());

        let m = store
            .update("alice", &faces(1), UpdateMode::Add, ProfileUpdate::default(), &mut adapter())
            .unwrap();
        assert_eq!(m.outcome.before, Completeness::Incomplete { count: 2 });
        assert_eq!(m.outcome.after, Completeness::Complete);
        assert!(m.change.has_new_complete_profile);

        let m = store
            .update("alice", &faces(1), UpdateMode::Add, ProfileUpdate::default(), &mut adapter())
            .unwrap();
        assert_eq!(m.outcome.after, Completeness::Complete);
        assert!(m.change.mutated);
        assert!(!m.change.has_new_complete_profile);
        assert_eq!(store.get("alice").unwrap().embeddings().len(), 4);
    }

    #[test]
    fn test_add_preserves_order() {
        let mut store = IdentityStore::new(3);
        store.enroll("alice", fields("Alice"), &[face([10, 0, 0])], &mut adapter());
        store
            .update(
                "alice",
                &[face([20, 0, 0])],
                UpdateMode::Add,
                ProfileUpdate::default(),
                &mut adapter(),
            )
            .unwrap();
        let values: Vec<f32> = store
            .get("alice")
            .unwrap()
            .embeddings()
            .iter()
            .map(|e| e.values[0])
            .collect();
        assert_eq!(values, vec![10.0 / 255.0, 20.0 / 255.0]);
    }

    #[test]
    fn test_add_never_reverts_completeness() {
        let mut store = IdentityStore::new(3);
        store.enroll("alice", fields("Alice"), &faces(3), &mut adapter());
        let m = store
            .update(
                "alice",
                &[face([0, 0, 0])],
                UpdateMode::Add,
                ProfileUpdate::default(),
                &mut adapter(),
            )
            .unwrap();
        assert_eq!(m.outcome.accepted, vec![false]);
        assert_eq!(m.outcome.after, Completeness::Complete);
    }

    #[test]
    fn test_replace_can_revert_to_incomplete() {
        let mut store = IdentityStore::new(3);
        store.enroll("alice", fields("Alice"), &faces(4), &mut adapter());
        let m = store
            .update(
                "alice",
                &faces(1),
                UpdateMode::Replace,
                ProfileUpdate::default(),
                &mut adapter(),
            )
            .unwrap();
        assert_eq!(m.outcome.before, Completeness::Complete);
        assert_eq!(m.outcome.after, Completeness::Incomplete { count: 1 });
        assert!(m.change.mutated);
        assert!(!m.change.has_new_complete_profile);
        assert_invariant(&store);
    }

    #[test]
    fn test_replace_updates_present_fields_only() {
        let mut store = IdentityStore::new(3);
        store.enroll("alice", fields("Alice"), &faces(1), &mut adapter());
        let update = ProfileUpdate {
            name: Some("Alice Liddell".into()),
            email: None,
        };
        store
            .update("alice", &faces(3), UpdateMode::Replace, update, &mut adapter())
            .unwrap();
        let alice = store.get("alice").unwrap();
        assert_eq!(alice.fields().name, "Alice Liddell");
        assert_eq!(alice.fields().email.as_deref(), Some("alice@example.com"));
        assert!(alice.is_complete());
    }

    #[test]
    fn test_replace_with_no_usable_faces_keeps_profile() {
        let mut store = IdentityStore::new(3);
        store.enroll("alice", fields("Alice"), &faces(3), &mut adapter());
        store.clear_dirty();
        let update = ProfileUpdate {
            name: Some("Eve".into()),
            email: None,
        };
        let m = store
            .update(
                "alice",
                &[face([0, 0, 0]), face([0, 0, 0])],
                UpdateMode::Replace,
                update,
                &mut adapter(),
            )
            .unwrap();
        assert_eq!(m.outcome.accepted, vec![false, false]);
        assert_eq!(m.outcome.after, Completeness::Complete);
        assert_eq!(m.change, DirtyFlags::default());
        assert_eq!(store.dirty(), DirtyFlags::default());
        let alice = store.get("alice").unwrap();
        assert_eq!(alice.embeddings().len(), 3);
        assert_eq!(alice.fields().name, "Alice");
    }

    #[test]
    fn test_add_ignores_field_updates() {
        let mut store = IdentityStore::new(3);
        store.enroll("alice", fields("Alice"), &faces(1), &mut adapter());
        let update = ProfileUpdate {
            name: Some("Eve".into()),
            email: None,
        };
        store.update("alice", &faces(1), UpdateMode::Add, update, &mut adapter()).unwrap();
        assert_eq!(store.get("alice").unwrap().fields().name, "Alice");
    }

    #[test]
    fn test_update_missing_identity() {
        let mut store = IdentityStore::new(3);
        let err = store
            .update("ghost", &faces(1), UpdateMode::Add, ProfileUpdate::default(), &mut adapter())
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound("ghost".into()));
        assert!(!store.dirty().any());
    }

    #[test]
    fn test_delete_existing_and_missing() {
        let mut store = IdentityStore::new(3);
        store.enroll("alice", fields("Alice"), &faces(1), &mut adapter());
        store.clear_dirty();

        let m = store.delete("ghost");
        assert!(!m.outcome);
        assert!(!m.change.any());
        assert_eq!(store.len(), 1);

        let m = store.delete("alice");
        assert!(m.outcome);
        assert!(m.change.mutated);
        assert!(!store.contains("alice"));
    }

    #[test]
    fn test_invariant_over_mutation_sequence() {
        let mut store = IdentityStore::new(3);
        let mut a = adapter();
        store.enroll("a", fields("A"), &faces(1), &mut a);
        assert_invariant(&store);
        store.enroll("b", fields("B"), &faces(5), &mut a);
        assert_invariant(&store);
        store
            .update("a", &faces(2), UpdateMode::Add, ProfileUpdate::default(), &mut a)
            .unwrap();
        assert_invariant(&store);
        store
            .update("b", &faces(1), UpdateMode::Replace, ProfileUpdate::default(), &mut a)
            .unwrap();
        assert_invariant(&store);
        assert_eq!(
            store.get("b").unwrap().completeness(),
            Completeness::Incomplete { count: 1 }
        );
        store
            .update("b", &faces(3), UpdateMode::Add, ProfileUpdate::default(), &mut a)
            .unwrap();
        assert_invariant(&store);
        store.delete("a");
        assert_invariant(&store);
        assert_eq!(store.complete_count(), 1);
    }

    #[test]
    fn test_clear_dirty() {
        let mut store = IdentityStore::new(1);
        store.enroll("a", fields("A"), &faces(1), &mut adapter());
        assert!(store.dirty().any());
        store.clear_dirty();
        assert_eq!(store.dirty(), DirtyFlags::default());
    }

    #[test]
    fn test_from_records_recomputes_completeness() {
        let mut store = IdentityStore::new(3);
        store.enroll("a", fields("A"), &faces(3), &mut adapter());
        let records = store.records();

        let stricter = IdentityStore::from_records(records.clone(), 5);
        assert_eq!(
            stricter.get("a").unwrap().completeness(),
            Completeness::Incomplete { count: 3 }
        );
        assert!(!stricter.dirty().any());

        let mut dup = records.clone();
        dup.extend(records);
        assert_eq!(IdentityStore::from_records(dup, 3).len(), 1);
    }

    #[test]
    fn test_update_mode_parse() {
        assert_eq!("add".parse::<UpdateMode>().unwrap(), UpdateMode::Add);
        assert_eq!("Replace".parse::<UpdateMode>().unwrap(), UpdateMode::Replace);
        assert!("merge".parse::<UpdateMode>().is_err());
    }
}
