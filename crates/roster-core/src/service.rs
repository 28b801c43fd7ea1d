//! Boundary operations: enroll, update, delete, recognize.
//!
//! `RosterService` owns one instance of every pipeline stage plus the
//! persistence port. It is not `Sync`; the daemon keeps it on a single
//! engine thread, which serializes every mutation and retrain.

use crate::alignment::{AlignError, GeometryAligner};
use crate::classifier::Trainer;
use crate::config::{ConfigError, PipelineConfig};
use crate::detector::Detector;
use crate::embedding::{Embedder, EmbeddingAdapter};
use crate::landmarks::LandmarkLocator;
use crate::persist::{PersistError, Repository};
use crate::recognizer::{ModelSlot, RecognitionEngine, RecognitionError, Verdict};
use crate::scheduler::{RetrainOutcome, RetrainScheduler};
use crate::store::{
    Completeness, DirtyFlags, EnrollmentResult, IdentityStore, ProfileFields, ProfileUpdate,
    StoreError, UpdateMode,
};
use crate::types::{AlignedFace, BoundingBox};
use chrono::{DateTime, Utc};
use image::imageops;
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("alignment: {0}")]
    Align(#[from] AlignError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("recognition: {0}")]
    Recognition(#[from] RecognitionError),
    #[error("persistence: {0}")]
    Persist(#[from] PersistError),
}

/// The three model-backed capabilities the pipeline calls out to.
pub struct Capabilities {
    pub detector: Box<dyn Detector>,
    pub landmarks: Box<dyn LandmarkLocator>,
    pub embedder: Box<dyn Embedder>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PoseOutcome {
    Accepted,
    Rejected { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PoseStatus {
    pub pose: String,
    #[serde(flatten)]
    pub outcome: PoseOutcome,
}

impl PoseStatus {
    pub fn is_accepted(&self) -> bool {
        self.outcome == PoseOutcome::Accepted
    }
}

/// Serializable form of a [`RetrainOutcome`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "retrain", rename_all = "snake_case")]
pub enum RetrainSummary {
    Skipped,
    Published { version: u64 },
    Withdrawn,
    Failed { reason: String },
}

impl From<&RetrainOutcome> for RetrainSummary {
    fn from(outcome: &RetrainOutcome) -> Self {
        match outcome {
            RetrainOutcome::Skipped => RetrainSummary::Skipped,
            RetrainOutcome::Published { version } => RetrainSummary::Published {
                version: *version,
            },
            RetrainOutcome::Withdrawn => RetrainSummary::Withdrawn,
            RetrainOutcome::Failed(err) => RetrainSummary::Failed {
                reason: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollStatus {
    Created,
    AlreadyExists,
    NothingAccepted,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollReport {
    pub id: String,
    pub status: EnrollStatus,
    pub poses: Vec<PoseStatus>,
    pub completeness: Option<Completeness>,
    pub retrain: RetrainSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub id: String,
    pub mode: UpdateMode,
    pub images: Vec<PoseStatus>,
    pub before: Completeness,
    pub after: Completeness,
    pub retrain: RetrainSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct FaceRecognition {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub roll_degrees: f32,
    pub label: String,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub embeddings: usize,
    pub completeness: Completeness,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub identities: usize,
    pub complete: usize,
    pub required_pose_count: usize,
    pub model_version: u64,
    pub model_labels: Vec<String>,
    pub trained_at: Option<DateTime<Utc>>,
    pub pending: DirtyFlags,
}

pub struct RosterService {
    config: PipelineConfig,
    aligner: GeometryAligner,
    adapter: EmbeddingAdapter,
    store: IdentityStore,
    scheduler: RetrainScheduler,
    engine: RecognitionEngine,
    repository: Box<dyn Repository>,
}

impl RosterService {
    /// Build the pipeline and restore persisted state.
    ///
    /// Corrupt persisted data is returned as an error, never replaced with
    /// an empty store.
    pub fn open(
        config: PipelineConfig,
        capabilities: Capabilities,
        repository: Box<dyn Repository>,
        slot: ModelSlot,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let records = repository.load_profiles()?;
        if records.is_empty() {
            tracing::warn!("no persisted profiles, starting with an empty store");
        }
        let store = IdentityStore::from_records(records, config.required_pose_count);
        let model = repository.load_model()?;

        let aligner = GeometryAligner::new(
            capabilities.detector,
            capabilities.landmarks,
            config.detection_confidence,
            config.face_size,
        );
        let adapter = EmbeddingAdapter::new(
            capabilities.embedder,
            config.face_size,
            config.embedding_dim,
        );
        let scheduler = RetrainScheduler::new(Trainer::new(config.training.clone()), slot.clone());
        let engine = RecognitionEngine::new(
            slot,
            config.recognition_threshold,
            config.novelty_similarity,
        );

        let mut service = Self {
            config,
            aligner,
            adapter,
            store,
            scheduler,
            engine,
            repository,
        };

        let stale = match model {
            Some(model) if service.model_matches_store(model.dim(), model.encoder().labels()) => {
                let version = service.engine.slot().publish(model);
                tracing::info!(version, identities = service.store.len(), "restored classifier");
                false
            }
            Some(_) => {
                tracing::warn!(
                    "persisted classifier does not match the stored profiles, retraining"
                );
                true
            }
            None => service.store.complete_count() > 0,
        };
        if stale {
            let change = DirtyFlags {
                mutated: true,
                has_new_complete_profile: false,
            };
            let retrain = service.commit(change, None)?;
            tracing::info!(?retrain, "startup retrain finished");
        }

        Ok(service)
    }

    fn model_matches_store(&self, dim: usize, labels: &[String]) -> bool {
        let complete: Vec<&str> = self
            .store
            .profiles()
            .iter()
            .filter(|p| p.is_complete())
            .map(|p| p.id())
            .collect();
        dim == self.config.embedding_dim
            && labels.len() == complete.len()
            && labels.iter().all(|l| complete.contains(&l.as_str()))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn model_slot(&self) -> ModelSlot {
        self.engine.slot().clone()
    }

    /// Align one image to its first face, or say why it was rejected.
    fn first_face(&mut self, image: &RgbImage, mirror: bool) -> Result<AlignedFace, String> {
        let mirrored;
        let image = if mirror {
            mirrored = imageops::flip_horizontal(image);
            &mirrored
        } else {
            image
        };
        match self.aligner.locate(image) {
            Ok(faces) => faces
                .into_iter()
                .next()
                .ok_or_else(|| AlignError::DetectionEmpty.to_string()),
            Err(err) => Err(err.to_string()),
        }
    }

    /// Align a batch, returning the faces found and a status slot per input.
    fn align_batch(
        &mut self,
        images: Vec<(String, RgbImage)>,
        mirror: bool,
    ) -> (Vec<AlignedFace>, Vec<usize>, Vec<PoseStatus>) {
        let mut faces = Vec::with_capacity(images.len());
        let mut origin = Vec::with_capacity(images.len());
        let mut statuses = Vec::with_capacity(images.len());
        for (i, (pose, image)) in images.into_iter().enumerate() {
            let outcome = match self.first_face(&image, mirror) {
                Ok(face) => {
                    faces.push(face);
                    origin.push(i);
                    PoseOutcome::Accepted
                }
                Err(reason) => {
                    tracing::debug!(pose = %pose, reason = %reason, "pose rejected");
                    PoseOutcome::Rejected { reason }
                }
            };
            statuses.push(PoseStatus { pose, outcome });
        }
        (faces, origin, statuses)
    }

    /// Persist profiles, run the scheduler, and persist what it produced.
    ///
    /// When the profile save fails the store is reset to `checkpoint`, so
    /// memory never holds a mutation that storage rejected.
    fn commit(
        &mut self,
        change: DirtyFlags,
        checkpoint: Option<IdentityStore>,
    ) -> Result<RetrainSummary, PipelineError> {
        if change.mutated {
            if let Err(err) = self.repository.save_profiles(&self.store.records()) {
                if let Some(previous) = checkpoint {
                    tracing::warn!(error = %err, "profile save failed, rolling back");
                    self.store = previous;
                }
                return Err(err.into());
            }
        }
        let outcome = self.scheduler.after_mutation(&mut self.store, change);
        match &outcome {
            RetrainOutcome::Published { .. } => {
                if let Some(model) = self.engine.slot().snapshot() {
                    self.repository.save_model(&model)?;
                }
            }
            RetrainOutcome::Withdrawn => self.repository.clear_model()?,
            RetrainOutcome::Skipped | RetrainOutcome::Failed(_) => {}
        }
        Ok(RetrainSummary::from(&outcome))
    }

    pub fn enroll_identity(
        &mut self,
        id: &str,
        fields: ProfileFields,
        poses: Vec<(String, RgbImage)>,
    ) -> Result<EnrollReport, PipelineError> {
        tracing::info!(id, poses = poses.len(), "enroll request");

        if self.store.contains(id) {
            tracing::info!(id, "identity already enrolled, ignoring");
            let poses = poses
                .into_iter()
                .map(|(pose, _)| PoseStatus {
                    pose,
                    outcome: PoseOutcome::Rejected {
                        reason: "identity already enrolled".into(),
                    },
                })
                .collect();
            return Ok(EnrollReport {
                id: id.to_string(),
                status: EnrollStatus::AlreadyExists,
                poses,
                completeness: self.store.get(id).map(|p| p.completeness()),
                retrain: RetrainSummary::Skipped,
            });
        }

        let mirror = self.config.mirror_enrollment_images;
        let (faces, origin, mut poses) = self.align_batch(poses, mirror);
        let checkpoint = self.store.clone();
        let mutation = self.store.enroll(id, fields, &faces, &mut self.adapter);

        let (status, completeness) = match mutation.outcome {
            EnrollmentResult::Created { accepted, completeness } => {
                reject_unembedded(&mut poses, &origin, &accepted);
                (EnrollStatus::Created, Some(completeness))
            }
            EnrollmentResult::NothingAccepted => {
                reject_unembedded(&mut poses, &origin, &vec![false; origin.len()]);
                (EnrollStatus::NothingAccepted, None)
            }
            EnrollmentResult::AlreadyExists => (EnrollStatus::AlreadyExists, None),
        };

        let retrain = self.commit(mutation.change, Some(checkpoint))?;
        Ok(EnrollReport {
            id: id.to_string(),
            status,
            poses,
            completeness,
            retrain,
        })
    }

    pub fn update_identity(
        &mut self,
        id: &str,
        images: Vec<RgbImage>,
        mode: UpdateMode,
        update: ProfileUpdate,
    ) -> Result<UpdateReport, PipelineError> {
        tracing::info!(id, images = images.len(), %mode, "update request");
        if !self.store.contains(id) {
            return Err(StoreError::NotFound(id.to_string()).into());
        }

        let named = images
            .into_iter()
            .enumerate()
            .map(|(i, image)| (format!("#{i}"), image))
            .collect();
        let mirror = self.config.mirror_enrollment_images;
        let (faces, origin, mut images) = self.align_batch(named, mirror);
        let checkpoint = self.store.clone();
        let mutation = self.store.update(id, &faces, mode, update, &mut self.adapter)?;
        reject_unembedded(&mut images, &origin, &mutation.outcome.accepted);

        let retrain = self.commit(mutation.change, Some(checkpoint))?;
        Ok(UpdateReport {
            id: id.to_string(),
            mode,
            images,
            before: mutation.outcome.before,
            after: mutation.outcome.after,
            retrain,
        })
    }

    /// Remove an identity. Returns whether it existed.
    pub fn delete_identity(&mut self, id: &str) -> Result<bool, PipelineError> {
        let checkpoint = self.store.clone();
        let mutation = self.store.delete(id);
        let retrain = self.commit(mutation.change, Some(checkpoint))?;
        tracing::info!(id, found = mutation.outcome, ?retrain, "delete request");
        Ok(mutation.outcome)
    }

    /// One entry per aligned face in `image`; empty when no face is found.
    pub fn recognize_face(
        &mut self,
        image: &RgbImage,
    ) -> Result<Vec<FaceRecognition>, PipelineError> {
        let faces = self.aligner.locate(image)?;
        let mut results = Vec::with_capacity(faces.len());
        for face in &faces {
            let verdict = match self.engine.recognize(face, &mut self.adapter) {
                Ok(verdict) => verdict,
                Err(RecognitionError::Embedding(err)) => {
                    tracing::warn!(error = %err, "skipping face without embedding");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            results.push(FaceRecognition {
                bbox: face.bbox,
                confidence: face.source.confidence,
                roll_degrees: face.roll_degrees,
                label: verdict.label().to_string(),
                verdict,
            });
        }
        tracing::debug!(faces = results.len(), "recognition finished");
        Ok(results)
    }

    pub fn status(&self) -> ServiceStatus {
        let model = self.engine.slot().snapshot();
        ServiceStatus {
            identities: self.store.len(),
            complete: self.store.complete_count(),
            required_pose_count: self.store.required_pose_count(),
            model_version: self.engine.slot().version(),
            model_labels: model.as_ref().map(|m| m.encoder().labels().to_vec()).unwrap_or_default(),
            trained_at: model.as_ref().map(|m| m.trained_at()),
            pending: self.store.dirty(),
        }
    }

    pub fn identities(&self) -> Vec<IdentitySummary> {
        self.store
            .profiles()
            .iter()
            .map(|p| IdentitySummary {
                id: p.id().to_string(),
                name: p.fields().name.clone(),
                email: p.fields().email.clone(),
                embeddings: p.embeddings().len(),
                completeness: p.completeness(),
                enrolled_at: p.enrolled_at(),
                updated_at: p.updated_at(),
            })
            .collect()
    }
}

/// Mark aligned poses whose embedding failed as rejected.
fn reject_unembedded(statuses: &mut [PoseStatus], origin: &[usize], accepted: &[bool]) {
    for (&index, &ok) in origin.iter().zip(accepted) {
        if !ok {
            statuses[index].outcome = PoseOutcome::Rejected {
                reason: "embedding unavailable".into(),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::tests::{FixedLandmarks, ScriptedDetector};
    use crate::classifier::ClassifierModel;
    use crate::persist::{MemoryRepository, ProfileRecord};
    use crate::store::tests::ColorEmbedder;
    use crate::types::{Detection, LandmarkPair};
    use image::Rgb;

    fn config() -> PipelineConfig {
        PipelineConfig {
            required_pose_count: 2,
            embedding_dim: 3,
            face_size: 16,
            ..PipelineConfig::default()
        }
    }

    fn hit() -> Vec<Detection> {
        vec![Detection {
            bbox: BoundingBox::new(8.0, 8.0, 24.0, 24.0),
            confidence: 0.9,
        }]
    }

    fn capabilities(responses: Vec<Vec<Detection>>) -> Capabilities {
        Capabilities {
            detector: Box::new(ScriptedDetector {
                responses: responses.into(),
            }),
            landmarks: Box::new(FixedLandmarks(LandmarkPair {
                first: (0.3, 0.4),
                second: (0.7, 0.4),
            })),
            embedder: Box::new(ColorEmbedder),
        }
    }

    fn image(color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(32, 32, Rgb(color))
    }

    fn fields() -> ProfileFields {
        ProfileFields {
            name: "Alice".into(),
            email: None,
        }
    }

    fn open_with(responses: Vec<Vec<Detection>>, repo: impl Repository + 'static) -> RosterService {
        RosterService::open(config(), capabilities(responses), Box::new(repo), ModelSlot::new())
            .unwrap()
    }

    fn open(responses: Vec<Vec<Detection>>) -> RosterService {
        open_with(responses, MemoryRepository::new())
    }

    fn two_poses() -> Vec<(String, RgbImage)> {
        vec![
            ("a".to_string(), image([90, 10, 10])),
            ("b".to_string(), image([95, 10, 10])),
        ]
    }

    /// Fails the first `failures` profile saves, then delegates.
    struct FlakyRepository {
        inner: MemoryRepository,
        failures: usize,
    }

    impl Repository for FlakyRepository {
        fn load_profiles(&self) -> Result<Vec<ProfileRecord>, PersistError> {
            self.inner.load_profiles()
        }

        fn save_profiles(&mut self, profiles: &[ProfileRecord]) -> Result<(), PersistError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(PersistError::Backend("disk full".into()));
            }
            self.inner.save_profiles(profiles)
        }

        fn load_model(&self) -> Result<Option<ClassifierModel>, PersistError> {
            self.inner.load_model()
        }

        fn save_model(&mut self, model: &ClassifierModel) -> Result<(), PersistError> {
            self.inner.save_model(model)
        }

        fn clear_model(&mut self) -> Result<(), PersistError> {
            self.inner.clear_model()
        }
    }

    #[test]
    fn test_enroll_reports_per_pose() {
        // Pose "left" finds no face; "front" and "right" align.
        let responses = vec![vec![], hit(), hit(), hit(), hit()];
        let mut service = open(responses);

        let poses = vec![
            ("left".to_string(), image([200, 10, 10])),
            ("front".to_string(), image([200, 10, 10])),
            ("right".to_string(), image([210, 10, 10])),
        ];
        let report = service.enroll_identity("alice", fields(), poses).unwrap();
        assert_eq!(report.status, EnrollStatus::Created);
        let accepted: Vec<bool> = report.poses.iter().map(PoseStatus::is_accepted).collect();
        assert_eq!(accepted, vec![false, true, true]);
        assert_eq!(report.completeness, Some(Completeness::Complete));
        assert_eq!(report.retrain, RetrainSummary::Published { version: 1 });
    }

    #[test]
    fn test_duplicate_enroll_skips_alignment() {
        let responses = vec![hit(), hit(), hit(), hit()];
        let mut service = open(responses);
        service.enroll_identity("alice", fields(), two_poses()).unwrap();

        let report = service.enroll_identity("alice", fields(), two_poses()).unwrap();
        assert_eq!(report.status, EnrollStatus::AlreadyExists);
        assert_eq!(report.retrain, RetrainSummary::Skipped);
        assert_eq!(service.identities()[0].embeddings, 2);
    }

    #[test]
    fn test_failed_save_rolls_back_enroll() {
        let stored = MemoryRepository::new();
        let repo = FlakyRepository {
            inner: stored.clone(),
            failures: 1,
        };
        let responses = vec![hit(); 8];
        let mut service = open_with(responses, repo);

        let err = service.enroll_identity("alice", fields(), two_poses()).unwrap_err();
        assert!(matches!(err, PipelineError::Persist(PersistError::Backend(_))));
        assert!(service.identities().is_empty());
        assert_eq!(service.status().pending, DirtyFlags::default());
        assert!(service.model_slot().snapshot().is_none());

        let report = service.enroll_identity("alice", fields(), two_poses()).unwrap();
        assert_eq!(report.status, EnrollStatus::Created);
        assert_eq!(report.retrain, RetrainSummary::Published { version: 1 });
        assert_eq!(stored.load_profiles().unwrap().len(), 1);
        assert!(stored.has_model());
    }

    #[test]
    fn test_failed_save_rolls_back_delete() {
        let stored = MemoryRepository::new();
        let repo = FlakyRepository { inner: stored.clone(), failures: 0 };
        let responses = vec![hit(); 4];
        let mut service = open_with(responses, repo);
        service.enroll_identity("alice", fields(), two_poses()).unwrap();

        let flaky = FlakyRepository { inner: stored.clone(), failures: 1 };
        let mut service = open_with(vec![], flaky);
        assert!(service.delete_identity("alice").is_err());
        assert_eq!(service.identities().len(), 1);
        assert!(service.model_slot().snapshot().is_some());
        assert!(service.delete_identity("alice").unwrap());
        assert!(stored.load_profiles().unwrap().is_empty());
    }

    #[test]
    fn test_update_missing_identity() {
        let mut service = open(vec![]);
        let err = service
            .update_identity(
                "ghost",
                vec![image([1, 2, 3])],
                UpdateMode::Add,
                ProfileUpdate::default(),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Store(StoreError::NotFound(_))));
    }

    #[test]
    fn test_recognize_without_faces_is_empty() {
        let mut service = open(vec![]);
        assert!(service.recognize_face(&image([1, 2, 3])).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = PipelineConfig {
            detection_confidence: 2.0,
            ..config()
        };
        let repo = Box::new(MemoryRepository::new());
        let result = RosterService::open(bad, capabilities(vec![]), repo, ModelSlot::new());
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_corrupt_model_is_fatal() {
        let repo = MemoryRepository::with_model_body("[1, 2");
        let result =
            RosterService::open(config(), capabilities(vec![]), Box::new(repo), ModelSlot::new());
        assert!(matches!(result, Err(PipelineError::Persist(PersistError::Corrupt(_)))));
    }

    #[test]
    fn test_reject_unembedded_maps_back_to_input() {
        let mut statuses: Vec<PoseStatus> = ["a", "b", "c"]
            .iter()
            .map(|p| PoseStatus {
                pose: p.to_string(),
                outcome: PoseOutcome::Accepted,
            })
            .collect();
        statuses[0].outcome = PoseOutcome::Rejected {
            reason: "no face detected".into(),
        };
        reject_unembedded(&mut statuses, &[1, 2], &[true, false]);
        assert!(statuses[1].is_accepted());
        assert!(!statuses[2].is_accepted());
    }
}
