use crate::config::Config;
use crate::sqlite::SqliteRepository;
use image::RgbImage;
use roster_core::{
    ArcFaceEmbedder, Capabilities, EnrollReport, FaceRecognition, IdentitySummary, ModelSlot,
    OnnxLandmarkLocator, PersistError, PipelineError, ProfileFields, ProfileUpdate, RosterService,
    ServiceStatus, SsdFaceDetector, UpdateMode, UpdateReport,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] roster_core::DetectorError),
    #[error("landmark error: {0}")]
    Landmark(#[from] roster_core::LandmarkError),
    #[error("embedding error: {0}")]
    Embedding(#[from] roster_core::EmbeddingError),
    #[error("storage error: {0}")]
    Storage(#[from] PersistError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        id: String,
        fields: ProfileFields,
        poses: Vec<(String, RgbImage)>,
        reply: oneshot::Sender<Result<EnrollReport, EngineError>>,
    },
    Update {
        id: String,
        images: Vec<RgbImage>,
        mode: UpdateMode,
        update: ProfileUpdate,
        reply: oneshot::Sender<Result<UpdateReport, EngineError>>,
    },
    Delete {
        id: String,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Recognize {
        image: RgbImage,
        reply: oneshot::Sender<Result<Vec<FaceRecognition>, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<ServiceStatus>,
    },
    List {
        reply: oneshot::Sender<Vec<IdentitySummary>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Enroll a new identity from named pose images.
    pub async fn enroll(
        &self,
        id: String,
        fields: ProfileFields,
        poses: Vec<(String, RgbImage)>,
    ) -> Result<EnrollReport, EngineError> {
        self.call(|reply| EngineRequest::Enroll { id, fields, poses, reply }).await?
    }

    pub async fn update(
        &self,
        id: String,
        images: Vec<RgbImage>,
        mode: UpdateMode,
        update: ProfileUpdate,
    ) -> Result<UpdateReport, EngineError> {
        self.call(|reply| EngineRequest::Update { id, images, mode, update, reply }).await?
    }

    pub async fn delete(&self, id: String) -> Result<bool, EngineError> {
        self.call(|reply| EngineRequest::Delete { id, reply }).await?
    }

    /// Recognize every face in a frame.
    pub async fn recognize(&self, image: RgbImage) -> Result<Vec<FaceRecognition>, EngineError> {
        self.call(|reply| EngineRequest::Recognize { image, reply }).await?
    }

    pub async fn status(&self) -> Result<ServiceStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }

    pub async fn list(&self) -> Result<Vec<IdentitySummary>, EngineError> {
        self.call(|reply| EngineRequest::List { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the three ONNX models, opens the database and restores the
/// pipeline, then enters a request loop. Fails fast at startup if any
/// resource is unavailable or persisted state is corrupt.
pub fn spawn_engine(config: &Config) -> Result<(EngineHandle, ModelSlot), EngineError> {
    let detector_path = config.detector_model_path();
    let detector = SsdFaceDetector::load(&detector_path)?;
    tracing::info!(path = %detector_path, "face detector loaded");

    let landmarks_path = config.landmarks_model_path();
    let landmarks = OnnxLandmarkLocator::load(&landmarks_path)?;
    tracing::info!(path = %landmarks_path, "landmark model loaded");

    let arcface_path = config.arcface_model_path();
    let embedder = ArcFaceEmbedder::load(&arcface_path)?;
    tracing::info!(path = %arcface_path, "ArcFace embedder loaded");

    let repository = SqliteRepository::open(&config.db_path)?;
    let capabilities = Capabilities {
        detector: Box::new(detector),
        landmarks: Box::new(landmarks),
        embedder: Box::new(embedder),
    };
    let slot = ModelSlot::new();
    let mut service = RosterService::open(
        config.pipeline.clone(),
        capabilities,
        Box::new(repository),
        slot.clone(),
    )?;

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("roster-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                handle(&mut service, req);
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    Ok((EngineHandle { tx }, slot))
}

fn handle(service: &mut RosterService, req: EngineRequest) {
    match req {
        EngineRequest::Enroll { id, fields, poses, reply } => {
            let _ = reply.send(service.enroll_identity(&id, fields, poses).map_err(Into::into));
        }
        EngineRequest::Update { id, images, mode, update, reply } => {
            let result = service.update_identity(&id, images, mode, update);
            let _ = reply.send(result.map_err(Into::into));
        }
        EngineRequest::Delete { id, reply } => {
            let _ = reply.send(service.delete_identity(&id).map_err(Into::into));
        }
        EngineRequest::Recognize { image, reply } => {
            let _ = reply.send(service.recognize_face(&image).map_err(Into::into));
        }
        EngineRequest::Status { reply } => {
            let _ = reply.send(service.status());
        }
        EngineRequest::List { reply } => {
            let _ = reply.send(service.identities());
        }
    }
}
