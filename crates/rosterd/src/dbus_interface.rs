use crate::engine::{EngineError, EngineHandle};
use image::RgbImage;
use roster_core::{ModelSlot, PipelineError, ProfileFields, ProfileUpdate, StoreError, UpdateMode};
use std::collections::HashMap;
use zbus::interface;

/// D-Bus interface for the Roster daemon.
///
/// Bus name: org.freedesktop.Roster1
/// Object path: /org/freedesktop/Roster1
pub struct RosterInterface {
    engine: EngineHandle,
    slot: ModelSlot,
}

impl RosterInterface {
    pub fn new(engine: EngineHandle, slot: ModelSlot) -> Self {
        Self { engine, slot }
    }
}

fn decode_image(bytes: &[u8], what: &str) -> zbus::fdo::Result<RgbImage> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{what}: cannot decode image: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("encode reply: {e}")))
}

/// Empty D-Bus strings stand in for absent optional fields.
fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn map_error(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::Pipeline(PipelineError::Store(StoreError::NotFound(id))) => {
            zbus::fdo::Error::InvalidArgs(format!("identity not found: {id}"))
        }
        EngineError::Pipeline(PipelineError::Store(e)) => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

#[interface(name = "org.freedesktop.Roster1")]
impl RosterInterface {
    /// Enroll a new identity from named pose images. Returns a JSON report
    /// with the per-pose outcome.
    async fn enroll_identity(
        &self,
        id: &str,
        name: &str,
        email: &str,
        poses: HashMap<String, Vec<u8>>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(id, poses = poses.len(), "EnrollIdentity requested");
        if id.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("identity id must not be empty".into()));
        }

        let mut decoded = Vec::with_capacity(poses.len());
        let mut names: Vec<&String> = poses.keys().collect();
        names.sort();
        for pose in names {
            decoded.push((pose.clone(), decode_image(&poses[pose], pose)?));
        }

        let fields = ProfileFields {
            name: name.to_string(),
            email: non_empty(email),
        };
        let report = self
            .engine
            .enroll(id.to_string(), fields, decoded)
            .await
            .map_err(map_error)?;
        to_json(&report)
    }

    /// Add to or replace an identity's images. `mode` is "add" or "replace";
    /// name and email only apply on replace and are ignored when empty.
    async fn update_identity(
        &self,
        id: &str,
        mode: &str,
        images: Vec<Vec<u8>>,
        name: &str,
        email: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(id, mode, images = images.len(), "UpdateIdentity requested");
        let mode: UpdateMode = mode
            .parse()
            .map_err(|e: StoreError| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

        let decoded = images
            .iter()
            .enumerate()
            .map(|(i, bytes)| decode_image(bytes, &format!("image #{i}")))
            .collect::<zbus::fdo::Result<Vec<_>>>()?;

        let update = ProfileUpdate {
            name: non_empty(name),
            email: non_empty(email),
        };
        let report = self
            .engine
            .update(id.to_string(), decoded, mode, update)
            .await
            .map_err(map_error)?;
        to_json(&report)
    }

    /// Remove an identity. Returns whether it existed.
    async fn delete_identity(&self, id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "DeleteIdentity requested");
        self.engine.delete(id.to_string()).await.map_err(map_error)
    }

    /// Recognize every face in an encoded image. Returns a JSON list.
    async fn recognize_face(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        let frame = decode_image(&image, "frame")?;
        tracing::debug!(width = frame.width(), height = frame.height(), "RecognizeFace requested");
        let results = self.engine.recognize(frame).await.map_err(map_error)?;
        to_json(&results)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(map_error)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "model_published": self.slot.snapshot().is_some(),
            "service": status,
        })
        .to_string())
    }

    /// List enrolled identities.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let identities = self.engine.list().await.map_err(map_error)?;
        to_json(&identities)
    }
}
