use roster_core::PipelineConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables and an optional
/// TOML file of pipeline parameters.
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub bus: BusKind,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from `ROSTER_*` environment variables with defaults.
    ///
    /// `ROSTER_CONFIG` names a TOML file whose keys fill `PipelineConfig`;
    /// individual `ROSTER_*` variables then override it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("roster");

        let model_dir = std::env::var("ROSTER_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let db_path = std::env::var("ROSTER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("roster.db"));

        let bus = match std::env::var("ROSTER_BUS") {
            Ok(v) => parse_bus(&v)?,
            Err(_) => BusKind::Session,
        };

        let mut pipeline = match std::env::var("ROSTER_CONFIG") {
            Ok(path) => load_pipeline(Path::new(&path))?,
            Err(_) => PipelineConfig::default(),
        };
        apply_env_overrides(&mut pipeline, |key| std::env::var(key).ok())?;

        Ok(Self {
            model_dir,
            db_path,
            bus,
            pipeline,
        })
    }

    /// Path to the SSD face detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_path("face-detection.onnx")
    }

    /// Path to the 35-point landmark model.
    pub fn landmarks_model_path(&self) -> String {
        self.model_path("landmarks-35.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_path("arcface.onnx")
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }
}

fn parse_bus(value: &str) -> Result<BusKind, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "session" => Ok(BusKind::Session),
        "system" => Ok(BusKind::System),
        _ => Err(ConfigError::InvalidValue {
            key: "ROSTER_BUS",
            value: value.to_string(),
        }),
    }
}

fn load_pipeline(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let path_display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path_display.clone(),
        source,
    })?;
    let pipeline = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path_display.clone(),
        source,
    })?;
    tracing::info!(path = %path_display, "loaded pipeline config");
    Ok(pipeline)
}

/// Apply `ROSTER_*` overrides through `lookup`, so tests need not touch the
/// process environment.
fn apply_env_overrides(
    pipeline: &mut PipelineConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(v) = env_parse(&lookup, "ROSTER_REQUIRED_POSE_COUNT")? {
        pipeline.required_pose_count = v;
    }
    if let Some(v) = env_parse(&lookup, "ROSTER_DETECTION_CONFIDENCE")? {
        pipeline.detection_confidence = v;
    }
    if let Some(v) = env_parse(&lookup, "ROSTER_RECOGNITION_THRESHOLD")? {
        pipeline.recognition_threshold = v;
    }
    if let Some(v) = env_parse(&lookup, "ROSTER_EMBEDDING_DIM")? {
        pipeline.embedding_dim = v;
    }
    if let Some(v) = env_parse(&lookup, "ROSTER_NOVELTY_SIMILARITY")? {
        pipeline.novelty_similarity = v;
    }
    if let Some(v) = lookup("ROSTER_MIRROR_ENROLLMENT") {
        pipeline.mirror_enrollment_images = v != "0";
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_overrides_apply() {
        let mut pipeline = PipelineConfig::default();
        apply_env_overrides(
            &mut pipeline,
            lookup(&[
                ("ROSTER_REQUIRED_POSE_COUNT", "7"),
                ("ROSTER_RECOGNITION_THRESHOLD", "0.8"),
                ("ROSTER_MIRROR_ENROLLMENT", "1"),
            ]),
        )
        .unwrap();
        assert_eq!(pipeline.required_pose_count, 7);
        assert_eq!(pipeline.recognition_threshold, 0.8);
        assert!(pipeline.mirror_enrollment_images);
        assert_eq!(pipeline.detection_confidence, 0.5);
    }

    #[test]
    fn test_bad_override_is_an_error() {
        let mut pipeline = PipelineConfig::default();
        let err = apply_env_overrides(&mut pipeline, lookup(&[("ROSTER_EMBEDDING_DIM", "wide")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "ROSTER_EMBEDDING_DIM", .. }));
    }

    #[test]
    fn test_toml_pipeline_with_defaults() {
        let pipeline: PipelineConfig = toml::from_str(
            "required_pose_count = 9\n\n[training]\nallow_single_identity = false\n",
        )
        .unwrap();
        assert_eq!(pipeline.required_pose_count, 9);
        assert!(!pipeline.training.allow_single_identity);
        assert_eq!(pipeline.training.iterations, 300);
        assert_eq!(pipeline.face_size, 112);
    }

    #[test]
    fn test_parse_bus() {
        assert_eq!(parse_bus("System").unwrap(), BusKind::System);
        assert_eq!(parse_bus("session").unwrap(), BusKind::Session);
        assert!(parse_bus("tcp").is_err());
    }
}
