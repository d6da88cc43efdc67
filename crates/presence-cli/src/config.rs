use anyhow::{Context, Result};
use presence_core::{DetectorParams, ExtractorConfig, DEFAULT_MATCH_THRESHOLD};
use presence_session::ControllerOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";
const EMBEDDING_FILE: &str = "openface.onnx";

/// Runtime configuration: defaults, then `$PRESENCE_CONFIG` (TOML), then
/// `PRESENCE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory holding the cascade and the optional embedding model.
    pub model_dir: PathBuf,
    /// OpenCV Haar cascade; defaults to `haarcascade_frontalface_default.xml`
    /// in the model dir.
    pub cascade_path: PathBuf,
    /// Embedding network; defaults to `openface.onnx` in the model dir.
    /// A missing file selects histogram mode.
    pub embedding_model: PathBuf,
    pub embedding_input_size: usize,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Where enrollment photos are kept.
    pub photo_dir: PathBuf,
    /// Euclidean distance threshold, embedding mode only.
    pub match_threshold: f32,
    /// Run detection on every Nth frame.
    pub throttle: u32,
    pub stop_grace_ms: u64,
    pub scale_factor: f64,
    pub min_neighbors: u32,
    /// Smallest face side in pixels.
    pub min_face_size: u32,
    /// Latest annotated frame is written here during a session, if set.
    pub preview_path: Option<PathBuf>,
}

/// Optional overrides read from the TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub camera_device: Option<String>,
    pub model_dir: Option<PathBuf>,
    pub cascade_path: Option<PathBuf>,
    pub embedding_model: Option<PathBuf>,
    pub embedding_input_size: Option<usize>,
    pub db_path: Option<PathBuf>,
    pub photo_dir: Option<PathBuf>,
    pub match_threshold: Option<f32>,
    pub throttle: Option<u32>,
    pub stop_grace_ms: Option<u64>,
    pub scale_factor: Option<f64>,
    pub min_neighbors: Option<u32>,
    pub min_face_size: Option<u32>,
    pub preview_path: Option<PathBuf>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self> {
        let file = match std::env::var("PRESENCE_CONFIG") {
            Ok(path) => FileConfig::read(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    /// Merge a file config with variables looked up through `env`.
    pub fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("presence");

        let model_dir = env_path(&env, "PRESENCE_MODEL_DIR")
            .or(file.model_dir)
            .unwrap_or_else(|| data_dir.join("models"));

        let cascade_path = env_path(&env, "PRESENCE_CASCADE_PATH")
            .or(file.cascade_path)
            .unwrap_or_else(|| model_dir.join(CASCADE_FILE));
        let embedding_model = env_path(&env, "PRESENCE_EMBEDDING_MODEL")
            .or(file.embedding_model)
            .unwrap_or_else(|| model_dir.join(EMBEDDING_FILE));

        Self {
            camera_device: env("PRESENCE_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            cascade_path,
            embedding_model,
            embedding_input_size: env_parse(&env, "PRESENCE_EMBEDDING_INPUT_SIZE")
                .or(file.embedding_input_size)
                .unwrap_or(96),
            db_path: env_path(&env, "PRESENCE_DB_PATH")
                .or(file.db_path)
                .unwrap_or_else(|| data_dir.join("attendance.db")),
            photo_dir: env_path(&env, "PRESENCE_PHOTO_DIR")
                .or(file.photo_dir)
                .unwrap_or_else(|| data_dir.join("photos")),
            match_threshold: env_parse(&env, "PRESENCE_MATCH_THRESHOLD")
                .or(file.match_threshold)
                .unwrap_or(DEFAULT_MATCH_THRESHOLD),
            throttle: env_parse(&env, "PRESENCE_THROTTLE")
                .or(file.throttle)
                .unwrap_or(5),
            stop_grace_ms: env_parse(&env, "PRESENCE_STOP_GRACE_MS")
                .or(file.stop_grace_ms)
                .unwrap_or(1000),
            scale_factor: env_parse(&env, "PRESENCE_SCALE_FACTOR")
                .or(file.scale_factor)
                .unwrap_or(1.1),
            min_neighbors: env_parse(&env, "PRESENCE_MIN_NEIGHBORS")
                .or(file.min_neighbors)
                .unwrap_or(5),
            min_face_size: env_parse(&env, "PRESENCE_MIN_FACE_SIZE")
                .or(file.min_face_size)
                .unwrap_or(30),
            preview_path: env_path(&env, "PRESENCE_PREVIEW_PATH").or(file.preview_path),
            model_dir,
        }
    }

    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            cascade_path: self.cascade_path.clone(),
            embedding_model: Some(self.embedding_model.clone()).filter(|p| p.exists()),
            embedding_input_size: self.embedding_input_size,
            detector: DetectorParams {
                scale_factor: self.scale_factor,
                min_neighbors: self.min_neighbors,
                min_size: (self.min_face_size, self.min_face_size),
            },
            match_threshold: self.match_threshold,
        }
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            throttle: self.throttle,
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            ..ControllerOptions::default()
        }
    }
}

fn env_path(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<PathBuf> {
    env(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// Unparseable values are ignored with a warning.
fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(FileConfig::default(), env_of(&[("HOME", "/home/prof")]));
        let data = PathBuf::from("/home/prof/.local/share/presence");
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!(config.model_dir, data.join("models"));
        assert_eq!(config.cascade_path, data.join("models/haarcascade_frontalface_default.xml"));
        assert_eq!(config.db_path, data.join("attendance.db"));
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.throttle, 5);
        assert_eq!(config.stop_grace_ms, 1000);
        assert_eq!(config.min_neighbors, 5);
        assert_eq!(config.min_face_size, 30);
        assert!(config.preview_path.is_none());
    }

    #[test]
    fn test_env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            model_dir = "/opt/presence/models"
            throttle = 3
            match_threshold = 0.5
            "#,
        )
        .unwrap();
        let config = Config::resolve(
            file,
            env_of(&[("HOME", "/h"), ("PRESENCE_THROTTLE", "8"), ("PRESENCE_MIN_NEIGHBORS", "many")]),
        );

        assert_eq!(config.throttle, 8);
        assert_eq!(config.match_threshold, 0.5);
        // Unparseable env value falls through to the default.
        assert_eq!(config.min_neighbors, 5);
        // Model files follow the configured model dir.
        assert_eq!(config.cascade_path, PathBuf::from("/opt/presence/models/haarcascade_frontalface_default.xml"));
        assert_eq!(config.embedding_model, PathBuf::from("/opt/presence/models/openface.onnx"));
    }

    #[test]
    fn test_file_rejects_unknown_keys() {
        assert!(toml::from_str::<FileConfig>("camera = \"/dev/video1\"").is_err());
    }

    #[test]
    fn test_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presence.toml");
        std::fs::write(&path, "camera_device = \"/dev/video4\"\npreview_path = \"/tmp/p.jpg\"\n").unwrap();

        let config = Config::resolve(FileConfig::read(&path).unwrap(), env_of(&[]));
        assert_eq!(config.camera_device, "/dev/video4");
        assert_eq!(config.preview_path, Some(PathBuf::from("/tmp/p.jpg")));
        assert_eq!(config.controller_options().throttle, 5);
        assert_eq!(config.extractor_config().detector.min_size, (30, 30));
    }
}
