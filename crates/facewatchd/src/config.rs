use crate::pipeline::{ExhaustedAction, FailurePolicy};
use facewatch_hw::SourceConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// When to reload the reference store during an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadMode {
    /// Once after all samples, if anything was saved.
    #[default]
    Batched,
    /// After every saved sample.
    PerImage,
}

impl FromStr for ReloadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "batched" => Ok(ReloadMode::Batched),
            "per_image" | "per-image" => Ok(ReloadMode::PerImage),
            other => Err(format!("unknown reload mode {other:?}")),
        }
    }
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file named by
/// `FACEWATCH_CONFIG`, then `FACEWATCH_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Reference and enrollment root (`<faces_dir>/<person>/NNN.jpg`).
    pub faces_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Ordered camera candidates tried at connect time.
    pub camera_devices: Vec<String>,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Identifier served at `/video_feed/{camera_id}`.
    pub camera_id: String,
    /// Cosine similarity threshold for a known match.
    pub similarity_threshold: f32,
    /// SCRFD score threshold.
    pub detection_confidence: f32,
    pub max_read_failures: u32,
    pub on_read_exhausted: ExhaustedAction,
    pub max_reconnects: u32,
    pub jpeg_quality: u8,
    pub listen_addr: String,
    pub enroll_frames: usize,
    pub enroll_interval: Duration,
    pub reload_mode: ReloadMode,
    /// SQLite file for detection records.
    pub db_path: PathBuf,
    /// Minimum spacing between two records of the same person.
    pub record_cooldown: Duration,
    /// Optional TTF/OTF font for label text.
    pub font_path: Option<PathBuf>,
}

/// TOML file layer. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    faces_dir: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    camera_devices: Option<Vec<String>>,
    camera_width: Option<u32>,
    camera_height: Option<u32>,
    camera_id: Option<String>,
    similarity_threshold: Option<f32>,
    detection_confidence: Option<f32>,
    max_read_failures: Option<u32>,
    on_read_exhausted: Option<ExhaustedAction>,
    max_reconnects: Option<u32>,
    jpeg_quality: Option<u8>,
    listen_addr: Option<String>,
    enroll_frames: Option<usize>,
    enroll_interval_ms: Option<u64>,
    reload_mode: Option<ReloadMode>,
    db_path: Option<PathBuf>,
    record_cooldown_secs: Option<u64>,
    font_path: Option<PathBuf>,
}

/// `$XDG_DATA_HOME/facewatch`, falling back to `~/.local/share/facewatch`.
fn data_dir_from(env: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facewatch")
}

impl Config {
    fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            faces_dir: data_dir.join("faces"),
            model_dir: data_dir.join("models"),
            camera_devices: vec![
                "/dev/video0".to_string(),
                "/dev/video1".to_string(),
                "/dev/video2".to_string(),
            ],
            camera_width: 640,
            camera_height: 480,
            camera_id: "cam1".to_string(),
            similarity_threshold: 0.7,
            detection_confidence: facewatch_core::detector::DEFAULT_CONFIDENCE_THRESHOLD,
            max_read_failures: 20,
            on_read_exhausted: ExhaustedAction::Terminate,
            max_reconnects: 3,
            jpeg_quality: 80,
            listen_addr: "0.0.0.0:5001".to_string(),
            enroll_frames: 8,
            enroll_interval: Duration::from_millis(250),
            reload_mode: ReloadMode::Batched,
            db_path: data_dir.join("detections.db"),
            record_cooldown: Duration::from_secs(30),
            font_path: None,
        }
    }

    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_sources(&|key| std::env::var(key).ok())
    }

    fn from_sources(env: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::with_data_dir(&data_dir_from(env));

        if let Some(path) = env("FACEWATCH_CONFIG").map(PathBuf::from) {
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
            config.apply_file(file)?;
            tracing::debug!(path = %path.display(), "config file applied");
        }

        config.apply_env(env);
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        if let Some(t) = file.similarity_threshold {
            if !threshold_in_range(t) {
                return Err(ConfigError::Invalid {
                    key: "similarity_threshold",
                    reason: format!("{t} is outside [-1, 1]"),
                });
            }
            self.similarity_threshold = t;
        }
        if let Some(devices) = file.camera_devices {
            self.camera_devices = devices;
        }
        if let Some(q) = file.jpeg_quality {
            if !(1..=100).contains(&q) {
                return Err(ConfigError::Invalid {
                    key: "jpeg_quality",
                    reason: format!("{q} is outside 1..=100"),
                });
            }
            self.jpeg_quality = q;
        }

        set(&mut self.faces_dir, file.faces_dir);
        set(&mut self.model_dir, file.model_dir);
        set(&mut self.camera_width, file.camera_width);
        set(&mut self.camera_height, file.camera_height);
        set(&mut self.camera_id, file.camera_id);
        set(&mut self.detection_confidence, file.detection_confidence);
        set(&mut self.max_read_failures, file.max_read_failures);
        set(&mut self.on_read_exhausted, file.on_read_exhausted);
        set(&mut self.max_reconnects, file.max_reconnects);
        set(&mut self.listen_addr, file.listen_addr);
        set(&mut self.enroll_frames, file.enroll_frames);
        set(&mut self.enroll_interval, file.enroll_interval_ms.map(Duration::from_millis));
        set(&mut self.reload_mode, file.reload_mode);
        set(&mut self.db_path, file.db_path);
        set(&mut self.record_cooldown, file.record_cooldown_secs.map(Duration::from_secs));
        if file.font_path.is_some() {
            self.font_path = file.font_path;
        }
        Ok(())
    }

    fn apply_env(&mut self, env: &dyn Fn(&str) -> Option<String>) {
        if let Some(dir) = env("FACEWATCH_FACES_DIR") {
            self.faces_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env("FACEWATCH_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(list) = env("FACEWATCH_CAMERA_DEVICES") {
            self.camera_devices = list
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(id) = env("FACEWATCH_CAMERA_ID") {
            self.camera_id = id;
        }
        if let Some(addr) = env("FACEWATCH_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(path) = env("FACEWATCH_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(path) = env("FACEWATCH_FONT_PATH") {
            self.font_path = Some(PathBuf::from(path)).filter(|p| !p.as_os_str().is_empty());
        }

        self.camera_width = env_parse(env, "FACEWATCH_CAMERA_WIDTH", self.camera_width);
        self.camera_height = env_parse(env, "FACEWATCH_CAMERA_HEIGHT", self.camera_height);
        self.detection_confidence =
            env_parse(env, "FACEWATCH_DETECTION_CONFIDENCE", self.detection_confidence);
        self.max_read_failures =
            env_parse(env, "FACEWATCH_MAX_READ_FAILURES", self.max_read_failures);
        self.on_read_exhausted =
            env_parse(env, "FACEWATCH_ON_READ_EXHAUSTED", self.on_read_exhausted);
        self.max_reconnects = env_parse(env, "FACEWATCH_MAX_RECONNECTS", self.max_reconnects);
        self.enroll_frames = env_parse(env, "FACEWATCH_ENROLL_FRAMES", self.enroll_frames);
        self.reload_mode = env_parse(env, "FACEWATCH_RELOAD_MODE", self.reload_mode);
        self.enroll_interval = Duration::from_millis(env_parse(
            env,
            "FACEWATCH_ENROLL_INTERVAL_MS",
            self.enroll_interval.as_millis() as u64,
        ));
        self.record_cooldown = Duration::from_secs(env_parse(
            env,
            "FACEWATCH_RECORD_COOLDOWN_SECS",
            self.record_cooldown.as_secs(),
        ));

        let threshold = env_parse(env, "FACEWATCH_SIMILARITY_THRESHOLD", self.similarity_threshold);
        if threshold_in_range(threshold) {
            self.similarity_threshold = threshold;
        } else {
            tracing::warn!(
                key = "FACEWATCH_SIMILARITY_THRESHOLD",
                value = threshold,
                "threshold outside [-1, 1]; using default"
            );
        }

        let quality = env_parse(env, "FACEWATCH_JPEG_QUALITY", self.jpeg_quality);
        if (1..=100).contains(&quality) {
            self.jpeg_quality = quality;
        } else {
            tracing::warn!(
                key = "FACEWATCH_JPEG_QUALITY",
                value = quality,
                "quality outside 1..=100; using default"
            );
        }
    }

    /// Camera candidates in configured order.
    pub fn candidates(&self) -> Vec<SourceConfig> {
        self.camera_devices
            .iter()
            .map(|device| SourceConfig {
                device: device.clone(),
                width: self.camera_width,
                height: self.camera_height,
            })
            .collect()
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy {
            max_consecutive_failures: self.max_read_failures,
            on_exhausted: self.on_read_exhausted,
            max_reconnects: self.max_reconnects,
            ..FailurePolicy::default()
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn threshold_in_range(t: f32) -> bool {
    (-1.0..=1.0).contains(&t)
}

fn env_parse<T: FromStr>(env: &dyn Fn(&str) -> Option<String>, key: &'static str, default: T) -> T {
    match env(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "unparseable config value; using default");
                default
            }
        },
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
        let config = Config::from_sources(&env_of(&[("XDG_DATA_HOME", "/data")])).unwrap();
        assert_eq!(config.faces_dir, PathBuf::from("/data/facewatch/faces"));
        assert_eq!(config.db_path, PathBuf::from("/data/facewatch/detections.db"));
        assert_eq!(config.similarity_threshold, 0.7);
        assert_eq!(config.max_read_failures, 20);
        assert_eq!(config.on_read_exhausted, ExhaustedAction::Terminate);
        assert_eq!(config.reload_mode, ReloadMode::Batched);
        assert_eq!(config.enroll_frames, 8);
        assert_eq!(config.enroll_interval, Duration::from_millis(250));
        assert_eq!(config.candidates().len(), 3);
        assert_eq!(config.candidates()[0].device, "/dev/video0");
        assert!(config.font_path.is_none());
    }

    #[test]
    fn test_data_dir_falls_back_to_home() {
        let dir = data_dir_from(&env_of(&[("HOME", "/home/op")]));
        assert_eq!(dir, PathBuf::from("/home/op/.local/share/facewatch"));
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_sources(&env_of(&[
            ("FACEWATCH_SIMILARITY_THRESHOLD", "0.55"),
            ("FACEWATCH_CAMERA_DEVICES", "/dev/video4, /dev/video5,"),
            ("FACEWATCH_ON_READ_EXHAUSTED", "reconnect"),
            ("FACEWATCH_RELOAD_MODE", "per_image"),
            ("FACEWATCH_ENROLL_INTERVAL_MS", "100"),
        ]))
        .unwrap();
        assert_eq!(config.similarity_threshold, 0.55);
        assert_eq!(config.camera_devices, vec!["/dev/video4", "/dev/video5"]);
        assert_eq!(config.on_read_exhausted, ExhaustedAction::Reconnect);
        assert_eq!(config.reload_mode, ReloadMode::PerImage);
        assert_eq!(config.enroll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_invalid_env_falls_back() {
        let config = Config::from_sources(&env_of(&[
            ("FACEWATCH_SIMILARITY_THRESHOLD", "1.5"),
            ("FACEWATCH_MAX_READ_FAILURES", "many"),
            ("FACEWATCH_ON_READ_EXHAUSTED", "explode"),
        ]))
        .unwrap();
        assert_eq!(config.similarity_threshold, 0.7);
        assert_eq!(config.max_read_failures, 20);
        assert_eq!(config.on_read_exhausted, ExhaustedAction::Terminate);
    }

    #[test]
    fn test_file_layer_under_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facewatch.toml");
        std::fs::write(
            &path,
            r#"
faces_dir = "/srv/faces"
similarity_threshold = 0.6
max_read_failures = 5
on_read_exhausted = "reconnect"
reload_mode = "per_image"
"#,
        )
        .unwrap();

        let path_str = path.to_string_lossy().into_owned();
        let config = Config::from_sources(&env_of(&[
            ("FACEWATCH_CONFIG", path_str.as_str()),
            ("FACEWATCH_MAX_READ_FAILURES", "9"),
        ]))
        .unwrap();
        assert_eq!(config.faces_dir, PathBuf::from("/srv/faces"));
        assert_eq!(config.similarity_threshold, 0.6);
        assert_eq!(config.max_read_failures, 9);
        assert_eq!(config.on_read_exhausted, ExhaustedAction::Reconnect);
        assert_eq!(config.reload_mode, ReloadMode::PerImage);
    }

    #[test]
    fn test_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");

        std::fs::write(&path, "similarity_threshold = 2.0\n").unwrap();
        let p = path.to_string_lossy().into_owned();
        assert!(matches!(
            Config::from_sources(&env_of(&[("FACEWATCH_CONFIG", p.as_str())])),
            Err(ConfigError::Invalid { key: "similarity_threshold", .. })
        ));

        std::fs::write(&path, "on_read_exhausted = \"explode\"\n").unwrap();
        assert!(matches!(
            Config::from_sources(&env_of(&[("FACEWATCH_CONFIG", p.as_str())])),
            Err(ConfigError::Parse { .. })
        ));

        std::fs::write(&path, "no_such_key = 1\n").unwrap();
        assert!(matches!(
            Config::from_sources(&env_of(&[("FACEWATCH_CONFIG", p.as_str())])),
            Err(ConfigError::Parse { .. })
        ));

        let missing = dir.path().join("missing.toml").to_string_lossy().into_owned();
        assert!(matches!(
            Config::from_sources(&env_of(&[("FACEWATCH_CONFIG", missing.as_str())])),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_model_paths() {
        let config = Config::from_sources(&env_of(&[("FACEWATCH_MODEL_DIR", "/models")])).unwrap();
        assert_eq!(config.scrfd_model_path(), PathBuf::from("/models/det_10g.onnx"));
        assert_eq!(config.arcface_model_path(), PathBuf::from("/models/w600k_r50.onnx"));
    }
}
