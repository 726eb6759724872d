//! Runtime configuration shared by the daemon and the CLI.
//!
//! Values come from an optional TOML file, then `ATTENDANCE_*` environment
//! variables override individual fields.

use crate::capture::CaptureOptions;
use crate::store::DataLayout;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "ATTENDANCE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "attendance.toml";
const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root of the registry, ledgers, samples and trained model.
    pub data_dir: PathBuf,
    /// V4L2 device path.
    pub camera_device: String,
    /// Directory containing the SCRFD detection model.
    pub model_dir: PathBuf,
    /// Daemon bind address.
    pub listen_addr: String,
    /// Samples collected per registration.
    pub capture_limit: usize,
    /// Minimum milliseconds between two registration samples.
    pub capture_interval_ms: u64,
    /// Frames discarded after opening the camera while exposure settles.
    pub warmup_frames: usize,
    /// Password for the bulk clear. Unset disables the operation.
    pub danger_secret: Option<String>,
    /// TrueType font for frame labels. Unset falls back to a system font.
    pub label_font: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            camera_device: "/dev/video0".to_string(),
            model_dir: PathBuf::from("models"),
            listen_addr: "0.0.0.0:8000".to_string(),
            capture_limit: 30,
            capture_interval_ms: 200,
            warmup_frames: 0,
            danger_secret: None,
            label_font: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("data_dir", &self.data_dir)
            .field("camera_device", &self.camera_device)
            .field("model_dir", &self.model_dir)
            .field("listen_addr", &self.listen_addr)
            .field("capture_limit", &self.capture_limit)
            .field("capture_interval_ms", &self.capture_interval_ms)
            .field("warmup_frames", &self.warmup_frames)
            .field("danger_secret", &self.danger_secret.as_ref().map(|_| "<redacted>"))
            .field("label_font", &self.label_font)
            .finish()
    }
}

/// Outcome of checking a bulk-clear password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretCheck {
    Accepted,
    Rejected,
    /// No secret is configured.
    Disabled,
}

impl Config {
    /// Load the config file named by `ATTENDANCE_CONFIG` (or `attendance.toml`
    /// if present), then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match explicit {
            Some(path) if !path.exists() => return Err(ConfigError::NotFound(path)),
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    /// Override fields from `ATTENDANCE_*` variables as resolved by `var`.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("ATTENDANCE_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ATTENDANCE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("ATTENDANCE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ATTENDANCE_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        self.capture_limit = env_parsed(&var, "ATTENDANCE_CAPTURE_LIMIT", self.capture_limit);
        self.capture_interval_ms =
            env_parsed(&var, "ATTENDANCE_CAPTURE_INTERVAL_MS", self.capture_interval_ms);
        self.warmup_frames = env_parsed(&var, "ATTENDANCE_WARMUP_FRAMES", self.warmup_frames);
        if let Some(v) = var("ATTENDANCE_LABEL_FONT") {
            self.label_font = Some(PathBuf::from(v)).filter(|p| !p.as_os_str().is_empty());
        }
        if let Some(v) = var("ATTENDANCE_DANGER_SECRET") {
            self.danger_secret = Some(v).filter(|s| !s.is_empty());
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(SCRFD_MODEL_FILE)
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::new(&self.data_dir)
    }

    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            limit: self.capture_limit,
            min_interval: Duration::from_millis(self.capture_interval_ms),
        }
    }

    /// Check `candidate` against the configured secret in constant time.
    pub fn verify_danger_secret(&self, candidate: &str) -> SecretCheck {
        let Some(secret) = self.danger_secret.as_deref() else {
            return SecretCheck::Disabled;
        };
        let expected = Sha256::digest(secret.as_bytes());
        let given = Sha256::digest(candidate.as_bytes());
        let diff = expected
            .iter()
            .zip(given.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff == 0 {
            SecretCheck::Accepted
        } else {
            SecretCheck::Rejected
        }
    }
}

fn env_parsed<T, F>(var: &F, key: &str, current: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "ignoring unparsable environment override");
            current
        }),
        None => current,
    }
}
