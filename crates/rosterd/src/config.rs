//! Daemon configuration: defaults, then an optional TOML file, then
//! `ROSTER_*` environment variables.

use roster_core::attendance::DEFAULT_LATE_CUTOFF_HOUR;
use roster_core::enrollment::{
    DEFAULT_MAX_CENTER_OFFSET, DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_MIN_FACE_AREA_RATIO,
};
use roster_core::matcher::{DEFAULT_MATCH_THRESHOLD, DEFAULT_MIN_CONFIDENCE};
use roster_core::{CapturePolicy, MatchPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/roster/rosterd.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("{key}={value:?} is not a valid value")]
    Env { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which message bus the service is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(BusKind::System),
            "session" => Ok(BusKind::Session),
            other => Err(format!("unknown bus '{other}'")),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path, or a directory of still images.
    pub camera_device: String,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub bus: BusKind,
    /// Euclidean distance below which a match can be accepted.
    pub match_threshold: f32,
    /// Minimum confidence percentage for an accepted match.
    pub min_confidence: u8,
    /// Kiosk polling period.
    pub poll_interval_ms: u64,
    /// Check-ins at or after this local hour are late.
    pub late_cutoff_hour: u32,
    /// Cap on each serialized descriptor payload.
    pub max_payload_bytes: usize,
    pub min_face_area_ratio: f32,
    pub max_center_offset: f32,
    /// Frames discarded at startup so auto-exposure can settle.
    pub warmup_frames: usize,
    /// Quality of stored snapshots and profile images.
    pub jpeg_quality: u8,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("roster");

        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: roster_core::default_model_dir(),
            db_path: data_dir.join("attendance.db"),
            bus: BusKind::System,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            poll_interval_ms: 100,
            late_cutoff_hour: DEFAULT_LATE_CUTOFF_HOUR,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            min_face_area_ratio: DEFAULT_MIN_FACE_AREA_RATIO,
            max_center_offset: DEFAULT_MAX_CENTER_OFFSET,
            warmup_frames: 4,
            jpeg_quality: 85,
        }
    }
}

impl Config {
    /// Load from `ROSTER_CONFIG` (or the default path), then apply
    /// `ROSTER_*` overrides and validate.
    ///
    /// A missing file at the default path is not an error; a missing file
    /// named explicitly by `ROSTER_CONFIG` is.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var("ROSTER_CONFIG").ok();
        let path = PathBuf::from(explicit.as_deref().unwrap_or(DEFAULT_CONFIG_PATH));

        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml(&text, &path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Overlay `ROSTER_*` variables as returned by `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("ROSTER_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("ROSTER_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROSTER_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        env_parse(&lookup, "ROSTER_BUS", &mut self.bus)?;
        env_parse(&lookup, "ROSTER_MATCH_THRESHOLD", &mut self.match_threshold)?;
        env_parse(&lookup, "ROSTER_MIN_CONFIDENCE", &mut self.min_confidence)?;
        env_parse(&lookup, "ROSTER_POLL_INTERVAL_MS", &mut self.poll_interval_ms)?;
        env_parse(&lookup, "ROSTER_LATE_CUTOFF_HOUR", &mut self.late_cutoff_hour)?;
        env_parse(&lookup, "ROSTER_MAX_PAYLOAD_BYTES", &mut self.max_payload_bytes)?;
        env_parse(&lookup, "ROSTER_MIN_FACE_AREA_RATIO", &mut self.min_face_area_ratio)?;
        env_parse(&lookup, "ROSTER_MAX_CENTER_OFFSET", &mut self.max_center_offset)?;
        env_parse(&lookup, "ROSTER_WARMUP_FRAMES", &mut self.warmup_frames)?;
        env_parse(&lookup, "ROSTER_JPEG_QUALITY", &mut self.jpeg_quality)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.camera_device.trim().is_empty() {
            return invalid("camera_device must not be empty".into());
        }
        if !(self.match_threshold > 0.0 && self.match_threshold <= 2.0) {
            return invalid(format!("match_threshold {} is outside (0, 2]", self.match_threshold));
        }
        if self.min_confidence > 100 {
            return invalid(format!("min_confidence {} exceeds 100", self.min_confidence));
        }
        if self.poll_interval_ms < 10 {
            return invalid(format!("poll_interval_ms {} is below 10", self.poll_interval_ms));
        }
        if self.late_cutoff_hour > 23 {
            return invalid(format!("late_cutoff_hour {} is not an hour of day", self.late_cutoff_hour));
        }
        if self.max_payload_bytes == 0 {
            return invalid("max_payload_bytes must be positive".into());
        }
        if !(self.min_face_area_ratio > 0.0 && self.min_face_area_ratio < 1.0) {
            return invalid(format!(
                "min_face_area_ratio {} is outside (0, 1)",
                self.min_face_area_ratio
            ));
        }
        if !(self.max_center_offset > 0.0 && self.max_center_offset <= 0.5) {
            return invalid(format!(
                "max_center_offset {} is outside (0, 0.5]",
                self.max_center_offset
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return invalid(format!("jpeg_quality {} is outside 1..=100", self.jpeg_quality));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(roster_core::DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the SFace recognition model.
    pub fn recognizer_model_path(&self) -> String {
        self.model_dir
            .join(roster_core::RECOGNIZER_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            threshold: self.match_threshold,
            min_confidence: self.min_confidence,
        }
    }

    pub fn capture_policy(&self) -> CapturePolicy {
        CapturePolicy {
            min_face_area_ratio: self.min_face_area_ratio,
            max_center_offset: self.max_center_offset,
        }
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }
}

fn env_parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(key) {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Env { key, value })?;
    }
    Ok(())
}
