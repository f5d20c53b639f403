//! Settings file and numeric configuration validation.
//!
//! Settings are read from `~/.framecull.json` (or an explicit `--config`
//! path). Command-line flags always win over file values.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SETTINGS_FILE_NAME: &str = ".framecull.json";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("ratio must be in (0, 1], got {0}")]
    InvalidRatio(f64),

    #[error("threshold must not be negative, got {0}")]
    NegativeThreshold(i64),

    #[error("pairwise distance must be in [0, 1], got {0}")]
    InvalidDistance(f64),

    #[error("confidence threshold must be in [0, 1], got {0}")]
    InvalidConfidence(f64),

    #[error("unknown dedup method '{0}' (expected sequential, random or exhaustive)")]
    UnknownMethod(String),

    #[error("unknown dataset format '{0}'")]
    UnknownFormat(String),

    #[error("could not read settings file {path}: {message}")]
    Unreadable { path: PathBuf, message: String },
}

/// Optional defaults shared by all subcommands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub dedup: DedupDefaults,
    pub merge: MergeDefaults,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupDefaults {
    pub method: Option<String>,
    pub threshold: Option<i64>,
    pub ratio: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeDefaults {
    pub quorum: Option<usize>,
    pub pairwise_dist: Option<f64>,
    pub output_conf_thresh: Option<f64>,
}

impl Settings {
    /// Default settings location in the user's home directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(SETTINGS_FILE_NAME))
    }

    /// Load `explicit` if given (it must exist), else the default file if present.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let unreadable = |message: String| ConfigError::Unreadable {
            path: path.to_path_buf(),
            message,
        };
        let content = fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
        let settings = serde_json::from_str(&content).map_err(|e| unreadable(e.to_string()))?;
        log::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }
}

pub fn validate_ratio(ratio: f64) -> Result<f64, ConfigError> {
    if ratio > 0.0 && ratio <= 1.0 {
        Ok(ratio)
    } else {
        Err(ConfigError::InvalidRatio(ratio))
    }
}

pub fn validate_threshold(threshold: i64) -> Result<u32, ConfigError> {
    if threshold < 0 {
        return Err(ConfigError::NegativeThreshold(threshold));
    }
    Ok(u32::try_from(threshold).unwrap_or(u32::MAX))
}

pub fn validate_unit_interval(value: f64, err: fn(f64) -> ConfigError) -> Result<f64, ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(err(value))
    }
}
