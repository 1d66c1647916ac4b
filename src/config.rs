//! Engine configuration.
//!
//! Loaded from `.maverick/config.yaml` under the project root when present:
//!
//! ```yaml
//! checkpoint_dir: .maverick/checkpoints
//! clear_checkpoints_on_success: true
//! max_retry_delay_secs: 30
//! values:
//!   model: sonnet
//! ```
//!
//! `values` are what `${{ config.* }}` expressions see.

use crate::step::MAX_RETRY_DELAY_SECS;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Config file location relative to the project root.
pub const CONFIG_FILE: &str = ".maverick/config.yaml";

/// Overrides `checkpoint_dir`.
pub const CHECKPOINT_DIR_ENV: &str = "MAVERICK_CHECKPOINT_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the file checkpoint store
    pub checkpoint_dir: PathBuf,

    /// Remove a run's checkpoints once it completes successfully
    pub clear_checkpoints_on_success: bool,

    /// Upper bound on retry delays; values above 60 have no effect
    pub max_retry_delay_secs: f64,

    /// Values exposed to `${{ config.* }}`
    pub values: Map<String, Value>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from(".maverick/checkpoints"),
            clear_checkpoints_on_success: true,
            max_retry_delay_secs: MAX_RETRY_DELAY_SECS,
            values: Map::new(),
        }
    }
}

impl EngineConfig {
    /// Parse a config document. Missing fields take their defaults.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// Load a config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `<root>/.maverick/config.yaml`, apply environment overrides and
    /// anchor a relative `checkpoint_dir` at `root`.
    pub fn load_for_project(root: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(&root.join(CONFIG_FILE))?
            .with_env_overrides(|key| std::env::var(key).ok());
        if config.checkpoint_dir.is_relative() {
            config.checkpoint_dir = root.join(&config.checkpoint_dir);
        }
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(CHECKPOINT_DIR_ENV).filter(|d| !d.is_empty()) {
            self.checkpoint_dir = PathBuf::from(dir);
        }
        self
    }

    /// Effective retry delay cap.
    pub fn max_retry_delay(&self) -> Duration {
        let secs = self.max_retry_delay_secs;
        if secs.is_finite() && secs >= 0.0 {
            Duration::from_secs_f64(secs.min(MAX_RETRY_DELAY_SECS))
        } else {
            Duration::from_secs_f64(MAX_RETRY_DELAY_SECS)
        }
    }
}
