use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::profiles::{default_config_dir, StoreError};

pub const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    ConfigDir(#[from] StoreError),
    #[error("failed to read settings at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub query_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub reachability_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Rows per table browse; 0 means unlimited.
    pub preview_limit: usize,
    pub cell_preview_runes: usize,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            query_timeout_secs: 30,
            probe_timeout_secs: 5,
            reachability_timeout_secs: 3,
            connect_timeout_secs: 5,
            preview_limit: 100,
            cell_preview_runes: 100,
            log_filter: "info".to_string(),
        }
    }
}

impl Settings {
    /// Loads `settings.toml` from the config directory, or defaults when absent.
    pub fn load_default() -> Result<Self, SettingsError> {
        Self::load_from_path(default_config_dir()?.join(SETTINGS_FILE))
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    #[must_use]
    pub fn timeouts(&self) -> Timeouts {
        let secs = |value: u64| Duration::from_secs(value.max(1));
        Timeouts {
            connect: secs(self.connect_timeout_secs),
            probe: secs(self.probe_timeout_secs),
            query: secs(self.query_timeout_secs),
            reachability: secs(self.reachability_timeout_secs),
        }
    }
}

/// Deadlines applied to every bounded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub probe: Duration,
    pub query: Duration,
    pub reachability: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Settings::default().timeouts()
    }
}
