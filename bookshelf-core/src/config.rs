// src/config.rs
// Database configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BookshelfError, Result};

/// Database configuration
///
/// Every field has a default, so a config file only needs the settings it
/// changes. `{}` is an in-memory database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Record log location; `None` keeps everything in memory
    pub path: Option<PathBuf>,
    /// fsync after every write
    pub sync_on_write: bool,
    /// Compact while opening when dead records make up more than this
    /// fraction of the log
    pub compact_on_open_ratio: Option<f64>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: None,
            sync_on_write: false,
            compact_on_open_ratio: None,
        }
    }
}

impl DatabaseConfig {
    /// Create config for an in-memory database
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Create config for a file-backed database
    pub fn at(path: impl Into<PathBuf>) -> Self {
        DatabaseConfig {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Set fsync-per-write
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Set the dead-record ratio that triggers compaction on open
    pub fn with_compact_on_open_ratio(mut self, ratio: f64) -> Self {
        self.compact_on_open_ratio = Some(ratio);
        self
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BookshelfError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: DatabaseConfig = serde_json::from_str(&text)
            .map_err(|e| BookshelfError::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(ratio) = self.compact_on_open_ratio {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(BookshelfError::Config(format!(
                    "compact_on_open_ratio must be in (0, 1], got {}",
                    ratio
                )));
            }
        }
        if self.path.as_ref().map_or(false, |p| p.as_os_str().is_empty()) {
            return Err(BookshelfError::Config("path cannot be empty".to_string()));
        }
        if self.sync_on_write && self.path.is_none() {
            return Err(BookshelfError::Config("sync_on_write requires a path".to_string()));
        }
        Ok(())
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.is_none()
    }
}
