//! Runtime settings and configuration management

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Runtime settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Settings {
    /// Capacity of each context's pending-load queue
    #[serde(default = "default_pending_queue_capacity")]
    pub pending_queue_capacity: usize,
    /// Periodic worker wake interval in milliseconds (0 = wake on demand only)
    #[serde(default)]
    pub async_wake_interval_ms: u32,
    /// Priority given to newly created sources
    #[serde(default)]
    pub default_priority: u32,
    /// Frames decoded per streaming chunk
    #[serde(default = "default_stream_chunk_frames")]
    pub stream_chunk_frames: u32,
    /// Hardware buffers queued per streaming source
    #[serde(default = "default_stream_queue_size")]
    pub stream_queue_size: u32,
    /// Voices offered by the virtual output device
    #[serde(default = "default_virtual_voices")]
    pub virtual_voices: usize,
    /// Whether the virtual device supports per-thread bindings
    #[serde(default = "default_true")]
    pub thread_local_binding: bool,
    /// Default tracing filter, overridden by RUST_LOG
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_pending_queue_capacity() -> usize {
    16
}

fn default_stream_chunk_frames() -> u32 {
    12000
}

fn default_stream_queue_size() -> u32 {
    4
}

fn default_virtual_voices() -> usize {
    64
}

fn default_true() -> bool {
    true
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// Error types for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            pending_queue_capacity: default_pending_queue_capacity(),
            async_wake_interval_ms: 0,
            default_priority: 0,
            stream_chunk_frames: default_stream_chunk_frames(),
            stream_queue_size: default_stream_queue_size(),
            virtual_voices: default_virtual_voices(),
            thread_local_binding: true,
            log_filter: default_log_filter(),
        }
    }
}

impl Settings {
    /// Load settings from a file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Save settings to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(&self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("voicepool").join("config.json")
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pending_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "Pending queue capacity must be at least 1".to_string(),
            ));
        }
        if self.stream_chunk_frames == 0 || self.stream_queue_size == 0 {
            return Err(ConfigError::ValidationError(
                "Stream chunk and queue sizes must be non-zero".to_string(),
            ));
        }
        if self.virtual_voices == 0 {
            return Err(ConfigError::ValidationError(
                "The virtual device needs at least one voice".to_string(),
            ));
        }
        Ok(())
    }
}
