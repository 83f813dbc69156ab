//! Configuration file support for serupload.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (SERUPLOAD_*)
//! 3. Local config file (./serupload.toml)
//! 4. Global config file (~/.config/serupload/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serupload::upload::UploadConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "serupload.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial device (e.g., "/dev/ttyUSB0" or "COM3").
    pub device: Option<String>,
    /// Default link speed.
    pub speed: Option<u32>,
}

/// Upload tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadSection {
    /// Maximum image chunk size.
    pub chunk: Option<usize>,
    /// Retransmissions allowed per segment.
    pub max_retries: Option<u32>,
    /// Response timeout for the first segment, in seconds.
    pub first_timeout_secs: Option<u64>,
    /// Response timeout for later segments, in seconds.
    pub next_timeout_secs: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Upload settings.
    #[serde(default)]
    pub upload: UploadSection,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "serupload").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.device.is_some() {
            self.connection.device = other.connection.device;
        }
        if other.connection.speed.is_some() {
            self.connection.speed = other.connection.speed;
        }

        if other.upload.chunk.is_some() {
            self.upload.chunk = other.upload.chunk;
        }
        if other.upload.max_retries.is_some() {
            self.upload.max_retries = other.upload.max_retries;
        }
        if other.upload.first_timeout_secs.is_some() {
            self.upload.first_timeout_secs = other.upload.first_timeout_secs;
        }
        if other.upload.next_timeout_secs.is_some() {
            self.upload.next_timeout_secs = other.upload.next_timeout_secs;
        }
    }

    /// Build the library upload configuration, letting explicit flags win.
    pub fn upload_config(&self, chunk: Option<usize>, max_retries: Option<u32>) -> UploadConfig {
        let defaults = UploadConfig::default();
        UploadConfig {
            chunk_size: chunk
                .or(self.upload.chunk)
                .unwrap_or(defaults.chunk_size),
            first_timeout: self
                .upload
                .first_timeout_secs
                .map_or(defaults.first_timeout, Duration::from_secs),
            next_timeout: self
                .upload
                .next_timeout_secs
                .map_or(defaults.next_timeout, Duration::from_secs),
            max_retries: max_retries.or(self.upload.max_retries),
        }
    }
}
