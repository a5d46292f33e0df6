use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use crate::audit::task::{AuditOptions, AuditType};

/// Environment variable overriding `backend.base_url`
pub const BACKEND_URL_ENV: &str = "AUDIT_BACKEND_URL";

/// Environment variable overriding `backend.api_key`
pub const API_KEY_ENV: &str = "AUDIT_API_KEY";

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ClientConfig {
    pub backend: BackendSettings,
    pub polling: PollingSettings,
    pub audit: AuditDefaults,
}

/// Where the hosted backend lives
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BackendSettings {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
}

/// Polling cadence and budget
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PollingSettings {
    pub interval_ms: u64,          // Delay between status polls
    pub partial_interval_ms: u64,  // Delay between partial result reads
    pub timeout_secs: u64,         // Wall-clock budget from the first poll
    pub transient_warning_threshold: u32,
}

/// Defaults for new audits
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AuditDefaults {
    pub max_pages: u32,
    pub audit_type: AuditType,
}

impl AuditDefaults {
    pub fn options(&self) -> AuditOptions {
        AuditOptions {
            max_pages: self.max_pages,
            audit_type: self.audit_type,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend: BackendSettings {
                base_url: "http://localhost:54321".to_string(),
                api_key: String::new(),
                request_timeout_secs: 30,
            },
            polling: PollingSettings {
                interval_ms: 3000,
                partial_interval_ms: 4000,
                timeout_secs: 180,
                transient_warning_threshold: 5,
            },
            audit: AuditDefaults {
                max_pages: 100,
                audit_type: AuditType::Quick,
            },
        }
    }
}

impl ClientConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "seo-audit", "seo-audit-client") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        }
    }

    /// Path of the default configuration file
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("default.yaml")
    }

    /// Load the default configuration, creating it on first use
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_path();

        let config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            if let Err(e) = config.save_to_file(&config_path) {
                error!("Failed to save default configuration: {}", e);
            }
            config
        };

        Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply environment overrides; `lookup` abstracts the environment
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(BACKEND_URL_ENV).filter(|v| !v.is_empty()) {
            self.backend.base_url = url;
        }
        if let Some(key) = lookup(API_KEY_ENV).filter(|v| !v.is_empty()) {
            self.backend.api_key = key;
        }
        self
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }
}
