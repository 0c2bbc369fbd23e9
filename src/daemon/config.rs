//! Daemon configuration
//!
//! Loading, saving, and validation of the daemon's TOML configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::download::DEFAULT_REGISTRY_URL;
use crate::fsutil;

/// Daemon configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Inference binary to launch (resolved through PATH when relative)
    pub server_bin: PathBuf,

    /// Directory holding downloaded models and the catalog
    pub models_dir: Option<PathBuf>,

    /// Directory holding preset documents
    pub presets_dir: Option<PathBuf>,

    /// Remote model registry base URL
    pub registry_url: String,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Seconds to wait for the server's health endpoint after a start
    pub ready_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server_bin: PathBuf::from("llama-server"),
            models_dir: None,
            presets_dir: None,
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            log_level: "info".to_string(),
            ready_timeout_secs: 120,
        }
    }
}

impl DaemonConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server_bin.as_os_str().is_empty() {
            anyhow::bail!("server_bin must not be empty");
        }
        if self.registry_url.is_empty() {
            anyhow::bail!("registry_url must not be empty");
        }
        if self.ready_timeout_secs == 0 {
            anyhow::bail!("ready_timeout_secs must be at least 1");
        }
        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => anyhow::bail!("invalid log_level: {other}"),
        }
    }

    pub fn models_dir(&self) -> Result<PathBuf> {
        match &self.models_dir {
            Some(dir) => Ok(dir.clone()),
            None => super::default_models_dir(),
        }
    }

    pub fn presets_dir(&self) -> Result<PathBuf> {
        match &self.presets_dir {
            Some(dir) => Ok(dir.clone()),
            None => super::default_presets_dir(),
        }
    }
}

/// Load configuration from the state directory; missing file yields
/// defaults.
pub fn load_config() -> Result<DaemonConfig> {
    let path = super::config_path()?;
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("cannot read config {}", path.display()))?;
    let config: DaemonConfig = toml::from_str(&raw)
        .with_context(|| format!("cannot parse config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Persist configuration atomically.
pub fn save_config(config: &DaemonConfig) -> Result<()> {
    config.validate()?;
    let path = super::config_path()?;
    let raw = toml::to_string_pretty(config).context("cannot serialize config")?;
    fsutil::atomic_write(&path, raw.as_bytes())?;
    Ok(())
}
