//! TOML configuration file loading
//!
//! Supports `~/.config/stagelight/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::router::StaleRoutePolicy;
use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct StagelightConfigFile {
    /// Directory for the settings database
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Plugin runtime configuration
    #[serde(default)]
    pub plugins: PluginsFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// HTTP server port
    pub port: Option<u16>,
}

/// Plugin runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct PluginsFileConfig {
    /// Root directory scanned for plugins
    pub dir: Option<PathBuf>,

    /// Number of plugins loaded concurrently during bulk discovery
    pub batch_size: Option<usize>,

    /// Upper bound for a single `init` or `destroy` hook, in seconds
    pub hook_timeout_secs: Option<u64>,

    /// Reload count after which every further reload logs an escalated warning
    pub reload_warn_threshold: Option<u32>,

    /// What happens to an unloaded plugin's routes
    pub stale_routes: Option<StaleRoutePolicy>,
}

impl StagelightConfigFile {
    /// Read and parse a config file
    ///
    /// A missing file yields the empty overlay.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let file: Self = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(file)
    }
}

/// Default config file location
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("stagelight").join("config.toml"))
}
