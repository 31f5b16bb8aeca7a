//! Configuration management for the Stagelight plugin host

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::router::StaleRoutePolicy;
use crate::Result;

pub use file::{StagelightConfigFile, default_config_path};

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 18790;

/// Default number of plugins loaded concurrently
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Default bound on `init`/`destroy` hooks
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default reload count before escalated leak warnings
pub const DEFAULT_RELOAD_WARN_THRESHOLD: u32 = 10;

/// Stagelight host configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to data directory (settings database)
    pub data_dir: PathBuf,

    /// HTTP server configuration
    pub server: ServerConfig,

    /// Plugin runtime configuration
    pub plugins: PluginsConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
}

/// Plugin runtime configuration
#[derive(Debug, Clone)]
pub struct PluginsConfig {
    /// Root directory scanned for plugin sub-directories
    pub dir: PathBuf,

    /// Plugins loaded concurrently per batch (never zero)
    pub batch_size: usize,

    /// Upper bound for a single `init` or `destroy` hook
    pub hook_timeout: Duration,

    /// Reload count after which each reload escalates its leak warning
    pub reload_warn_threshold: u32,

    /// Route handling on unload
    pub stale_routes: StaleRoutePolicy,
}

impl PluginsConfig {
    /// Plugin runtime defaults rooted at `dir`
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
            reload_warn_threshold: DEFAULT_RELOAD_WARN_THRESHOLD,
            stale_routes: StaleRoutePolicy::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            plugins: PluginsConfig::new(data_dir.join("plugins")),
            data_dir,
            server: ServerConfig { port: DEFAULT_PORT },
        }
    }
}

impl Config {
    /// Load configuration
    ///
    /// Priority: environment > config file > defaults. `path` overrides the
    /// default config file location.
    ///
    /// # Errors
    ///
    /// Returns error if the config file exists but is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path.map(Path::to_path_buf).or_else(default_config_path) {
            Some(path) => StagelightConfigFile::read(&path)?,
            None => StagelightConfigFile::default(),
        };

        let mut config = Self::from_file(file);
        config.apply_env();
        Ok(config)
    }

    /// Overlay a parsed config file on top of the defaults
    #[must_use]
    pub fn from_file(file: StagelightConfigFile) -> Self {
        let mut config = Self::default();

        if let Some(data_dir) = file.data_dir {
            config.plugins.dir = data_dir.join("plugins");
            config.data_dir = data_dir;
        }
        if let Some(port) = file.server.port {
            config.server.port = port;
        }
        if let Some(dir) = file.plugins.dir {
            config.plugins.dir = dir;
        }
        if let Some(size) = file.plugins.batch_size {
            config.plugins.batch_size = size.max(1);
        }
        if let Some(secs) = file.plugins.hook_timeout_secs {
            config.plugins.hook_timeout = Duration::from_secs(secs);
        }
        if let Some(threshold) = file.plugins.reload_warn_threshold {
            config.plugins.reload_warn_threshold = threshold;
        }
        if let Some(policy) = file.plugins.stale_routes {
            config.plugins.stale_routes = policy;
        }

        config
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("STAGELIGHT_DATA_DIR") {
            let dir = PathBuf::from(dir);
            if self.plugins.dir == self.data_dir.join("plugins") {
                self.plugins.dir = dir.join("plugins");
            }
            self.data_dir = dir;
        }
        if let Ok(dir) = std::env::var("STAGELIGHT_PLUGINS_DIR") {
            self.plugins.dir = PathBuf::from(dir);
        }
        if let Some(port) = std::env::var("STAGELIGHT_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
        {
            self.server.port = port;
        }
    }

    /// Path of the plugin settings database
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("stagelight.db")
    }
}

fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".stagelight"),
        |dirs| dirs.data_dir().join("stagelight"),
    )
}
