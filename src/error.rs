//! Error types for the Stagelight plugin host

use thiserror::Error;

/// Result type alias for Stagelight operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the plugin host
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A plugin failed to evaluate, construct, or initialize
    #[error("plugin {id} failed to load: {reason}")]
    PluginLoad {
        /// Plugin identifier
        id: String,
        /// Underlying failure message
        reason: String,
    },

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// The shared plugin router was mounted a second time
    #[error("plugin router is already mounted")]
    RouterAlreadyMounted,

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Build a [`Error::PluginLoad`] from any displayable cause
    pub fn plugin_load(id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::PluginLoad {
            id: id.into(),
            reason: reason.to_string(),
        }
    }
}
