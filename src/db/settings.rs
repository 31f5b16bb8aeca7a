//! Plugin settings repository
//!
//! Opaque JSON values keyed by `(plugin_id, key)`. The plugin id is the
//! namespace, so two plugins using the same key never collide.

use super::DbPool;
use crate::{Error, Result};

/// Settings repository for per-plugin configuration values
#[derive(Clone)]
pub struct SettingsRepo {
    pool: DbPool,
}

impl std::fmt::Debug for SettingsRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.pool.state();
        f.debug_struct("SettingsRepo")
            .field("connections", &state.connections)
            .field("idle_connections", &state.idle_connections)
            .finish()
    }
}

impl SettingsRepo {
    /// Create a new settings repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get a value for a plugin
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails or the stored value is
    /// not valid JSON
    pub fn get(&self, plugin_id: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;

        let raw: Option<String> = match conn.query_row(
            "SELECT value FROM plugin_settings WHERE plugin_id = ?1 AND key = ?2",
            rusqlite::params![plugin_id, key],
            |row| row.get(0),
        ) {
            Ok(value) => Some(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        raw.map(|s| serde_json::from_str(&s).map_err(Error::from))
            .transpose()
    }

    /// Set a value for a plugin, replacing any previous value
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn set(&self, plugin_id: &str, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;
        let content = serde_json::to_string(value)?;

        conn.execute(
            r"
            INSERT INTO plugin_settings (plugin_id, key, value)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(plugin_id, key) DO UPDATE SET
                value = excluded.value,
                updated_at = datetime('now')
            ",
            rusqlite::params![plugin_id, key, content],
        )?;

        Ok(())
    }

    /// Remove every value stored for a plugin
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn clear(&self, plugin_id: &str) -> Result<usize> {
        let conn = self.pool.get().map_err(|e| Error::Database(e.to_string()))?;

        let rows = conn.execute(
            "DELETE FROM plugin_settings WHERE plugin_id = ?1",
            rusqlite::params![plugin_id],
        )?;

        if rows > 0 {
            tracing::debug!(plugin_id = %plugin_id, rows, "cleared plugin settings");
        }

        Ok(rows)
    }
}
