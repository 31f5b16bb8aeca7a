//! Plugin manifest format (`plugin.json`)

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Manifest file name inside every plugin directory
pub const MANIFEST_FILE: &str = "plugin.json";

/// Plugin manifest describing identity and entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identifier (e.g. "soundboard")
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Entry point, relative to the plugin directory
    pub entry: String,
    /// Version string
    #[serde(default = "default_version")]
    pub version: String,
    /// Short description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Plugin author
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Free-form category (e.g. "overlay", "utility")
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Declared default for the enabled flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

impl PluginManifest {
    /// Name of the first required field that is blank, if any
    #[must_use]
    pub fn missing_field(&self) -> Option<&'static str> {
        [("id", &self.id), ("name", &self.name), ("entry", &self.entry)]
            .into_iter()
            .find(|(_, value)| value.trim().is_empty())
            .map(|(field, _)| field)
    }

    /// Resolve the entry point inside `dir`
    ///
    /// Returns `None` if the entry is absolute or climbs out of the plugin
    /// directory.
    #[must_use]
    pub fn entry_path(&self, dir: &Path) -> Option<PathBuf> {
        let entry = Path::new(&self.entry);
        entry
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
            .then(|| dir.join(entry))
    }
}
