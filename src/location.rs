//! Device location metadata.
//!
//! GPS acquisition lives outside this crate; whatever owns it can update the
//! shared location, and the last known fix is cached to disk so a device that
//! boots without GPS still reports where it was. Falls back to the configured
//! coordinates with source `"configured"`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub accuracy: Option<f64>,
    pub source: String,
}

impl Location {
    pub fn configured(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            latitude,
            longitude,
            altitude: None,
            accuracy: None,
            source: "configured".to_string(),
        }
    }

    pub fn load_cached(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(location) => Some(location),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt location cache");
                None
            }
        }
    }

    pub fn store_cache(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(parent.display().to_string(), e))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| Error::io(path.display().to_string(), e))
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}
