//! Application state that survives restarts

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::settings;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    /// When the last index update finished, successfully or not
    #[serde(default)]
    pub last_refresh: Option<DateTime<Utc>>,
}

impl AppState {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse state from {}", path.display()))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize state")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write state to {}", path.display()))
    }

    /// `state.json` next to the settings file.
    pub fn path_for(settings_path: &Path) -> PathBuf {
        settings_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(settings::config_home)
            .join("state.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_state_is_default() {
        let temp_dir = TempDir::new().unwrap();
        let state = AppState::load(temp_dir.path().join("state.json")).unwrap();
        assert_eq!(state, AppState::default());
    }

    #[test]
    fn test_last_refresh_round_trips() {
        let temp_dir = TempDir::new().unwrap();
        let path = AppState::path_for(&temp_dir.path().join("settings.toml"));
        assert_eq!(path, temp_dir.path().join("state.json"));

        let state = AppState {
            last_refresh: Some(Utc::now()),
        };
        state.save(&path).unwrap();
        assert_eq!(AppState::load(&path).unwrap(), state);
    }

    #[test]
    fn test_corrupt_state_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(AppState::load(&path).is_err());
    }
}
