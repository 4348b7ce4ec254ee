//! Configuration and settings management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::cache::CacheConfig;
use crate::devices::DeviceId;
use crate::ordering::SortMode;
use crate::source::PeerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Name this device reports in device listings
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Where downloaded files are written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloads_dir: Option<String>,
    #[serde(default)]
    pub browser: BrowserSettings,
    #[serde(default)]
    pub refresh: RefreshSettings,
    #[serde(default)]
    pub folders: Vec<FolderSettings>,
    #[serde(default)]
    pub peers: Vec<PeerSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            downloads_dir: None,
            browser: BrowserSettings::default(),
            refresh: RefreshSettings::default(),
            folders: Vec::new(),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSettings {
    #[serde(default)]
    pub sort: SortMode,
    #[serde(default = "default_allow_parent_in_root")]
    pub allow_parent_in_root: bool,
    #[serde(default = "default_short_wait_ms")]
    pub short_wait_ms: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            sort: SortMode::default(),
            allow_parent_in_root: default_allow_parent_in_root(),
            short_wait_ms: default_short_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshSettings {
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Refresh at start-up when the index is stale
    #[serde(default = "default_on_start")]
    pub on_start: bool,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            on_start: default_on_start(),
        }
    }
}

/// A synchronized folder mirrored from a local directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSettings {
    pub id: String,
    pub label: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSettings {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn default_device_name() -> String {
    "local".to_string()
}

fn default_allow_parent_in_root() -> bool {
    true
}

fn default_short_wait_ms() -> u64 {
    300
}

fn default_stale_after_secs() -> u64 {
    600
}

fn default_on_start() -> bool {
    true
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

impl Settings {
    /// Load settings from a file, or return defaults if file doesn't exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;

        let settings: Settings = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse settings from {}", path.display()))?;

        Ok(settings)
    }

    /// Save settings to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        std::fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write settings to {}", path.display()))?;

        Ok(())
    }

    fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize settings")
    }

    pub fn default_path() -> PathBuf {
        config_home().join("settings.toml")
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            comparator: self.browser.sort.comparator(),
            allow_parent_in_root: self.browser.allow_parent_in_root,
            short_wait: Duration::from_millis(self.browser.short_wait_ms),
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.refresh.stale_after_secs)
    }

    /// Local directory backing `folder`, with `~` expanded.
    pub fn folder_root(&self, folder: &str) -> Option<PathBuf> {
        self.folders
            .iter()
            .find(|f| f.id == folder)
            .map(|f| expand(&f.path))
    }

    pub fn downloads_path(&self) -> PathBuf {
        match &self.downloads_dir {
            Some(dir) => expand(dir),
            None => config_home().join("downloads"),
        }
    }
}

/// Directory holding settings, state and the default index database:
/// `$XDG_CONFIG_HOME/syncbrowse`, `%APPDATA%\syncbrowse` on Windows, otherwise
/// `~/.config/syncbrowse`. Falls back to `./syncbrowse` without a home.
pub fn config_home() -> PathBuf {
    let platform = if cfg!(windows) {
        std::env::var_os("APPDATA")
    } else {
        std::env::var_os("XDG_CONFIG_HOME")
    };
    platform
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("syncbrowse")
}

/// Settings shared between the peer workflow and the mirror client. Peer
/// edits are written back to the settings file on `persist`.
pub struct SharedSettings {
    settings: Mutex<Settings>,
    path: PathBuf,
}

impl SharedSettings {
    pub fn new(settings: Settings, path: PathBuf) -> Self {
        Self {
            settings: Mutex::new(settings),
            path,
        }
    }

    fn settings(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> Settings {
        self.settings().clone()
    }
}

impl PeerConfig for SharedSettings {
    fn add_peer(&self, device_id: &DeviceId, name: Option<&str>) -> bool {
        let mut settings = self.settings();
        if settings
            .peers
            .iter()
            .any(|peer| peer.device_id == device_id.as_str())
        {
            return false;
        }
        settings.peers.push(PeerSettings {
            device_id: device_id.to_string(),
            name: name.map(str::to_string),
        });
        true
    }

    fn remove_peer(&self, device_id: &DeviceId) -> bool {
        let mut settings = self.settings();
        let before = settings.peers.len();
        settings
            .peers
            .retain(|peer| peer.device_id != device_id.as_str());
        settings.peers.len() != before
    }

    async fn persist(&self) -> Result<()> {
        let contents = self.settings().to_toml()?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        tokio::fs::write(&self.path, contents)
            .await
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))?;
        debug!(path = %self.path.display(), "saved peer configuration");
        Ok(())
    }
}
