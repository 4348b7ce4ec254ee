//! Folder, entry and device types shared by the cache, the engine and the
//! collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor;

/// Path of a folder's root directory.
pub const ROOT_PATH: &str = "";

/// Path (and name) of the synthetic "go up one level" entry.
pub const PARENT_PATH: &str = "..";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderStats {
    pub file_count: u64,
    pub dir_count: u64,
    pub size: u64,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    /// Injected by the cache; never part of the index itself.
    ParentMarker,
}

/// A file or directory node, addressed by its slash-separated path relative to
/// the folder root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub folder: String,
    pub path: String,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

impl Entry {
    pub fn file(folder: &str, path: &str, size: u64) -> Self {
        Self {
            folder: folder.to_string(),
            path: path.to_string(),
            name: cursor::file_name(path).to_string(),
            kind: EntryKind::File,
            size,
            modified_at: None,
        }
    }

    pub fn directory(folder: &str, path: &str) -> Self {
        Self {
            folder: folder.to_string(),
            path: path.to_string(),
            name: cursor::file_name(path).to_string(),
            kind: EntryKind::Directory,
            size: 0,
            modified_at: None,
        }
    }

    pub fn parent_marker(folder: &str) -> Self {
        Self {
            folder: folder.to_string(),
            path: PARENT_PATH.to_string(),
            name: PARENT_PATH.to_string(),
            kind: EntryKind::ParentMarker,
            size: 0,
            modified_at: None,
        }
    }

    pub fn with_modified(mut self, modified_at: DateTime<Utc>) -> Self {
        self.modified_at = Some(modified_at);
        self
    }

    /// True for directories and for the parent marker.
    pub fn is_directory(&self) -> bool {
        self.kind != EntryKind::File
    }

    pub fn is_parent_marker(&self) -> bool {
        self.kind == EntryKind::ParentMarker
    }

    /// Path of the directory containing this entry.
    pub fn parent_path(&self) -> &str {
        cursor::parent_of(&self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    OnlineActive,
    OnlineInactive,
    Offline,
}

impl DeviceStatus {
    pub fn display_name(&self) -> &'static str {
        match self {
            DeviceStatus::OnlineActive => "online (active)",
            DeviceStatus::OnlineInactive => "online",
            DeviceStatus::Offline => "offline",
        }
    }
}

/// Live snapshot of a peer device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub device_id: String,
    pub name: String,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

impl DeviceStats {
    pub fn new(device_id: &str, name: &str, status: DeviceStatus) -> Self {
        Self {
            device_id: device_id.to_string(),
            name: name.to_string(),
            status,
            last_seen: None,
        }
    }
}
