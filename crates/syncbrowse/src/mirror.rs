//! Index client that mirrors local directories
//!
//! Each configured folder points at a local directory standing in for the
//! remote peer. An index update walks those directories and replaces the
//! folder's entries in the [`IndexStore`]; transfers copy files between the
//! mirror and the downloads directory.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cursor;
use crate::db::IndexStore;
use crate::model::{DeviceStats, DeviceStatus, Entry, Folder, FolderStats};
use crate::settings::SharedSettings;
use crate::source::{IndexClient, IndexSource, Transfers};

const PROGRESS_UPDATE_INTERVAL: usize = 100; // Publish progress every N entries

/// Device id reported for this machine.
pub const LOCAL_DEVICE_ID: &str = "LOCAL";

pub struct MirrorClient {
    store: IndexStore,
    settings: Arc<SharedSettings>,
    progress: Mutex<HashMap<String, watch::Sender<u8>>>,
    /// Cancellation flag - when set, a running index update stops
    cancelled: Arc<AtomicBool>,
}

impl MirrorClient {
    pub fn new(store: IndexStore, settings: Arc<SharedSettings>) -> Self {
        Self {
            store,
            settings,
            progress: Mutex::new(HashMap::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// Flag that interrupts the running index update when set.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    fn progress_sender(&self, folder: &str) -> watch::Sender<u8> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(folder.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .clone()
    }

    fn folder_root(&self, folder: &str) -> Result<PathBuf> {
        self.settings
            .snapshot()
            .folder_root(folder)
            .ok_or_else(|| anyhow!("folder '{}' is not configured", folder))
    }
}

/// Slash-separated path of `path` relative to `root`.
fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
    Ok(relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/"))
}

/// Walk `root` and build the folder's entries. Runs on a blocking thread.
pub fn scan_folder(
    folder: &str,
    root: &Path,
    progress: &watch::Sender<u8>,
    cancelled: &AtomicBool,
) -> Result<Vec<Entry>> {
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }

    let found: Vec<walkdir::DirEntry> = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, "skipping unreadable path");
                None
            }
        })
        .collect();

    let total = found.len().max(1);
    let mut entries = Vec::with_capacity(found.len());
    for (done, dir_entry) in found.iter().enumerate() {
        if cancelled.load(Ordering::Relaxed) {
            bail!("index update cancelled");
        }

        let metadata = match dir_entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(path = %dir_entry.path().display(), error = %err, "skipping entry");
                continue;
            }
        };
        let path = relative_path(root, dir_entry.path())?;
        let mut entry = if metadata.is_dir() {
            Entry::directory(folder, &path)
        } else {
            Entry::file(folder, &path, metadata.len())
        };
        entry.modified_at = metadata.modified().ok().map(DateTime::<Utc>::from);
        entries.push(entry);

        if done % PROGRESS_UPDATE_INTERVAL == 0 {
            progress.send_replace((done * 100 / total).min(99) as u8);
        }
    }

    Ok(entries)
}

impl IndexSource for MirrorClient {
    async fn children(&self, folder: &str, path: &str) -> Result<Vec<Entry>> {
        self.store.children(folder, path).await
    }

    async fn entry(&self, folder: &str, path: &str) -> Result<Option<Entry>> {
        self.store.entry(folder, path).await
    }
}

impl IndexClient for MirrorClient {
    async fn folders(&self) -> Result<Vec<(Folder, FolderStats)>> {
        self.store.list_folders_with_stats().await
    }

    fn folder_progress(&self, folder: &str) -> watch::Receiver<u8> {
        self.progress_sender(folder).subscribe()
    }

    async fn refresh(&self) -> Result<()> {
        self.cancelled.store(false, Ordering::SeqCst);
        let settings = self.settings.snapshot();

        let ids: Vec<String> = settings.folders.iter().map(|f| f.id.clone()).collect();
        let removed = self.store.remove_folders_except(&ids).await?;
        if removed > 0 {
            info!(removed, "dropped folders no longer configured");
        }

        for folder in &settings.folders {
            self.store
                .upsert_folder(&Folder {
                    id: folder.id.clone(),
                    label: folder.label.clone(),
                })
                .await?;

            let progress = self.progress_sender(&folder.id);
            progress.send_replace(0);

            let root = self.folder_root(&folder.id)?;
            let id = folder.id.clone();
            let cancelled = Arc::clone(&self.cancelled);
            let walker = progress.clone();
            let entries = tokio::task::spawn_blocking(move || {
                scan_folder(&id, &root, &walker, &cancelled)
            })
            .await
            .context("folder scan panicked")?
            .with_context(|| format!("scanning folder {}", folder.label))?;

            self.store
                .replace_folder_entries(&folder.id, &entries)
                .await?;
            self.store.set_last_update(&folder.id, Utc::now()).await?;
            progress.send_replace(100);
            debug!(folder = %folder.id, entries = entries.len(), "folder indexed");
        }

        Ok(())
    }

    async fn devices(&self) -> Result<Vec<DeviceStats>> {
        let settings = self.settings.snapshot();
        let mut devices = vec![DeviceStats {
            last_seen: Some(Utc::now()),
            ..DeviceStats::new(LOCAL_DEVICE_ID, &settings.device_name, DeviceStatus::OnlineActive)
        }];
        for peer in &settings.peers {
            let short = peer.device_id.split('-').next().unwrap_or(&peer.device_id);
            let name = peer.name.as_deref().unwrap_or(short);
            devices.push(DeviceStats::new(&peer.device_id, name, DeviceStatus::Offline));
        }
        Ok(devices)
    }
}

impl Transfers for MirrorClient {
    async fn upload(&self, folder: &str, path: &str, source: &Path) -> Result<String> {
        let name = source
            .file_name()
            .ok_or_else(|| anyhow!("{} has no file name", source.display()))?
            .to_string_lossy()
            .to_string();
        let target = cursor::join(path, &name);
        let destination = self.folder_root(folder)?.join(&target);

        let size = tokio::fs::copy(source, &destination)
            .await
            .with_context(|| format!("copying {} to {}", source.display(), destination.display()))?;

        let mut entry = Entry::file(folder, &target, size);
        entry.modified_at = Some(Utc::now());
        self.store.upsert_entry(&entry).await?;
        info!(folder, path = %target, size, "uploaded file");
        Ok(target)
    }

    async fn download(&self, entry: &Entry) -> Result<PathBuf> {
        if entry.is_directory() {
            bail!("'{}' is not a file", entry.path);
        }
        let source = self.folder_root(&entry.folder)?.join(&entry.path);
        let downloads = self.settings.snapshot().downloads_path();
        tokio::fs::create_dir_all(&downloads)
            .await
            .with_context(|| format!("Failed to create directory {}", downloads.display()))?;

        let destination = downloads.join(&entry.name);
        tokio::fs::copy(&source, &destination)
            .await
            .with_context(|| format!("copying {} to {}", source.display(), destination.display()))?;
        info!(path = %entry.path, to = %destination.display(), "downloaded file");
        Ok(destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_filesystem() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        fs::write(root.join("file1.txt"), b"hello world").unwrap();
        fs::create_dir(root.join("subdir")).unwrap();
        fs::write(root.join("subdir/file2.txt"), b"nested file").unwrap();
        fs::create_dir(root.join("subdir/nested")).unwrap();
        fs::create_dir(root.join("empty_dir")).unwrap();

        temp_dir
    }

    #[test]
    fn test_scan_folder_builds_relative_entries() {
        let temp_fs = create_test_filesystem();
        let (progress, _) = watch::channel(0);
        let cancelled = AtomicBool::new(false);

        let mut entries = scan_folder("docs", temp_fs.path(), &progress, &cancelled).unwrap();
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["empty_dir", "file1.txt", "subdir", "subdir/file2.txt", "subdir/nested"]
        );
        let file = entries.iter().find(|e| e.path == "file1.txt").unwrap();
        assert_eq!(file.size, 11);
        assert!(file.modified_at.is_some());
        assert!(entries.iter().all(|e| e.folder == "docs"));
        assert_eq!(
            entries
                .iter()
                .find(|e| e.path == "subdir/nested")
                .unwrap()
                .parent_path(),
            "subdir"
        );
    }

    #[test]
    fn test_scan_folder_honours_cancellation() {
        let temp_fs = create_test_filesystem();
        let (progress, _) = watch::channel(0);
        let cancelled = AtomicBool::new(true);

        let err = scan_folder("docs", temp_fs.path(), &progress, &cancelled).unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn test_scan_missing_directory_fails() {
        let temp_fs = TempDir::new().unwrap();
        let (progress, _) = watch::channel(0);
        let cancelled = AtomicBool::new(false);

        let missing = temp_fs.path().join("missing");
        assert!(scan_folder("docs", &missing, &progress, &cancelled).is_err());
    }

    #[test]
    fn test_relative_path_uses_slashes() {
        let root = Path::new("/srv/mirror");
        assert_eq!(
            relative_path(root, Path::new("/srv/mirror/a/b/c.txt")).unwrap(),
            "a/b/c.txt"
        );
        assert!(relative_path(root, Path::new("/elsewhere")).is_err());
    }
}
