//! In-memory index client with simulated latency
//!
//! Backs the `demo` command and the test suites. Loads and refreshes can be
//! held at a gate and released later, which makes the asynchronous paths of
//! the navigation engine reproducible.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

use crate::cursor;
use crate::model::{DeviceStats, DeviceStatus, Entry, EntryKind, Folder, FolderStats};
use crate::source::{IndexClient, IndexSource, Transfers};

/// Gate key used for `refresh()`.
const REFRESH_GATE: (&str, &str) = ("", "<refresh>");

#[derive(Default)]
struct MemoryState {
    folders: Vec<Folder>,
    entries: HashMap<String, BTreeMap<String, Entry>>,
    last_update: HashMap<String, DateTime<Utc>>,
    failures: HashMap<(String, String), String>,
    interrupt_refresh: Option<String>,
    devices: Vec<DeviceStats>,
    downloads: Vec<String>,
}

#[derive(Default)]
pub struct MemoryIndex {
    state: Mutex<MemoryState>,
    latency: Duration,
    progress: Mutex<HashMap<String, watch::Sender<u8>>>,
    gates: Mutex<HashMap<(String, String), watch::Sender<bool>>>,
    calls: Mutex<HashMap<(String, String), usize>>,
    refresh_calls: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key(folder: &str, path: &str) -> (String, String) {
    (folder.to_string(), path.to_string())
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every load and refresh step by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// A small set of folders, files and peers for the demo command.
    pub fn demo() -> Self {
        let index = Self::new();
        index.add_folder("photos", "Camera");
        for month in ["2024-01", "2024-02", "2024-03"] {
            for shot in 1..=4 {
                index.add_file(
                    "photos",
                    &format!("{}/IMG_{:04}.jpg", month, shot),
                    2_400_000 + shot * 1_000,
                );
            }
        }
        index.add_dir("photos", "2024-03/edited");

        index.add_folder("docs", "Documents");
        index.add_file("docs", "taxes/2023/return.pdf", 182_000);
        index.add_file("docs", "taxes/2023/receipts.zip", 4_200_000);
        index.add_file("docs", "notes/todo.md", 1_200);
        index.add_file("docs", "notes/ideas.md", 3_400);
        index.add_file("docs", "readme.txt", 640);

        index.add_folder("music", "Music");
        index.add_file("music", "Artist/Album/01 - Opening.flac", 31_000_000);
        index.add_file("music", "Artist/Album/02 - Closing.flac", 28_000_000);

        index.add_device(DeviceStats::new("LAPTOP", "laptop", DeviceStatus::OnlineActive));
        index.add_device(DeviceStats::new("NAS", "nas", DeviceStatus::OnlineInactive));
        index.add_device(DeviceStats::new("PHONE", "old-phone", DeviceStatus::Offline));
        index
    }

    pub fn add_folder(&self, id: &str, label: &str) {
        let mut state = lock(&self.state);
        if !state.folders.iter().any(|f| f.id == id) {
            state.folders.push(Folder {
                id: id.to_string(),
                label: label.to_string(),
            });
        }
        state.entries.entry(id.to_string()).or_default();
    }

    pub fn remove_folder(&self, id: &str) {
        let mut state = lock(&self.state);
        state.folders.retain(|f| f.id != id);
        state.entries.remove(id);
    }

    /// Add a directory and any missing ancestors.
    pub fn add_dir(&self, folder: &str, path: &str) {
        let path = cursor::normalize(path);
        let mut state = lock(&self.state);
        let entries = state.entries.entry(folder.to_string()).or_default();
        for dir in cursor::ancestors(&path).filter(|p| !p.is_empty()) {
            entries
                .entry(dir.to_string())
                .or_insert_with(|| Entry::directory(folder, dir));
        }
    }

    /// Add a file and any missing parent directories.
    pub fn add_file(&self, folder: &str, path: &str, size: u64) {
        let path = cursor::normalize(path);
        let parent = cursor::parent_of(&path).to_string();
        if !parent.is_empty() {
            self.add_dir(folder, &parent);
        }
        let mut state = lock(&self.state);
        state
            .entries
            .entry(folder.to_string())
            .or_default()
            .insert(path.clone(), Entry::file(folder, &path, size));
    }

    /// Remove an entry and everything below it.
    pub fn remove_entry(&self, folder: &str, path: &str) {
        let prefix = format!("{}/", path);
        let mut state = lock(&self.state);
        if let Some(entries) = state.entries.get_mut(folder) {
            entries.retain(|p, _| p != path && !p.starts_with(&prefix));
        }
    }

    pub fn add_device(&self, device: DeviceStats) {
        lock(&self.state).devices.push(device);
    }

    /// Block loads of `path` until [`release`](Self::release) is called.
    pub fn hold(&self, folder: &str, path: &str) {
        let (tx, _) = watch::channel(false);
        lock(&self.gates).insert(key(folder, path), tx);
    }

    pub fn release(&self, folder: &str, path: &str) {
        if let Some(tx) = lock(&self.gates).remove(&key(folder, path)) {
            tx.send_replace(true);
        }
    }

    pub fn hold_refresh(&self) {
        self.hold(REFRESH_GATE.0, REFRESH_GATE.1);
    }

    pub fn release_refresh(&self) {
        self.release(REFRESH_GATE.0, REFRESH_GATE.1);
    }

    /// Make loads of `path` fail with `reason`.
    pub fn fail(&self, folder: &str, path: &str, reason: &str) {
        lock(&self.state)
            .failures
            .insert(key(folder, path), reason.to_string());
    }

    pub fn clear_failure(&self, folder: &str, path: &str) {
        lock(&self.state).failures.remove(&key(folder, path));
    }

    /// Make the next refresh fail with `reason`.
    pub fn interrupt_next_refresh(&self, reason: &str) {
        lock(&self.state).interrupt_refresh = Some(reason.to_string());
    }

    pub fn children_calls(&self, folder: &str, path: &str) -> usize {
        lock(&self.calls)
            .get(&key(folder, path))
            .copied()
            .unwrap_or(0)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> Vec<String> {
        lock(&self.state).downloads.clone()
    }

    async fn pass_gate(&self, folder: &str, path: &str) {
        let gate = lock(&self.gates)
            .get(&key(folder, path))
            .map(|tx| tx.subscribe());
        if let Some(mut rx) = gate {
            let _ = rx.wait_for(|open| *open).await;
        }
    }

    fn progress_sender(&self, folder: &str) -> watch::Sender<u8> {
        lock(&self.progress)
            .entry(folder.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .clone()
    }
}

impl IndexSource for MemoryIndex {
    async fn children(&self, folder: &str, path: &str) -> Result<Vec<Entry>> {
        *lock(&self.calls).entry(key(folder, path)).or_insert(0) += 1;
        self.pass_gate(folder, path).await;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let state = lock(&self.state);
        if let Some(reason) = state.failures.get(&key(folder, path)) {
            bail!("{}", reason);
        }
        let entries = state
            .entries
            .get(folder)
            .ok_or_else(|| anyhow!("unknown folder '{}'", folder))?;
        Ok(entries
            .values()
            .filter(|entry| entry.parent_path() == path)
            .cloned()
            .collect())
    }

    async fn entry(&self, folder: &str, path: &str) -> Result<Option<Entry>> {
        let state = lock(&self.state);
        Ok(state
            .entries
            .get(folder)
            .and_then(|entries| entries.get(path))
            .cloned())
    }
}

impl IndexClient for MemoryIndex {
    async fn folders(&self) -> Result<Vec<(Folder, FolderStats)>> {
        let state = lock(&self.state);
        Ok(state
            .folders
            .iter()
            .map(|folder| {
                let mut stats = FolderStats {
                    last_update: state.last_update.get(&folder.id).copied(),
                    ..FolderStats::default()
                };
                for entry in state.entries.get(&folder.id).into_iter().flat_map(|e| e.values()) {
                    match entry.kind {
                        EntryKind::File => {
                            stats.file_count += 1;
                            stats.size += entry.size;
                        }
                        EntryKind::Directory => stats.dir_count += 1,
                        EntryKind::ParentMarker => {}
                    }
                }
                (folder.clone(), stats)
            })
            .collect())
    }

    fn folder_progress(&self, folder: &str) -> watch::Receiver<u8> {
        self.progress_sender(folder).subscribe()
    }

    async fn refresh(&self) -> Result<()> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate(REFRESH_GATE.0, REFRESH_GATE.1).await;

        if let Some(reason) = lock(&self.state).interrupt_refresh.take() {
            bail!("{}", reason);
        }

        let folder_ids: Vec<String> = lock(&self.state)
            .folders
            .iter()
            .map(|f| f.id.clone())
            .collect();
        for id in folder_ids {
            let progress = self.progress_sender(&id);
            for percent in [25u8, 50, 75, 100] {
                if !self.latency.is_zero() {
                    tokio::time::sleep(self.latency / 4).await;
                }
                progress.send_replace(percent);
            }
            lock(&self.state).last_update.insert(id, Utc::now());
        }
        Ok(())
    }

    async fn devices(&self) -> Result<Vec<DeviceStats>> {
        Ok(lock(&self.state).devices.clone())
    }
}

impl Transfers for MemoryIndex {
    async fn upload(&self, folder: &str, path: &str, source: &Path) -> Result<String> {
        let name = source
            .file_name()
            .ok_or_else(|| anyhow!("{} has no file name", source.display()))?
            .to_string_lossy()
            .to_string();
        let target = cursor::join(path, &name);
        self.add_file(folder, &target, 0);
        Ok(target)
    }

    async fn download(&self, entry: &Entry) -> Result<PathBuf> {
        if entry.is_directory() {
            bail!("'{}' is not a file", entry.path);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        lock(&self.state).downloads.push(entry.path.clone());
        Ok(PathBuf::from(&entry.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_children_lists_direct_descendants_only() {
        let index = MemoryIndex::new();
        index.add_folder("docs", "Documents");
        index.add_file("docs", "a/b/c.txt", 1);
        index.add_file("docs", "top.txt", 1);

        let root = index.children("docs", "").await.unwrap();
        let mut names: Vec<_> = root.iter().map(|e| e.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "top.txt"]);

        let nested = index.children("docs", "a").await.unwrap();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].path, "a/b");
        assert_eq!(index.children_calls("docs", "a"), 1);
    }

    #[tokio::test]
    async fn test_folder_stats_count_entries() {
        let index = MemoryIndex::new();
        index.add_folder("docs", "Documents");
        index.add_file("docs", "a/one.txt", 10);
        index.add_file("docs", "a/two.txt", 5);

        let folders = index.folders().await.unwrap();
        assert_eq!(folders.len(), 1);
        let (_, stats) = &folders[0];
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.dir_count, 1);
        assert_eq!(stats.size, 15);
        assert!(stats.last_update.is_none());
    }

    #[tokio::test]
    async fn test_refresh_publishes_progress_and_timestamps() {
        let index = MemoryIndex::new();
        index.add_folder("docs", "Documents");
        let progress = index.folder_progress("docs");

        index.refresh().await.unwrap();

        assert_eq!(*progress.borrow(), 100);
        let folders = index.folders().await.unwrap();
        assert!(folders[0].1.last_update.is_some());
        assert_eq!(index.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_refresh() {
        let index = MemoryIndex::new();
        index.interrupt_next_refresh("peer disconnected");
        let err = index.refresh().await.unwrap_err();
        assert_eq!(err.to_string(), "peer disconnected");
        // Only the next refresh is affected
        index.refresh().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_entry_removes_subtree() {
        let index = MemoryIndex::new();
        index.add_folder("docs", "Documents");
        index.add_file("docs", "a/b/c.txt", 1);
        index.add_file("docs", "ab.txt", 1);
        index.remove_entry("docs", "a");

        assert!(index.entry("docs", "a/b").await.unwrap().is_none());
        assert!(index.entry("docs", "ab.txt").await.unwrap().is_some());
    }
}
