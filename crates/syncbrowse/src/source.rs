//! Contracts for the collaborators the navigation core is driven by
//!
//! The core never talks to the network or to disk directly. It consumes:
//!
//! - [`IndexSource`]: the local entry store the folder cache materialises from
//! - [`IndexClient`]: the index protocol client (folders, progress, refresh, devices)
//! - [`PeerConfig`]: the configuration that records known peers
//! - [`Transfers`]: file upload and download
//!
//! Every asynchronous method returns a `Send` future so the core can run it on
//! a background tokio task.

use anyhow::Result;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::watch;

use crate::devices::DeviceId;
use crate::model::{DeviceStats, Entry, Folder, FolderStats};

pub trait IndexSource: Send + Sync + 'static {
    /// Entries directly below `path`, in no particular order and without a
    /// parent marker.
    fn children(&self, folder: &str, path: &str) -> impl Future<Output = Result<Vec<Entry>>> + Send;

    /// A single entry, `None` when the path is not in the index.
    fn entry(&self, folder: &str, path: &str) -> impl Future<Output = Result<Option<Entry>>> + Send;
}

pub trait IndexClient: IndexSource {
    fn folders(&self) -> impl Future<Output = Result<Vec<(Folder, FolderStats)>>> + Send;

    /// Percent-complete updates for the folder while an index update runs.
    fn folder_progress(&self, folder: &str) -> watch::Receiver<u8>;

    /// Re-fetch the remote index. Blocks until the index is acquired.
    fn refresh(&self) -> impl Future<Output = Result<()>> + Send;

    fn devices(&self) -> impl Future<Output = Result<Vec<DeviceStats>>> + Send;
}

pub trait PeerConfig: Send + Sync + 'static {
    /// Returns false when the peer was already known.
    fn add_peer(&self, device_id: &DeviceId, name: Option<&str>) -> bool;

    /// Returns false when the peer was not known.
    fn remove_peer(&self, device_id: &DeviceId) -> bool;

    /// Commit pending edits. Best effort.
    fn persist(&self) -> impl Future<Output = Result<()>> + Send;
}

pub trait Transfers: Send + Sync + 'static {
    /// Upload `source` into `path` of `folder`, returning the new entry's path.
    fn upload(
        &self,
        folder: &str,
        path: &str,
        source: &Path,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Download a file entry, returning where it was written locally.
    fn download(&self, entry: &Entry) -> impl Future<Output = Result<PathBuf>> + Send;
}
