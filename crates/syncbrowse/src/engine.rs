//! Folder browsing state machine
//!
//! The engine is either showing the folder list (no browser) or browsing one
//! folder through a [`Browser`], which pairs the cursor with the folder's
//! cache handle. Replacing or dropping the browser closes the handle.
//!
//! Opening a directory that is not cached yet does not block: the engine
//! returns [`NavOutcome::Loading`], keeps the cursor where it was and parks a
//! background wait in `pending`. [`NavigationEngine::wait_pending`] resolves
//! it. While a load is pending, a request for the same directory attaches to
//! it and a request for another one is resolved, queued and opened
//! afterwards; the latest queued request wins.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::cache::{CacheConfig, CacheHandle, FolderCache};
use crate::cursor::{self, PathCursor};
use crate::error::{BrowseError, BrowseResult};
use crate::model::{Entry, Folder, FolderStats, ROOT_PATH};
use crate::ordering::EntryComparator;
use crate::source::{IndexClient, IndexSource, Transfers};
use crate::transfer::{TransferEvent, TransferQueue};

/// Entries of one directory, ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub folder: String,
    pub path: String,
    /// Folder label at the root, directory name below it.
    pub label: String,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavOutcome {
    /// The folder list, sorted by label.
    Folders(Vec<(Folder, FolderStats)>),
    Listing(Listing),
    /// The target is being loaded; the cursor has not moved.
    Loading { label: String },
    /// Another load is pending; this request runs after it.
    Queued { label: String },
    /// A file was handed to the transfer queue.
    Transfer { name: String },
}

struct Browser<S: IndexSource> {
    cursor: PathCursor,
    handle: CacheHandle<S>,
}

impl<S: IndexSource> Drop for Browser<S> {
    fn drop(&mut self) {
        self.handle.close();
    }
}

struct PendingLoad {
    handle_id: u64,
    /// Set while the folder itself is being entered; a failure then leaves
    /// the folder instead of staying at a cursor that was never shown.
    entering: bool,
    target: PathCursor,
    task: JoinHandle<BrowseResult<()>>,
}

impl Drop for PendingLoad {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct NavigationEngine<C: IndexClient, T: Transfers> {
    client: Arc<C>,
    cache: FolderCache<C>,
    transfers: TransferQueue<T>,
    folders: Vec<(Folder, FolderStats)>,
    browser: Option<Browser<C>>,
    pending: Option<PendingLoad>,
    /// Target resolved against the cursor the request was made from.
    queued: Option<PathCursor>,
}

impl<C: IndexClient, T: Transfers> NavigationEngine<C, T> {
    pub fn new(client: Arc<C>, config: CacheConfig, transfers: TransferQueue<T>) -> Self {
        Self {
            cache: FolderCache::new(Arc::clone(&client), config),
            client,
            transfers,
            folders: Vec::new(),
            browser: None,
            pending: None,
            queued: None,
        }
    }

    pub fn cursor(&self) -> Option<&PathCursor> {
        self.browser.as_ref().map(|browser| &browser.cursor)
    }

    pub fn is_browsing(&self) -> bool {
        self.browser.is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    /// Folder snapshot from the last fetch.
    pub fn folders(&self) -> &[(Folder, FolderStats)] {
        &self.folders
    }

    /// Leave the current folder, if any, and list all folders.
    pub async fn show_all_folders(&mut self) -> BrowseResult<NavOutcome> {
        self.leave_folder();
        self.reload_folders().await?;
        Ok(NavOutcome::Folders(self.folders.clone()))
    }

    /// Start browsing `folder_id`. Re-entering the folder being browsed keeps
    /// its cache handle; `hint` is then snapped to its deepest surviving
    /// directory.
    pub async fn enter_folder(
        &mut self,
        folder_id: &str,
        hint: Option<&str>,
    ) -> BrowseResult<NavOutcome> {
        if !self.knows_folder(folder_id) {
            self.reload_folders().await?;
        }
        if !self.knows_folder(folder_id) {
            return Err(BrowseError::UnknownFolder(folder_id.to_string()));
        }

        let reuse = self
            .browser
            .as_ref()
            .is_some_and(|browser| browser.cursor.folder() == folder_id);
        if reuse {
            if let Some(pending) = &self.pending {
                return Ok(self.loading(&pending.target));
            }
        } else {
            self.leave_folder();
            info!(folder = folder_id, "entering folder");
            self.browser = Some(Browser {
                cursor: PathCursor::root(folder_id),
                handle: self.cache.open(folder_id),
            });
        }

        let path = match hint {
            Some(hint) => {
                let handle = self.handle()?;
                match handle.nearest_directory(hint).await {
                    Ok(path) => path,
                    Err(err) => {
                        if !reuse {
                            self.browser = None;
                        }
                        return Err(err);
                    }
                }
            }
            None => ROOT_PATH.to_string(),
        };
        self.open_target(!reuse, PathCursor::new(folder_id, &path))
            .await
    }

    /// Open `entry` from the current cursor.
    ///
    /// Directories and the parent marker move the cursor once their listing
    /// is ready; the parent marker at the folder root returns to the folder
    /// list. Files are downloaded and leave the cursor alone.
    pub async fn navigate(&mut self, entry: &Entry) -> BrowseResult<NavOutcome> {
        let cursor = self.cursor().ok_or(BrowseError::NotBrowsing)?.clone();

        if !entry.is_directory() {
            self.transfers.download(entry.clone());
            return Ok(NavOutcome::Transfer {
                name: entry.name.clone(),
            });
        }

        if cursor.at_root() && PathCursor::is_parent_marker(entry) {
            return self.show_all_folders().await;
        }

        let target = cursor.resolve(entry)?;
        if let Some(pending) = &self.pending {
            if pending.target == target {
                return Ok(self.loading(&target));
            }
            debug!(path = target.path(), "queueing navigation behind pending load");
            let label = self.label_for(&target);
            self.queued = Some(target);
            return Ok(NavOutcome::Queued { label });
        }

        self.open_target(false, target).await
    }

    /// Switch listing order. The folder being browsed is reopened at the
    /// current path so its listings are rebuilt.
    pub async fn set_comparator(&mut self, comparator: EntryComparator) -> BrowseResult<NavOutcome> {
        self.cache.set_comparator(comparator);
        let Some((folder, path)) = self
            .cursor()
            .map(|cursor| (cursor.folder().to_string(), cursor.path().to_string()))
        else {
            return self.show_all_folders().await;
        };
        self.leave_folder();
        self.enter_folder(&folder, Some(&path)).await
    }

    /// Back one level.
    pub async fn go_up(&mut self) -> BrowseResult<NavOutcome> {
        let folder = self.cursor().ok_or(BrowseError::NotBrowsing)?.folder().to_string();
        self.navigate(&Entry::parent_marker(&folder)).await
    }

    /// Upload `source` into the directory being shown.
    pub fn upload_here(&self, source: PathBuf) -> BrowseResult<NavOutcome> {
        let cursor = self.cursor().ok_or(BrowseError::NotBrowsing)?;
        let name = source
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| source.display().to_string());
        self.transfers
            .upload(cursor.folder(), cursor.path(), source);
        Ok(NavOutcome::Transfer { name })
    }

    /// Wait for the pending load, then show its target (or replay the queued
    /// request). `None` when nothing is pending or the load belonged to a
    /// folder that has since been replaced.
    pub async fn wait_pending(&mut self) -> Option<BrowseResult<NavOutcome>> {
        let joined = match self.pending.as_mut() {
            Some(pending) => (&mut pending.task).await,
            None => return None,
        };
        let pending = self.pending.take()?;
        self.finish_pending(&pending, joined).await
    }

    /// Re-render after an index update: the folder list when not browsing,
    /// otherwise the current cursor (snapped to what still exists). A folder
    /// that disappeared returns to the folder list.
    pub async fn refresh_completed(&mut self) -> BrowseResult<NavOutcome> {
        self.reload_folders().await?;

        let Some(browser) = &self.browser else {
            return Ok(NavOutcome::Folders(self.folders.clone()));
        };
        let folder = browser.cursor.folder().to_string();
        if !self.knows_folder(&folder) {
            info!(folder = %folder, "folder no longer in the index");
            self.leave_folder();
            return Ok(NavOutcome::Folders(self.folders.clone()));
        }
        if let Some(pending) = &self.pending {
            return Ok(self.loading(&pending.target));
        }

        browser.handle.invalidate();
        let path = browser.cursor.path().to_string();
        self.enter_folder(&folder, Some(&path)).await
    }

    /// Re-render when an upload landed in the directory being shown.
    pub async fn transfer_completed(
        &mut self,
        event: &TransferEvent,
    ) -> BrowseResult<Option<NavOutcome>> {
        let TransferEvent::Uploaded { folder, path } = event else {
            return Ok(None);
        };
        let Some(browser) = &self.browser else {
            return Ok(None);
        };
        if self.pending.is_some()
            || browser.cursor.folder() != folder
            || cursor::parent_of(path) != browser.cursor.path()
        {
            return Ok(None);
        }

        browser.handle.invalidate();
        let target = browser.cursor.clone();
        self.open_target(false, target).await.map(Some)
    }

    async fn finish_pending(
        &mut self,
        pending: &PendingLoad,
        joined: Result<BrowseResult<()>, JoinError>,
    ) -> Option<BrowseResult<NavOutcome>> {
        let current = self.browser.as_ref().map(|browser| browser.handle.id());
        if current != Some(pending.handle_id) {
            debug!(folder = pending.target.folder(), "ignoring load for replaced folder");
            return None;
        }

        let result = joined.unwrap_or_else(|err| {
            Err(BrowseError::MaterializationFailed {
                path: pending.target.path().to_string(),
                reason: err.to_string(),
            })
        });
        if let Err(err) = result {
            return Some(Err(self.fail(pending.entering, err)));
        }

        // Readiness is re-checked against the handle as it is now
        let outcome = self
            .open_target(pending.entering, pending.target.clone())
            .await;
        if matches!(outcome, Ok(NavOutcome::Listing(_))) {
            if let Some(target) = self.queued.take() {
                debug!(path = target.path(), "replaying queued navigation");
                return Some(self.open_target(false, target).await);
            }
        }
        Some(outcome)
    }

    async fn open_target(&mut self, entering: bool, target: PathCursor) -> BrowseResult<NavOutcome> {
        let handle = self.handle()?;
        match handle.is_ready_after_short_wait(target.path()).await {
            Ok(true) => self.show(target),
            Ok(false) => {
                let outcome = self.loading(&target);
                let waiter = handle.clone();
                let path = target.path().to_string();
                debug!(folder = target.folder(), path = %path, "waiting for directory");
                let task = tokio::spawn(async move { waiter.wait_until_ready(&path).await });
                self.pending = Some(PendingLoad {
                    handle_id: handle.id(),
                    entering,
                    target,
                    task,
                });
                Ok(outcome)
            }
            Err(err) => Err(self.fail(entering, err)),
        }
    }

    fn show(&mut self, target: PathCursor) -> BrowseResult<NavOutcome> {
        let label = self.label_for(&target);
        let browser = self.browser.as_mut().ok_or(BrowseError::NotBrowsing)?;
        let entries = browser.handle.list(target.path())?;
        debug!(
            folder = target.folder(),
            path = target.path(),
            entries = entries.len(),
            "showing directory"
        );
        let listing = Listing {
            folder: target.folder().to_string(),
            path: target.path().to_string(),
            label,
            entries,
        };
        browser.cursor = target;
        Ok(NavOutcome::Listing(listing))
    }

    /// The cursor stays where it was; a folder that was never shown is left.
    fn fail(&mut self, entering: bool, err: BrowseError) -> BrowseError {
        warn!(error = %err, "navigation failed");
        self.queued = None;
        if entering {
            self.browser = None;
        }
        err
    }

    fn leave_folder(&mut self) {
        self.pending = None;
        self.queued = None;
        if let Some(browser) = self.browser.take() {
            debug!(folder = browser.cursor.folder(), "leaving folder");
        }
    }

    async fn reload_folders(&mut self) -> BrowseResult<()> {
        let mut folders = self
            .client
            .folders()
            .await
            .map_err(|err| BrowseError::IndexUnavailable(format!("{:#}", err)))?;
        folders.sort_by(|(a, _), (b, _)| a.label.cmp(&b.label));
        self.folders = folders;
        Ok(())
    }

    fn knows_folder(&self, folder_id: &str) -> bool {
        self.folders.iter().any(|(folder, _)| folder.id == folder_id)
    }

    fn handle(&self) -> BrowseResult<CacheHandle<C>> {
        self.browser
            .as_ref()
            .map(|browser| browser.handle.clone())
            .ok_or(BrowseError::NotBrowsing)
    }

    fn label_for(&self, target: &PathCursor) -> String {
        if target.at_root() {
            self.folders
                .iter()
                .find(|(folder, _)| folder.id == target.folder())
                .map(|(folder, _)| folder.label.clone())
                .unwrap_or_else(|| target.folder().to_string())
        } else {
            target.file_name().to_string()
        }
    }

    fn loading(&self, target: &PathCursor) -> NavOutcome {
        NavOutcome::Loading {
            label: format!("open directory: {}", self.label_for(target)),
        }
    }
}
