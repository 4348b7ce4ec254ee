//! Lazily materialised, per-folder cache of directory listings
//!
//! A [`CacheHandle`] tracks one folder. The first readiness query for a path
//! starts a background load from the [`IndexSource`]; later queries for the same
//! path attach to that load instead of starting another one. Readiness can be
//! probed three ways, from cheapest to most expensive:
//!
//! 1. [`CacheHandle::is_ready_now`] never waits
//! 2. [`CacheHandle::is_ready_after_short_wait`] waits at most `short_wait`
//! 3. [`CacheHandle::wait_until_ready`] waits for the load to settle
//!
//! Closing a handle aborts in-flight loads; a load that still completes after
//! the close is discarded without touching the cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::cursor;
use crate::error::{BrowseError, BrowseResult};
use crate::model::{Entry, ROOT_PATH};
use crate::ordering::EntryComparator;
use crate::source::IndexSource;

pub const DEFAULT_SHORT_WAIT: Duration = Duration::from_millis(300);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub comparator: EntryComparator,
    /// Also list the parent marker at the folder root.
    pub allow_parent_in_root: bool,
    /// Bound for [`CacheHandle::is_ready_after_short_wait`].
    pub short_wait: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            comparator: EntryComparator::default(),
            allow_parent_in_root: true,
            short_wait: DEFAULT_SHORT_WAIT,
        }
    }
}

impl CacheConfig {
    /// Whether listings of `path` start with the parent marker.
    pub fn includes_parent(&self, path: &str) -> bool {
        path != ROOT_PATH || self.allow_parent_in_root
    }
}

/// Opens cache handles that share one index source and configuration.
pub struct FolderCache<S> {
    source: Arc<S>,
    config: CacheConfig,
    next_handle: AtomicU64,
}

impl<S: IndexSource> FolderCache<S> {
    pub fn new(source: Arc<S>, config: CacheConfig) -> Self {
        Self {
            source,
            config,
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Order used by handles opened from now on. Open handles keep theirs.
    pub fn set_comparator(&mut self, comparator: EntryComparator) {
        self.config.comparator = comparator;
    }

    /// Start tracking `folder`. Nothing is loaded until a path is queried.
    pub fn open(&self, folder: &str) -> CacheHandle<S> {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        debug!(folder, handle = id, "opening cache handle");
        CacheHandle {
            inner: Arc::new(HandleInner {
                id,
                folder: folder.to_string(),
                source: Arc::clone(&self.source),
                config: self.config.clone(),
                closed: AtomicBool::new(false),
                next_load: AtomicU64::new(0),
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }
}

enum Slot {
    Loading {
        load_id: u64,
        done: watch::Receiver<bool>,
        task: AbortHandle,
    },
    Ready(Arc<Vec<Entry>>),
    Failed(String),
}

enum Settled {
    Ready,
    Failed(String),
    Loading(watch::Receiver<bool>),
}

struct HandleInner<S> {
    id: u64,
    folder: String,
    source: Arc<S>,
    config: CacheConfig,
    closed: AtomicBool,
    next_load: AtomicU64,
    /// Keyed by path prefix within the folder.
    slots: Mutex<HashMap<String, Slot>>,
}

impl<S> HandleInner<S> {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> BrowseError {
        BrowseError::HandleClosed(self.folder.clone())
    }

    fn build_listing(&self, path: &str, children: Vec<Entry>) -> Vec<Entry> {
        let mut entries: Vec<Entry> = children
            .into_iter()
            .filter(|entry| !entry.is_parent_marker())
            .collect();
        self.config.comparator.sort(&mut entries);
        if self.config.includes_parent(path) {
            entries.insert(0, Entry::parent_marker(&self.folder));
        }
        entries
    }

    /// Record the outcome of load `load_id`, unless the handle was closed or
    /// the load was superseded in the meantime.
    fn settle(&self, path: &str, load_id: u64, result: anyhow::Result<Vec<Entry>>) {
        let mut slots = self.slots();
        if self.is_closed() {
            debug!(folder = %self.folder, path, "discarding load for closed handle");
            return;
        }
        match slots.get(path) {
            Some(Slot::Loading { load_id: current, .. }) if *current == load_id => {}
            _ => {
                debug!(folder = %self.folder, path, "discarding superseded load");
                return;
            }
        }

        let slot = match result {
            Ok(children) => {
                let listing = self.build_listing(path, children);
                debug!(folder = %self.folder, path, entries = listing.len(), "directory ready");
                Slot::Ready(Arc::new(listing))
            }
            Err(err) => {
                let reason = format!("{:#}", err);
                warn!(folder = %self.folder, path, error = %reason, "failed to materialize directory");
                Slot::Failed(reason)
            }
        };
        slots.insert(path.to_string(), slot);
    }
}

/// Aborts the inner fetch when the load task is aborted by `close`.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One folder's view of the cache. Clones share state; closing any clone
/// closes them all.
pub struct CacheHandle<S> {
    inner: Arc<HandleInner<S>>,
}

impl<S> Clone for CacheHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: IndexSource> CacheHandle<S> {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn folder(&self) -> &str {
        &self.inner.folder
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn is_ready_now(&self, path: &str) -> BrowseResult<bool> {
        let mut slots = self.inner.slots();
        if self.inner.is_closed() {
            return Err(self.inner.closed_error());
        }
        match slots.get(path) {
            Some(Slot::Ready(_)) => Ok(true),
            Some(Slot::Loading { .. }) => Ok(false),
            Some(Slot::Failed(_)) | None => {
                self.start_load(&mut slots, path);
                Ok(false)
            }
        }
    }

    /// Readiness after waiting at most the configured short wait. A load that
    /// fails within the bound is reported as an error.
    pub async fn is_ready_after_short_wait(&self, path: &str) -> BrowseResult<bool> {
        if self.is_ready_now(path)? {
            return Ok(true);
        }
        match tokio::time::timeout(self.inner.config.short_wait, self.wait_until_ready(path)).await
        {
            Ok(Ok(())) => Ok(true),
            Ok(Err(err)) => Err(err),
            Err(_) => Ok(false),
        }
    }

    /// Suspend until `path` is loaded. Callers run this on a background task.
    pub async fn wait_until_ready(&self, path: &str) -> BrowseResult<()> {
        let mut done = match self.settled(path)? {
            Settled::Ready => return Ok(()),
            Settled::Failed(_) => self.restart(path)?,
            Settled::Loading(done) => done,
        };

        loop {
            if done.wait_for(|finished| *finished).await.is_err() {
                // The load task was aborted by close()
                return Err(self.inner.closed_error());
            }
            match self.settled(path)? {
                Settled::Ready => return Ok(()),
                Settled::Failed(reason) => {
                    return Err(BrowseError::MaterializationFailed {
                        path: path.to_string(),
                        reason,
                    })
                }
                Settled::Loading(next) => done = next,
            }
        }
    }

    /// Sorted entries of a ready path, parent marker first where configured.
    pub fn list(&self, path: &str) -> BrowseResult<Vec<Entry>> {
        let slots = self.inner.slots();
        if self.inner.is_closed() {
            return Err(self.inner.closed_error());
        }
        match slots.get(path) {
            Some(Slot::Ready(entries)) => Ok(entries.as_ref().clone()),
            _ => Err(BrowseError::NotReady {
                path: path.to_string(),
            }),
        }
    }

    /// Deepest existing directory on the way from `hint` up to the root.
    pub async fn nearest_directory(&self, hint: &str) -> BrowseResult<String> {
        let hint = cursor::normalize(hint);
        for candidate in cursor::ancestors(&hint) {
            if candidate == ROOT_PATH {
                break;
            }
            if self.is_closed() {
                return Err(self.inner.closed_error());
            }
            match self.inner.source.entry(&self.inner.folder, candidate).await {
                Ok(Some(entry)) if entry.is_directory() => return Ok(candidate.to_string()),
                Ok(_) => continue,
                Err(err) => return Err(BrowseError::materialization(candidate, &err)),
            }
        }
        Ok(ROOT_PATH.to_string())
    }

    /// Drop every settled listing so the next query reloads it. In-flight
    /// loads are kept. Returns the number of listings dropped.
    pub fn invalidate(&self) -> usize {
        let mut slots = self.inner.slots();
        let before = slots.len();
        slots.retain(|_, slot| matches!(slot, Slot::Loading { .. }));
        let dropped = before - slots.len();
        debug!(folder = %self.inner.folder, dropped, "invalidated cached listings");
        dropped
    }

    /// Release the handle. Idempotent; in-flight loads are aborted.
    pub fn close(&self) {
        let mut slots = self.inner.slots();
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (_, slot) in slots.drain() {
            if let Slot::Loading { task, .. } = slot {
                task.abort();
            }
        }
        debug!(folder = %self.inner.folder, handle = self.inner.id, "closed cache handle");
    }

    fn settled(&self, path: &str) -> BrowseResult<Settled> {
        let mut slots = self.inner.slots();
        if self.inner.is_closed() {
            return Err(self.inner.closed_error());
        }
        Ok(match slots.get(path) {
            Some(Slot::Ready(_)) => Settled::Ready,
            Some(Slot::Failed(reason)) => Settled::Failed(reason.clone()),
            Some(Slot::Loading { done, .. }) => Settled::Loading(done.clone()),
            None => Settled::Loading(self.start_load(&mut slots, path)),
        })
    }

    fn restart(&self, path: &str) -> BrowseResult<watch::Receiver<bool>> {
        let mut slots = self.inner.slots();
        if self.inner.is_closed() {
            return Err(self.inner.closed_error());
        }
        Ok(match slots.get(path) {
            Some(Slot::Loading { done, .. }) => done.clone(),
            _ => self.start_load(&mut slots, path),
        })
    }

    fn start_load(&self, slots: &mut HashMap<String, Slot>, path: &str) -> watch::Receiver<bool> {
        let (tx, done) = watch::channel(false);
        let load_id = self.inner.next_load.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let key = path.to_string();

        debug!(folder = %self.inner.folder, path, "materializing directory");
        let task = tokio::spawn(async move {
            // A panic in the source settles as a failed load
            let source = Arc::clone(&inner.source);
            let (folder, path) = (inner.folder.clone(), key.clone());
            let fetch = tokio::spawn(async move { source.children(&folder, &path).await });
            let _abort_fetch = AbortOnDrop(fetch.abort_handle());
            let result = match fetch.await {
                Ok(result) => result,
                Err(err) => Err(anyhow::anyhow!("directory load crashed: {}", err)),
            };
            inner.settle(&key, load_id, result);
            let _ = tx.send(true);
        });

        slots.insert(
            path.to_string(),
            Slot::Loading {
                load_id,
                done: done.clone(),
                task: task.abort_handle(),
            },
        );
        done
    }
}
