//! Single-flight index refresh
//!
//! [`RefreshCoordinator::trigger`] moves the shared state from idle to in
//! progress with one compare-and-swap; a trigger that loses the race is
//! rejected with [`BrowseError::AlreadyInProgress`] and has no side effect.
//! Each accepted trigger produces exactly one [`RefreshEvent::Completed`] on
//! the event channel, whether the refresh succeeded or not.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{BrowseError, BrowseResult};
use crate::model::Folder;
use crate::source::IndexClient;

const IDLE: u8 = 0;
const IN_PROGRESS: u8 = 1;
const COMPLETING: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    InProgress,
    Completing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshCompletion {
    pub finished_at: DateTime<Utc>,
    pub result: BrowseResult<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshEvent {
    Started,
    Progress {
        folder: String,
        label: String,
        percent: u8,
    },
    Completed(RefreshCompletion),
}

impl RefreshEvent {
    /// Status line for the presentation layer.
    pub fn describe(&self) -> String {
        match self {
            RefreshEvent::Started => "index update started".to_string(),
            RefreshEvent::Progress { label, percent, .. } => format!(
                "index update, folder {} {}% synchronized",
                label, percent
            ),
            RefreshEvent::Completed(RefreshCompletion { result: Ok(()), .. }) => {
                "index update complete".to_string()
            }
            RefreshEvent::Completed(RefreshCompletion {
                result: Err(err), ..
            }) => format!("error updating index: {}", err),
        }
    }
}

pub struct RefreshCoordinator<C> {
    client: Arc<C>,
    state: Arc<AtomicU8>,
    last_completed: Arc<Mutex<Option<DateTime<Utc>>>>,
    events: mpsc::UnboundedSender<RefreshEvent>,
}

impl<C> Clone for RefreshCoordinator<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            state: Arc::clone(&self.state),
            last_completed: Arc::clone(&self.last_completed),
            events: self.events.clone(),
        }
    }
}

impl<C: IndexClient> RefreshCoordinator<C> {
    pub fn new(client: Arc<C>, events: mpsc::UnboundedSender<RefreshEvent>) -> Self {
        Self {
            client,
            state: Arc::new(AtomicU8::new(IDLE)),
            last_completed: Arc::new(Mutex::new(None)),
            events,
        }
    }

    /// Seed the completion time, e.g. from persisted application state.
    pub fn with_last_completed(self, last: Option<DateTime<Utc>>) -> Self {
        *self
            .last_completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = last;
        self
    }

    pub fn state(&self) -> RefreshState {
        match self.state.load(Ordering::SeqCst) {
            IN_PROGRESS => RefreshState::InProgress,
            COMPLETING => RefreshState::Completing,
            _ => RefreshState::Idle,
        }
    }

    pub fn last_completed(&self) -> Option<DateTime<Utc>> {
        *self
            .last_completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn since_last_refresh(&self) -> Option<chrono::Duration> {
        self.last_completed().map(|last| Utc::now() - last)
    }

    /// Due when no refresh ever completed or the last one is older than
    /// `stale_after`.
    pub fn is_due(&self, stale_after: Duration) -> bool {
        match self.since_last_refresh() {
            None => true,
            Some(elapsed) => elapsed
                .to_std()
                .map(|elapsed| elapsed > stale_after)
                .unwrap_or(false),
        }
    }

    /// Start a refresh on a background task.
    pub fn trigger(&self) -> BrowseResult<()> {
        if self
            .state
            .compare_exchange(IDLE, IN_PROGRESS, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("index update already in progress");
            return Err(BrowseError::AlreadyInProgress);
        }

        info!("starting index update");
        let this = self.clone();
        tokio::spawn(async move { this.run().await });
        Ok(())
    }

    async fn run(self) {
        let _ = self.events.send(RefreshEvent::Started);

        let forwarders = match self.client.folders().await {
            Ok(folders) => folders
                .into_iter()
                .map(|(folder, _)| {
                    let progress = self.client.folder_progress(&folder.id);
                    tokio::spawn(forward_progress(progress, folder, self.events.clone()))
                })
                .collect(),
            Err(err) => {
                warn!(error = %format!("{:#}", err), "could not list folders for progress");
                Vec::new()
            }
        };

        // A panicking client must not leave the coordinator stuck in progress
        let client = Arc::clone(&self.client);
        let result = match tokio::spawn(async move { client.refresh().await }).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(BrowseError::Interrupted(format!("{:#}", err))),
            Err(join_err) => Err(BrowseError::Interrupted(join_err.to_string())),
        };

        for forwarder in forwarders {
            forwarder.abort();
        }

        self.state.store(COMPLETING, Ordering::SeqCst);
        let finished_at = Utc::now();
        *self
            .last_completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(finished_at);

        match &result {
            Ok(()) => info!("index update complete"),
            Err(err) => warn!(error = %err, "index update failed"),
        }
        // Still completing here, so no new update can start before this event
        let _ = self
            .events
            .send(RefreshEvent::Completed(RefreshCompletion {
                finished_at,
                result,
            }));
        self.state.store(IDLE, Ordering::SeqCst);
    }
}

async fn forward_progress(
    mut progress: watch::Receiver<u8>,
    folder: Folder,
    events: mpsc::UnboundedSender<RefreshEvent>,
) {
    while progress.changed().await.is_ok() {
        let percent = *progress.borrow_and_update();
        let event = RefreshEvent::Progress {
            folder: folder.id.clone(),
            label: folder.label.clone(),
            percent,
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryIndex;

    async fn next_completion(rx: &mut mpsc::UnboundedReceiver<RefreshEvent>) -> RefreshCompletion {
        loop {
            match rx.recv().await {
                Some(RefreshEvent::Completed(completion)) => return completion,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }

    fn index() -> Arc<MemoryIndex> {
        let index = MemoryIndex::new();
        index.add_folder("docs", "Documents");
        Arc::new(index)
    }

    #[tokio::test]
    async fn test_second_trigger_is_rejected_while_running() {
        let index = index();
        index.hold_refresh();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let coordinator = RefreshCoordinator::new(Arc::clone(&index), tx);

        coordinator.trigger().unwrap();
        assert_eq!(coordinator.trigger(), Err(BrowseError::AlreadyInProgress));
        assert_eq!(coordinator.state(), RefreshState::InProgress);

        index.release_refresh();
        let completion = next_completion(&mut rx).await;
        assert_eq!(completion.result, Ok(()));
        assert_eq!(coordinator.state(), RefreshState::Idle);
        assert_eq!(index.refresh_calls(), 1);

        // Exactly one completion for the accepted trigger
        tokio::time::sleep(Duration::from_millis(20)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, RefreshEvent::Completed(_)));
        }
    }

    #[tokio::test]
    async fn test_interrupted_refresh_resets_to_idle() {
        let index = index();
        index.interrupt_next_refresh("peer went away");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let coordinator = RefreshCoordinator::new(Arc::clone(&index), tx);

        coordinator.trigger().unwrap();
        let completion = next_completion(&mut rx).await;
        assert_eq!(
            completion.result,
            Err(BrowseError::Interrupted("peer went away".into()))
        );
        assert_eq!(coordinator.state(), RefreshState::Idle);
        assert_eq!(coordinator.last_completed(), Some(completion.finished_at));

        // Not stuck: a new refresh is accepted
        coordinator.trigger().unwrap();
        assert_eq!(next_completion(&mut rx).await.result, Ok(()));
    }

    #[tokio::test]
    async fn test_completion_precedes_next_start() {
        let index = index();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let coordinator = RefreshCoordinator::new(Arc::clone(&index), tx);

        // Retry as fast as possible so a trigger lands right after each run
        let retrier = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let mut accepted = 0;
                while accepted < 5 {
                    if coordinator.trigger().is_ok() {
                        accepted += 1;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut sequence = String::new();
        while sequence.matches('C').count() < 5 {
            match rx.recv().await.unwrap() {
                RefreshEvent::Started => sequence.push('S'),
                RefreshEvent::Completed(_) => sequence.push('C'),
                RefreshEvent::Progress { .. } => {}
            }
        }
        retrier.await.unwrap();
        assert_eq!(sequence, "SCSCSCSCSC");
    }

    #[tokio::test]
    async fn test_progress_is_forwarded() {
        let index = Arc::new(MemoryIndex::new().with_latency(Duration::from_millis(20)));
        index.add_folder("docs", "Documents");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let coordinator = RefreshCoordinator::new(Arc::clone(&index), tx);

        coordinator.trigger().unwrap();
        let mut seen = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                RefreshEvent::Progress { percent, label, .. } => {
                    assert_eq!(label, "Documents");
                    seen.push(percent);
                }
                RefreshEvent::Completed(_) => break,
                RefreshEvent::Started => {}
            }
        }
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_staleness() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let coordinator = RefreshCoordinator::new(index(), tx);
        assert!(coordinator.is_due(Duration::from_secs(600)));

        let coordinator = coordinator.with_last_completed(Some(Utc::now()));
        assert!(!coordinator.is_due(Duration::from_secs(600)));

        let coordinator = coordinator
            .with_last_completed(Some(Utc::now() - chrono::Duration::minutes(11)));
        assert!(coordinator.is_due(Duration::from_secs(600)));
    }

    #[test]
    fn test_event_descriptions() {
        let progress = RefreshEvent::Progress {
            folder: "docs".into(),
            label: "Documents".into(),
            percent: 40,
        };
        assert_eq!(
            progress.describe(),
            "index update, folder Documents 40% synchronized"
        );
        let failed = RefreshEvent::Completed(RefreshCompletion {
            finished_at: Utc::now(),
            result: Err(BrowseError::Interrupted("timeout".into())),
        });
        assert_eq!(
            failed.describe(),
            "error updating index: index update interrupted: timeout"
        );
    }
}
