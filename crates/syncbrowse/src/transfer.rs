//! Background file transfers
//!
//! Uploads and downloads run on their own tasks, independent of navigation.
//! Each one reports exactly one [`TransferEvent`] on the queue's channel.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::model::Entry;
use crate::source::Transfers;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Downloaded { name: String, local: PathBuf },
    Uploaded { folder: String, path: String },
    Failed { name: String, reason: String },
}

impl TransferEvent {
    pub fn describe(&self) -> String {
        match self {
            TransferEvent::Downloaded { name, local } => {
                format!("downloaded {} to {}", name, local.display())
            }
            TransferEvent::Uploaded { path, .. } => format!("uploaded {}", path),
            TransferEvent::Failed { name, reason } => {
                format!("transfer of {} failed: {}", name, reason)
            }
        }
    }
}

pub struct TransferQueue<T> {
    backend: Arc<T>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl<T> Clone for TransferQueue<T> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            events: self.events.clone(),
        }
    }
}

impl<T: Transfers> TransferQueue<T> {
    pub fn new(backend: Arc<T>) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { backend, events }, rx)
    }

    pub fn download(&self, entry: Entry) {
        let backend = Arc::clone(&self.backend);
        let events = self.events.clone();
        info!(path = %entry.path, "starting download");
        tokio::spawn(async move {
            let event = match backend.download(&entry).await {
                Ok(local) => TransferEvent::Downloaded {
                    name: entry.name.clone(),
                    local,
                },
                Err(err) => failed(&entry.name, &err),
            };
            let _ = events.send(event);
        });
    }

    pub fn upload(&self, folder: &str, path: &str, source: PathBuf) {
        let backend = Arc::clone(&self.backend);
        let events = self.events.clone();
        let folder = folder.to_string();
        let path = path.to_string();
        info!(source = %source.display(), folder = %folder, path = %path, "starting upload");
        tokio::spawn(async move {
            let event = match backend.upload(&folder, &path, &source).await {
                Ok(path) => TransferEvent::Uploaded { folder, path },
                Err(err) => failed(&source.display().to_string(), &err),
            };
            let _ = events.send(event);
        });
    }
}

fn failed(name: &str, err: &anyhow::Error) -> TransferEvent {
    let reason = format!("{:#}", err);
    warn!(name, error = %reason, "transfer failed");
    TransferEvent::Failed {
        name: name.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryIndex;
    use crate::source::IndexSource;

    #[tokio::test]
    async fn test_download_reports_completion() {
        let index = Arc::new(MemoryIndex::new());
        index.add_folder("docs", "Documents");
        index.add_file("docs", "notes/todo.md", 10);
        let (queue, mut rx) = TransferQueue::new(Arc::clone(&index));

        queue.download(Entry::file("docs", "notes/todo.md", 10));
        assert_eq!(
            rx.recv().await.unwrap(),
            TransferEvent::Downloaded {
                name: "todo.md".into(),
                local: PathBuf::from("todo.md"),
            }
        );
        assert_eq!(index.downloads(), vec!["notes/todo.md".to_string()]);
    }

    #[tokio::test]
    async fn test_download_of_directory_fails() {
        let index = Arc::new(MemoryIndex::new());
        let (queue, mut rx) = TransferQueue::new(index);

        queue.download(Entry::directory("docs", "notes"));
        match rx.recv().await.unwrap() {
            TransferEvent::Failed { name, reason } => {
                assert_eq!(name, "notes");
                assert!(reason.contains("not a file"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upload_adds_entry() {
        let index = Arc::new(MemoryIndex::new());
        index.add_folder("docs", "Documents");
        let (queue, mut rx) = TransferQueue::new(Arc::clone(&index));

        queue.upload("docs", "notes", PathBuf::from("/tmp/report.pdf"));
        assert_eq!(
            rx.recv().await.unwrap(),
            TransferEvent::Uploaded {
                folder: "docs".into(),
                path: "notes/report.pdf".into(),
            }
        );
        assert!(index.entry("docs", "notes/report.pdf").await.unwrap().is_some());
    }
}
