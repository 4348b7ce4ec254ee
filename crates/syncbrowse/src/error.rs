//! Error taxonomy for the navigation core

use thiserror::Error;

/// Failures surfaced by the cache, the navigation engine and the refresh
/// coordinator.
///
/// Collaborators report failures as `anyhow::Error`; they are folded into one
/// of these variants at the core boundary so that background task results can
/// be cloned and handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrowseError {
    /// A listing was requested before the cache finished loading that path.
    #[error("listing for '{path}' requested before the cache was ready")]
    NotReady { path: String },

    /// Loading a directory into the cache failed.
    #[error("failed to load '{path}': {reason}")]
    MaterializationFailed { path: String, reason: String },

    #[error("index update already in progress")]
    AlreadyInProgress,

    #[error("index update interrupted: {0}")]
    Interrupted(String),

    /// An operation was attempted on a cache handle after `close()`.
    #[error("cache handle for folder '{0}' is closed")]
    HandleClosed(String),

    /// Only directories and the parent marker can be navigated into.
    #[error("'{0}' cannot be navigated into")]
    InvalidEntry(String),

    #[error("no folder is being browsed")]
    NotBrowsing,

    #[error("unknown folder '{0}'")]
    UnknownFolder(String),

    /// The folder list could not be fetched from the index client.
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),
}

pub type BrowseResult<T> = std::result::Result<T, BrowseError>;

impl BrowseError {
    pub(crate) fn materialization(path: &str, err: &anyhow::Error) -> Self {
        BrowseError::MaterializationFailed {
            path: path.to_string(),
            reason: format!("{:#}", err),
        }
    }

    /// Informational conditions are reported to the user but are not failures.
    pub fn is_informational(&self) -> bool {
        matches!(self, BrowseError::AlreadyInProgress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_already_in_progress_is_informational() {
        assert!(BrowseError::AlreadyInProgress.is_informational());
        assert!(!BrowseError::Interrupted("stopped".into()).is_informational());
        assert!(!BrowseError::NotBrowsing.is_informational());
    }

    #[test]
    fn test_materialization_keeps_context_chain() {
        let err = anyhow::anyhow!("connection reset").context("reading index");
        let browse = BrowseError::materialization("docs", &err);
        assert_eq!(
            browse.to_string(),
            "failed to load 'docs': reading index: connection reset"
        );
    }
}
