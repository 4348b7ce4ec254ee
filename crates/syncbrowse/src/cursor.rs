//! Browsing position inside a folder and slash-separated path helpers

use crate::error::{BrowseError, BrowseResult};
use crate::model::{Entry, PARENT_PATH, ROOT_PATH};

/// Current folder plus the path being shown inside it.
///
/// Cursors are values: navigation produces a new cursor instead of mutating
/// the old one, so the engine can compare "where we were" with "where we are"
/// after an asynchronous wait.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathCursor {
    folder: String,
    path: String,
}

impl PathCursor {
    pub fn root(folder: &str) -> Self {
        Self {
            folder: folder.to_string(),
            path: ROOT_PATH.to_string(),
        }
    }

    pub fn new(folder: &str, path: &str) -> Self {
        Self {
            folder: folder.to_string(),
            path: normalize(path),
        }
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn at_root(&self) -> bool {
        self.path == ROOT_PATH
    }

    /// Last path component, empty at the folder root.
    pub fn file_name(&self) -> &str {
        file_name(&self.path)
    }

    pub fn is_parent_marker(entry: &Entry) -> bool {
        entry.is_parent_marker() || is_parent(&entry.path)
    }

    /// Cursor reached by opening `entry` from this position.
    ///
    /// The parent marker ascends one level (staying put at the root); a
    /// directory descends to its path. Files are rejected.
    pub fn resolve(&self, entry: &Entry) -> BrowseResult<PathCursor> {
        if Self::is_parent_marker(entry) {
            return Ok(Self {
                folder: self.folder.clone(),
                path: parent_of(&self.path).to_string(),
            });
        }

        if !entry.is_directory() {
            return Err(BrowseError::InvalidEntry(entry.path.clone()));
        }

        if entry.folder != self.folder {
            return Err(BrowseError::InvalidEntry(format!(
                "{}:{}",
                entry.folder, entry.path
            )));
        }

        Ok(Self::new(&self.folder, &entry.path))
    }
}

/// Whether `path` denotes the parent marker.
pub fn is_parent(path: &str) -> bool {
    path == PARENT_PATH || path.ends_with("/..")
}

/// Strip leading, trailing and repeated slashes.
pub fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

pub fn parent_of(path: &str) -> &str {
    path.rsplit_once('/')
        .map(|(parent, _)| parent)
        .unwrap_or(ROOT_PATH)
}

pub fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// `path` itself followed by each ancestor, ending with the root.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut next = Some(path);
    std::iter::from_fn(move || {
        let current = next?;
        next = if current.is_empty() {
            None
        } else {
            Some(parent_of(current))
        };
        Some(current)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cursor() {
        let cursor = PathCursor::root("docs");
        assert!(cursor.at_root());
        assert_eq!(cursor.file_name(), "");
    }

    #[test]
    fn test_resolve_descends_into_directory() {
        let cursor = PathCursor::root("docs");
        let next = cursor
            .resolve(&Entry::directory("docs", "reports"))
            .unwrap();
        assert_eq!(next.path(), "reports");

        let deeper = next
            .resolve(&Entry::directory("docs", "reports/2024"))
            .unwrap();
        assert_eq!(deeper.path(), "reports/2024");
        assert_eq!(deeper.file_name(), "2024");
    }

    #[test]
    fn test_resolve_parent_marker_ascends() {
        let cursor = PathCursor::new("docs", "reports/2024");
        let up = cursor.resolve(&Entry::parent_marker("docs")).unwrap();
        assert_eq!(up.path(), "reports");
        let top = up.resolve(&Entry::parent_marker("docs")).unwrap();
        assert!(top.at_root());
        // Ascending from the root stays at the root
        let still_top = top.resolve(&Entry::parent_marker("docs")).unwrap();
        assert!(still_top.at_root());
    }

    #[test]
    fn test_resolve_rejects_files() {
        let cursor = PathCursor::root("docs");
        let err = cursor
            .resolve(&Entry::file("docs", "notes.txt", 3))
            .unwrap_err();
        assert_eq!(err, BrowseError::InvalidEntry("notes.txt".into()));
    }

    #[test]
    fn test_resolve_rejects_entries_from_other_folders() {
        let cursor = PathCursor::root("docs");
        let result = cursor.resolve(&Entry::directory("music", "albums"));
        assert!(matches!(result, Err(BrowseError::InvalidEntry(_))));
    }

    #[test]
    fn test_is_parent() {
        assert!(is_parent(".."));
        assert!(is_parent("reports/.."));
        assert!(!is_parent("reports"));
        assert!(!is_parent("..hidden"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/reports//2024/"), "reports/2024");
        assert_eq!(normalize("./a/./b"), "a/b");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_ancestors_end_at_root() {
        let all: Vec<&str> = ancestors("a/b/c").collect();
        assert_eq!(all, vec!["a/b/c", "a/b", "a", ""]);
        let root: Vec<&str> = ancestors("").collect();
        assert_eq!(root, vec![""]);
    }

    #[test]
    fn test_join() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a/b", "c"), "a/b/c");
    }
}
