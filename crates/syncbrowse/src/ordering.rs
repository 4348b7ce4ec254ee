//! Listing order for cached directory entries

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::model::Entry;

/// Pluggable comparator used by the folder cache when building a listing.
#[derive(Clone)]
pub struct EntryComparator(Arc<dyn Fn(&Entry, &Entry) -> Ordering + Send + Sync>);

impl EntryComparator {
    pub fn new<F>(compare: F) -> Self
    where
        F: Fn(&Entry, &Entry) -> Ordering + Send + Sync + 'static,
    {
        Self(Arc::new(compare))
    }

    pub fn compare(&self, a: &Entry, b: &Entry) -> Ordering {
        (self.0)(a, b)
    }

    pub fn sort(&self, entries: &mut [Entry]) {
        entries.sort_by(|a, b| self.compare(a, b));
    }
}

impl fmt::Debug for EntryComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EntryComparator")
    }
}

impl Default for EntryComparator {
    fn default() -> Self {
        SortMode::default().comparator()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    #[default]
    AlphaAscDirFirst,
    AlphaDescDirFirst,
    LastModifiedDesc,
}

impl SortMode {
    pub fn toggle(&self) -> Self {
        match self {
            SortMode::AlphaAscDirFirst => SortMode::AlphaDescDirFirst,
            SortMode::AlphaDescDirFirst => SortMode::LastModifiedDesc,
            SortMode::LastModifiedDesc => SortMode::AlphaAscDirFirst,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SortMode::AlphaAscDirFirst => "Alphabetical, directories first",
            SortMode::AlphaDescDirFirst => "Reverse alphabetical, directories first",
            SortMode::LastModifiedDesc => "Most recently modified first",
        }
    }

    pub fn comparator(self) -> EntryComparator {
        match self {
            SortMode::AlphaAscDirFirst => {
                EntryComparator::new(|a, b| dirs_first(a, b).then_with(|| a.name.cmp(&b.name)))
            }
            SortMode::AlphaDescDirFirst => {
                EntryComparator::new(|a, b| dirs_first(a, b).then_with(|| b.name.cmp(&a.name)))
            }
            SortMode::LastModifiedDesc => EntryComparator::new(|a, b| {
                dirs_first(a, b)
                    .then_with(|| b.modified_at.cmp(&a.modified_at))
                    .then_with(|| a.name.cmp(&b.name))
            }),
        }
    }
}

/// Directories (and the parent marker) before files.
pub fn dirs_first(a: &Entry, b: &Entry) -> Ordering {
    b.is_directory().cmp(&a.is_directory())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn names(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    fn sample() -> Vec<Entry> {
        vec![
            Entry::file("f", "b.txt", 1),
            Entry::directory("f", "Zoo"),
            Entry::file("f", "a.txt", 1),
            Entry::directory("f", "apps"),
            Entry::file("f", "B.txt", 1),
        ]
    }

    #[test]
    fn test_alpha_asc_dirs_first_is_case_sensitive() {
        let mut entries = sample();
        SortMode::AlphaAscDirFirst.comparator().sort(&mut entries);
        assert_eq!(names(&entries), vec!["Zoo", "apps", "B.txt", "a.txt", "b.txt"]);
    }

    #[test]
    fn test_alpha_desc_keeps_dirs_first() {
        let mut entries = sample();
        SortMode::AlphaDescDirFirst.comparator().sort(&mut entries);
        assert_eq!(names(&entries), vec!["apps", "Zoo", "b.txt", "a.txt", "B.txt"]);
    }

    #[test]
    fn test_last_modified_desc() {
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut entries = vec![
            Entry::file("f", "old.txt", 1).with_modified(old),
            Entry::file("f", "new.txt", 1).with_modified(new),
            Entry::directory("f", "dir"),
        ];
        SortMode::LastModifiedDesc.comparator().sort(&mut entries);
        assert_eq!(names(&entries), vec!["dir", "new.txt", "old.txt"]);
    }

    #[test]
    fn test_custom_comparator() {
        let by_size = EntryComparator::new(|a, b| b.size.cmp(&a.size));
        let mut entries = vec![Entry::file("f", "small", 1), Entry::file("f", "big", 100)];
        by_size.sort(&mut entries);
        assert_eq!(names(&entries), vec!["big", "small"]);
    }

    #[test]
    fn test_sort_mode_toggle_cycles() {
        let mode = SortMode::AlphaAscDirFirst;
        assert_eq!(mode.toggle(), SortMode::AlphaDescDirFirst);
        assert_eq!(mode.toggle().toggle(), SortMode::LastModifiedDesc);
        assert_eq!(mode.toggle().toggle().toggle(), mode);
    }
}
