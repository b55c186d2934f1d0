//! Filesystem change fan-out.
//!
//! The embedding (or the sync adapter, when native watching is off) hands
//! the manager batches of [`FsChange`]s; this module turns one batch into
//! the per-root protocol events each session should see, applying the
//! configured ignore globs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};

use langmux_proto::types::{FileChangeType, FileEvent, path_to_uri};

/// One observed filesystem change, in editor terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsChange {
    Created(PathBuf),
    Changed(PathBuf),
    Deleted(PathBuf),
    /// A rename is delivered to servers as a delete of the old path plus a
    /// create of the new one; the two halves may land in different roots.
    Renamed { old: PathBuf, new: PathBuf },
}

/// Compiled ignore patterns for changed paths.
pub struct WatchFilter {
    ignore: GlobSet,
}

impl WatchFilter {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(
                Glob::new(pattern).with_context(|| format!("invalid watch ignore glob {pattern:?}"))?,
            );
        }
        Ok(Self {
            ignore: builder.build().context("compiling watch ignore globs")?,
        })
    }

    #[must_use]
    pub fn allows(&self, path: &Path) -> bool {
        !self.ignore.is_match(path)
    }
}

/// Project one batch of changes onto a single root. Paths outside the root
/// or matching the filter are dropped; paths that fail URI conversion are
/// skipped rather than failing the batch.
#[must_use]
pub fn events_for_root(changes: &[FsChange], root: &Path, filter: &WatchFilter) -> Vec<FileEvent> {
    let mut events = Vec::new();
    let mut push = |path: &Path, change_type: FileChangeType| {
        if !path.starts_with(root) || !filter.allows(path) {
            return;
        }
        match path_to_uri(path) {
            Ok(uri) => events.push(FileEvent {
                uri,
                change_type,
            }),
            Err(e) => tracing::debug!(path = %path.display(), "skipping watched path: {e}"),
        }
    };

    for change in changes {
        match change {
            FsChange::Created(path) => push(path, FileChangeType::Created),
            FsChange::Changed(path) => push(path, FileChangeType::Changed),
            FsChange::Deleted(path) => push(path, FileChangeType::Deleted),
            FsChange::Renamed { old, new } => {
                push(old, FileChangeType::Deleted);
                push(new, FileChangeType::Created);
            }
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(patterns: &[&str]) -> WatchFilter {
        let patterns: Vec<String> = patterns.iter().map(|s| (*s).to_string()).collect();
        WatchFilter::new(&patterns).unwrap()
    }

    #[test]
    fn invalid_glob_is_rejected() {
        assert!(WatchFilter::new(&["[".to_string()]).is_err());
    }

    #[test]
    fn changes_outside_the_root_are_dropped() {
        let changes = vec![
            FsChange::Changed(PathBuf::from("/work/a/src/lib.rs")),
            FsChange::Changed(PathBuf::from("/work/b/src/lib.rs")),
        ];
        let events = events_for_root(&changes, Path::new("/work/a"), &filter(&[]));
        assert_eq!(events.len(), 1);
        assert!(events[0].uri.ends_with("/work/a/src/lib.rs"));
        assert_eq!(events[0].change_type, FileChangeType::Changed);
    }

    #[test]
    fn ignore_globs_suppress_events() {
        let changes = vec![
            FsChange::Created(PathBuf::from("/work/.git/index")),
            FsChange::Created(PathBuf::from("/work/src/main.rs")),
        ];
        let events = events_for_root(&changes, Path::new("/work"), &filter(&["**/.git/**"]));
        assert_eq!(events.len(), 1);
        assert!(events[0].uri.ends_with("main.rs"));
    }

    #[test]
    fn rename_splits_into_delete_and_create() {
        let changes = vec![FsChange::Renamed {
            old: PathBuf::from("/work/old.rs"),
            new: PathBuf::from("/work/new.rs"),
        }];
        let events = events_for_root(&changes, Path::new("/work"), &filter(&[]));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].change_type, FileChangeType::Deleted);
        assert!(events[0].uri.ends_with("old.rs"));
        assert_eq!(events[1].change_type, FileChangeType::Created);
        assert!(events[1].uri.ends_with("new.rs"));
    }

    #[test]
    fn rename_across_roots_delivers_only_the_local_half() {
        let changes = vec![FsChange::Renamed {
            old: PathBuf::from("/work/a/f.rs"),
            new: PathBuf::from("/work/b/f.rs"),
        }];
        let events = events_for_root(&changes, Path::new("/work/b"), &filter(&[]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_type, FileChangeType::Created);
    }
}
