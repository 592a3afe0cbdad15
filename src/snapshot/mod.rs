//! Per-file snapshot store.
//!
//! Each test file owns one store at `<dir>/snapshots/<basename>.snap`, a JSON
//! object keyed by `"<test name> #<n>"` where `n` counts the snapshot calls a
//! test makes. The main side keeps a [`SnapshotState`] per file; workers
//! record against a read-only baseline with a [`SnapshotRecorder`] and send
//! back a [`SnapshotDelta`].

pub mod recorder;

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use recorder::SnapshotRecorder;

/// Whether mismatching or missing snapshots may be written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePolicy {
    /// Record new snapshots and overwrite mismatches.
    All,
    /// Treat any mismatch or missing snapshot as a failure.
    #[default]
    None,
}

/// Snapshot entries a single test added or overwrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDelta {
    /// Number of snapshot calls per test name.
    pub counters: BTreeMap<String, usize>,
    pub added: BTreeMap<String, String>,
    pub updated: BTreeMap<String, String>,
}

impl SnapshotDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty()
    }
}

/// Errors reading or persisting a snapshot store.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to read snapshot file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot file {path} is not a valid store: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write snapshot file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Location of the snapshot store for a test file.
pub fn snapshot_path_for(test_file: &Path) -> PathBuf {
    let dir = test_file.parent().unwrap_or(Path::new("."));
    let base = test_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.join("snapshots").join(format!("{base}.snap"))
}

/// Store key for the `index`-th snapshot (1-based) of a test.
pub fn snapshot_key(test_name: &str, index: usize) -> String {
    format!("{test_name} #{index}")
}

/// True if `key` was produced by [`snapshot_key`] for `test_name`.
fn key_belongs_to(key: &str, test_name: &str) -> bool {
    key.strip_prefix(test_name)
        .and_then(|rest| rest.strip_prefix(" #"))
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Main-side state of one file's snapshot store.
#[derive(Debug)]
pub struct SnapshotState {
    path: PathBuf,
    policy: UpdatePolicy,
    baseline: Arc<BTreeMap<String, String>>,
    data: BTreeMap<String, String>,
    counters: BTreeMap<String, usize>,
    unchecked: BTreeSet<String>,
    dirty: bool,
    added: usize,
    updated: usize,
    removed: usize,
}

impl SnapshotState {
    /// Load the store at `path`. A missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the file exists but cannot be read or parsed.
    pub fn load(path: impl Into<PathBuf>, policy: UpdatePolicy) -> Result<Self, SnapshotError> {
        let path = path.into();
        let data: BTreeMap<String, String> = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|source| SnapshotError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(SnapshotError::Read { path, source }),
        };

        debug!(path = %path.display(), entries = data.len(), "loaded snapshot store");

        Ok(Self {
            unchecked: data.keys().cloned().collect(),
            baseline: Arc::new(data.clone()),
            data,
            path,
            policy,
            counters: BTreeMap::new(),
            dirty: false,
            added: 0,
            updated: 0,
            removed: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> UpdatePolicy {
        self.policy
    }

    pub fn data(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    /// The store as it was on disk, shared read-only with workers.
    pub fn baseline(&self) -> Arc<BTreeMap<String, String>> {
        Arc::clone(&self.baseline)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Counts of (added, updated, removed) entries so far.
    pub fn changes(&self) -> (usize, usize, usize) {
        (self.added, self.updated, self.removed)
    }

    /// Mark every stored entry of `test_name` as seen in this run.
    pub fn mark_checked_for_test(&mut self, test_name: &str) {
        self.unchecked.retain(|key| !key_belongs_to(key, test_name));
    }

    pub fn unchecked_count(&self) -> usize {
        self.unchecked.len()
    }

    /// Merge the entries a worker added or overwrote.
    pub fn absorb(&mut self, delta: SnapshotDelta) {
        if delta.is_empty() {
            return;
        }
        self.added += delta.added.len();
        self.updated += delta.updated.len();
        for (name, count) in delta.counters {
            let slot = self.counters.entry(name).or_default();
            *slot = (*slot).max(count);
        }
        self.data.extend(delta.added);
        self.data.extend(delta.updated);
        self.dirty = true;
    }

    /// Drop entries no test marked as checked. Only removes under
    /// [`UpdatePolicy::All`]; otherwise they are reported and kept.
    pub fn prune_unchecked(&mut self) -> Vec<String> {
        if self.unchecked.is_empty() {
            return Vec::new();
        }
        let obsolete: Vec<String> = std::mem::take(&mut self.unchecked).into_iter().collect();
        if self.policy != UpdatePolicy::All {
            warn!(
                path = %self.path.display(),
                count = obsolete.len(),
                "obsolete snapshots found; run with update enabled to remove them"
            );
            self.unchecked = obsolete.into_iter().collect();
            return Vec::new();
        }
        for key in &obsolete {
            self.data.remove(key);
        }
        self.removed += obsolete.len();
        self.dirty = true;
        debug!(path = %self.path.display(), removed = obsolete.len(), "pruned obsolete snapshots");
        obsolete
    }

    /// Persist the store if anything changed. An emptied store deletes the
    /// file. Returns whether the disk was touched.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Write`] if the file cannot be written or removed.
    pub fn save(&mut self) -> Result<bool, SnapshotError> {
        if !self.dirty {
            return Ok(false);
        }

        if self.data.is_empty() {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(SnapshotError::Write {
                        path: self.path.clone(),
                        source,
                    });
                }
            }
        } else {
            if let Some(dir) = self.path.parent() {
                std::fs::create_dir_all(dir).map_err(|source| SnapshotError::Write {
                    path: self.path.clone(),
                    source,
                })?;
            }
            let mut text = serde_json::to_string_pretty(&self.data).map_err(|source| {
                SnapshotError::Write {
                    path: self.path.clone(),
                    source: io::Error::other(source),
                }
            })?;
            text.push('\n');
            std::fs::write(&self.path, text).map_err(|source| SnapshotError::Write {
                path: self.path.clone(),
                source,
            })?;
        }

        self.dirty = false;
        debug!(path = %self.path.display(), entries = self.data.len(), "saved snapshot store");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(added: &[(&str, &str)], updated: &[(&str, &str)]) -> SnapshotDelta {
        SnapshotDelta {
            counters: BTreeMap::new(),
            added: added
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            updated: updated
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        }
    }

    fn write_store(path: &Path, entries: &[(&str, &str)]) {
        let map: BTreeMap<&str, &str> = entries.iter().copied().collect();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string(&map).unwrap()).unwrap();
    }

    // -- paths and keys --

    #[test]
    fn snapshot_path_sits_next_to_test_file() {
        let path = snapshot_path_for(Path::new("/work/tests/math.tests.yaml"));
        assert_eq!(
            path,
            PathBuf::from("/work/tests/snapshots/math.tests.yaml.snap")
        );
    }

    #[test]
    fn snapshot_key_format() {
        assert_eq!(snapshot_key("adds numbers", 2), "adds numbers #2");
    }

    #[test]
    fn key_ownership_is_exact() {
        assert!(key_belongs_to("login #1", "login"));
        assert!(key_belongs_to("login #12", "login"));
        assert!(!key_belongs_to("login page #1", "login"));
        assert!(!key_belongs_to("login #", "login"));
        assert!(!key_belongs_to("login #x", "login"));
    }

    // -- load --

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = SnapshotState::load(dir.path().join("none.snap"), UpdatePolicy::None).unwrap();
        assert!(state.data().is_empty());
        assert_eq!(state.unchecked_count(), 0);
        assert!(!state.is_dirty());
    }

    #[test]
    fn load_corrupt_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.snap");
        std::fs::write(&path, "not json").unwrap();
        let err = SnapshotState::load(&path, UpdatePolicy::None).unwrap_err();
        assert!(matches!(err, SnapshotError::Parse { .. }));
    }

    #[test]
    fn loaded_entries_start_unchecked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.snap");
        write_store(&path, &[("a #1", "1"), ("a #2", "2"), ("b #1", "3")]);

        let mut state = SnapshotState::load(&path, UpdatePolicy::All).unwrap();
        assert_eq!(state.unchecked_count(), 3);
        state.mark_checked_for_test("a");
        assert_eq!(state.unchecked_count(), 1);
        assert_eq!(state.baseline().len(), 3);
    }

    // -- absorb / prune / save --

    #[test]
    fn absorb_merges_and_marks_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = SnapshotState::load(dir.path().join("s.snap"), UpdatePolicy::All).unwrap();
        state.absorb(delta(&[("a #1", "x")], &[]));
        assert!(state.is_dirty());
        assert_eq!(state.data()["a #1"], "x");
        assert_eq!(state.changes(), (1, 0, 0));
    }

    #[test]
    fn absorb_empty_delta_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = SnapshotState::load(dir.path().join("s.snap"), UpdatePolicy::All).unwrap();
        state.absorb(SnapshotDelta::default());
        assert!(!state.is_dirty());
    }

    #[test]
    fn prune_removes_unchecked_under_update_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.snap");
        write_store(&path, &[("kept #1", "1"), ("gone #1", "2")]);

        let mut state = SnapshotState::load(&path, UpdatePolicy::All).unwrap();
        state.mark_checked_for_test("kept");
        let removed = state.prune_unchecked();
        assert_eq!(removed, vec!["gone #1".to_owned()]);
        assert!(state.save().unwrap());

        let reloaded = SnapshotState::load(&path, UpdatePolicy::None).unwrap();
        assert_eq!(reloaded.data().len(), 1);
        assert!(reloaded.data().contains_key("kept #1"));
    }

    #[test]
    fn prune_keeps_unchecked_without_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.snap");
        write_store(&path, &[("gone #1", "2")]);

        let mut state = SnapshotState::load(&path, UpdatePolicy::None).unwrap();
        assert!(state.prune_unchecked().is_empty());
        assert_eq!(state.unchecked_count(), 1);
        assert!(!state.save().unwrap());
        assert!(path.exists());
    }

    #[test]
    fn save_without_changes_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots").join("s.snap");
        let mut state = SnapshotState::load(&path, UpdatePolicy::All).unwrap();
        assert!(!state.save().unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn save_creates_snapshot_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots").join("s.snap");
        let mut state = SnapshotState::load(&path, UpdatePolicy::All).unwrap();
        state.absorb(delta(&[("t #1", "value")], &[]));
        assert!(state.save().unwrap());
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"t #1\": \"value\""));
    }

    #[test]
    fn pruning_everything_deletes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.snap");
        write_store(&path, &[("old #1", "1")]);

        let mut state = SnapshotState::load(&path, UpdatePolicy::All).unwrap();
        state.prune_unchecked();
        assert!(state.save().unwrap());
        assert!(!path.exists());
    }
}
