use std::collections::BTreeMap;
use std::sync::Arc;

use crate::runner::result::{FailureKind, TestFailure};
use crate::snapshot::{SnapshotDelta, UpdatePolicy, snapshot_key};

/// Worker-side snapshot matcher for a single test.
///
/// Compares against the file's on-disk baseline and collects the entries it
/// would add or overwrite. Nothing is written here; the delta goes back to the
/// coordinator, which owns the store.
#[derive(Debug, Clone)]
pub struct SnapshotRecorder {
    test_name: String,
    policy: UpdatePolicy,
    baseline: Arc<BTreeMap<String, String>>,
    calls: usize,
    added: BTreeMap<String, String>,
    updated: BTreeMap<String, String>,
}

impl SnapshotRecorder {
    pub fn new(
        test_name: impl Into<String>,
        policy: UpdatePolicy,
        baseline: Arc<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            test_name: test_name.into(),
            policy,
            baseline,
            calls: 0,
            added: BTreeMap::new(),
            updated: BTreeMap::new(),
        }
    }

    /// Number of snapshot comparisons made so far.
    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Compare `received` against the next snapshot slot for this test.
    ///
    /// # Errors
    ///
    /// Returns a [`FailureKind::SnapshotMismatch`] failure when the stored value
    /// differs, or is missing, and the policy forbids writing.
    pub fn check(&mut self, received: &str) -> Result<(), TestFailure> {
        self.calls += 1;
        let key = snapshot_key(&self.test_name, self.calls);

        match self.baseline.get(&key) {
            Some(expected) if expected == received => Ok(()),
            Some(expected) => match self.policy {
                UpdatePolicy::All => {
                    self.updated.insert(key, received.to_owned());
                    Ok(())
                }
                UpdatePolicy::None => Err(TestFailure::new(
                    FailureKind::SnapshotMismatch,
                    format!("snapshot \"{key}\" does not match"),
                )
                .with_detail(format!("- {expected}\n+ {received}"))),
            },
            None => match self.policy {
                UpdatePolicy::All => {
                    self.added.insert(key, received.to_owned());
                    Ok(())
                }
                UpdatePolicy::None => Err(TestFailure::new(
                    FailureKind::SnapshotMismatch,
                    format!(
                        "snapshot \"{key}\" was not written; run with snapshot updates enabled to record it"
                    ),
                )),
            },
        }
    }

    /// Hand back what this test added or overwrote.
    pub fn into_delta(self) -> SnapshotDelta {
        let mut counters = BTreeMap::new();
        if self.calls > 0 {
            counters.insert(self.test_name, self.calls);
        }
        SnapshotDelta {
            counters,
            added: self.added,
            updated: self.updated,
        }
    }
}
