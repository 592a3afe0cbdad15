use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::snapshot::SnapshotDelta;

/// The bucket a settled test lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Passed,
    Failed,
    Warnings,
    Skipped,
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Warnings => write!(f, "warning"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// How a test body that returned normally wants to be classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    Passed,
    /// The test called `skip` from inside its body.
    Skipped(String),
    /// The test called `warn` from inside its body.
    Warned(String),
}

/// Result of the `test` task, returned from an execution worker.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub status: OutcomeStatus,
    pub duration: Duration,
    pub snapshots: SnapshotDelta,
}

impl TestOutcome {
    /// Create a passing outcome with no snapshot changes.
    pub fn passed(duration: Duration) -> Self {
        Self {
            status: OutcomeStatus::Passed,
            duration,
            snapshots: SnapshotDelta::default(),
        }
    }
}

/// Error thrown by a test task. Crosses the worker boundary by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TestFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    /// Attach extra context, e.g. captured stderr.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Assertion, message)
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("test reached timeout of {} milliseconds", timeout.as_millis()),
        )
    }

    pub fn no_assertions() -> Self {
        Self::new(FailureKind::NoAssertions, "no assertions made")
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "test cancelled")
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == FailureKind::Timeout
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TestFailure {}

/// Classification of per-test failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An assertion made through the test context did not hold.
    Assertion,
    /// The body did not settle before the configured timeout.
    Timeout,
    /// A stored snapshot did not match and updates were not allowed.
    SnapshotMismatch,
    /// The body neither asserted nor called `pass`.
    NoAssertions,
    /// The body called `fail`.
    Manual,
    /// The body, a loader, or a hook panicked.
    Panic,
    /// A `beforeEach`/`afterEach` hook failed.
    Hook,
    /// In-test `skip`/`warn` halting the body; never reported as a failure.
    Halted,
    /// The task observed cancellation and bailed out.
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assertion => write!(f, "assertion failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::SnapshotMismatch => write!(f, "snapshot mismatch"),
            Self::NoAssertions => write!(f, "no assertions"),
            Self::Manual => write!(f, "manual failure"),
            Self::Panic => write!(f, "panic"),
            Self::Hook => write!(f, "hook failed"),
            Self::Halted => write!(f, "halted"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Render a panic payload caught from a worker thread.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked with a non-string payload".to_owned()
    }
}
