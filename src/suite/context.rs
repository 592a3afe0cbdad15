use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::runner::cancel::InterruptHandle;
use crate::runner::context::FileInfo;
use crate::runner::result::{FailureKind, OutcomeStatus, TestFailure};
use crate::snapshot::{SnapshotDelta, SnapshotRecorder};
use crate::suite::TestDescriptor;

/// How often a cancellable sleep re-checks for cancellation.
const SLEEP_SLICE: Duration = Duration::from_millis(10);
/// Stands in for deadlines too far out to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(start: Instant, duration: Duration) -> Instant {
    start
        .checked_add(duration)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Per-test data shared between `beforeEach`/`afterEach` hooks and the body.
#[derive(Debug, Clone)]
pub struct TestScope {
    pub file: Arc<FileInfo>,
    pub test: TestDescriptor,
    /// Free-form values hooks hand to the body and to each other.
    pub state: HashMap<String, serde_json::Value>,
}

impl TestScope {
    pub fn new(file: Arc<FileInfo>, test: TestDescriptor) -> Self {
        Self {
            file,
            test,
            state: HashMap::new(),
        }
    }
}

/// An explicit verdict the body asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Pass(String),
    Fail(String),
    Skip(String),
    Warn(String),
}

/// The object a test body receives.
///
/// Assertions, snapshot matching and the explicit verdict calls all go
/// through here so the worker can tell afterwards whether the test checked
/// anything at all.
pub struct TestContext {
    scope: TestScope,
    timeout: Duration,
    started: Instant,
    cancel: CancellationToken,
    interrupt: Option<InterruptHandle>,
    snapshots: SnapshotRecorder,
    assertions: usize,
    verdict: Option<Verdict>,
    suppressed: Vec<TestFailure>,
}

impl TestContext {
    pub fn new(
        scope: TestScope,
        timeout: Duration,
        cancel: CancellationToken,
        snapshots: SnapshotRecorder,
    ) -> Self {
        Self {
            scope,
            timeout,
            started: Instant::now(),
            cancel,
            interrupt: None,
            snapshots,
            assertions: 0,
            verdict: None,
            suppressed: Vec::new(),
        }
    }

    pub fn with_interrupt(mut self, interrupt: InterruptHandle) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub fn test(&self) -> &TestDescriptor {
        &self.scope.test
    }

    pub fn file(&self) -> &FileInfo {
        &self.scope.file
    }

    pub fn state(&self) -> &HashMap<String, serde_json::Value> {
        &self.scope.state
    }

    pub fn state_mut(&mut self) -> &mut HashMap<String, serde_json::Value> {
        &mut self.scope.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// When the timeout race will cancel this test.
    pub fn deadline(&self) -> Instant {
        deadline_after(self.started, self.timeout)
    }

    /// True once the run cancelled this test or its timeout elapsed.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn assertions(&self) -> usize {
        self.assertions
    }

    // -- assertions --

    /// # Errors
    ///
    /// Returns an assertion failure carrying `message` when `condition` is false.
    pub fn assert(&mut self, condition: bool, message: impl Into<String>) -> Result<(), TestFailure> {
        self.assertions += 1;
        if condition {
            Ok(())
        } else {
            Err(TestFailure::assertion(message))
        }
    }

    /// # Errors
    ///
    /// Returns an assertion failure when `actual != expected`.
    pub fn assert_eq<T: PartialEq + Debug>(&mut self, actual: T, expected: T) -> Result<(), TestFailure> {
        self.assertions += 1;
        if actual == expected {
            Ok(())
        } else {
            Err(TestFailure::assertion(format!(
                "expected {expected:?}, received {actual:?}"
            )))
        }
    }

    /// # Errors
    ///
    /// Returns an assertion failure when `actual == unexpected`.
    pub fn assert_ne<T: PartialEq + Debug>(&mut self, actual: T, unexpected: T) -> Result<(), TestFailure> {
        self.assertions += 1;
        if actual == unexpected {
            Err(TestFailure::assertion(format!(
                "expected a value other than {unexpected:?}"
            )))
        } else {
            Ok(())
        }
    }

    /// Compare `value`, rendered as pretty JSON, with this test's next
    /// stored snapshot. A mismatch does not stop the body; it is reported
    /// once the body returns.
    pub fn match_snapshot<T: Serialize>(&mut self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => self.match_snapshot_str(&text),
            Err(e) => {
                self.assertions += 1;
                self.suppressed.push(TestFailure::new(
                    FailureKind::SnapshotMismatch,
                    format!("value cannot be serialized for a snapshot: {e}"),
                ));
            }
        }
    }

    /// Like [`match_snapshot`](Self::match_snapshot) for raw text.
    pub fn match_snapshot_str(&mut self, text: &str) {
        self.assertions += 1;
        if let Err(failure) = self.snapshots.check(text) {
            self.suppressed.push(failure);
        }
    }

    // -- explicit verdicts --

    /// Mark the test failed. Return the result from the body to stop early.
    pub fn fail(&mut self, reason: impl Into<String>) -> TestFailure {
        let reason = non_empty(reason.into(), "manual failure");
        self.verdict = Some(Verdict::Fail(reason.clone()));
        TestFailure::new(FailureKind::Manual, reason)
    }

    /// Mark the test passed even though it made no assertions.
    pub fn pass(&mut self, reason: impl Into<String>) {
        if !matches!(self.verdict, Some(Verdict::Fail(_))) {
            self.verdict = Some(Verdict::Pass(non_empty(reason.into(), "manual pass")));
        }
    }

    /// Skip the test from inside its body. Return the result to stop early.
    pub fn skip(&mut self, reason: impl Into<String>) -> TestFailure {
        let reason = non_empty(reason.into(), "in-test skip");
        self.verdict = Some(Verdict::Skip(reason.clone()));
        TestFailure::new(FailureKind::Halted, reason)
    }

    /// Downgrade the test to a warning. Return the result to stop early.
    pub fn warn(&mut self, reason: impl Into<String>) -> TestFailure {
        let reason = non_empty(reason.into(), "in-test warn");
        self.verdict = Some(Verdict::Warn(reason.clone()));
        TestFailure::new(FailureKind::Halted, reason)
    }

    // -- time and cancellation --

    /// Sleep, waking early if the test is cancelled.
    ///
    /// # Errors
    ///
    /// Returns a cancellation failure if the test was cancelled meanwhile.
    pub fn sleep(&self, duration: Duration) -> Result<(), TestFailure> {
        let deadline = deadline_after(Instant::now(), duration);
        loop {
            if self.cancel.is_cancelled() {
                return Err(TestFailure::cancelled());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    /// Forward an interrupt to the run, as if the user pressed Ctrl-C.
    pub fn request_interrupt(&self) {
        if let Some(interrupt) = &self.interrupt {
            interrupt.interrupt();
        }
    }

    /// Settle the body's return value into an outcome and hand the scope
    /// back for `afterEach`.
    pub(crate) fn finish(
        self,
        result: Result<(), TestFailure>,
    ) -> (TestScope, Result<(OutcomeStatus, SnapshotDelta), TestFailure>) {
        let outcome = match self.verdict {
            Some(Verdict::Skip(why)) => Ok(OutcomeStatus::Skipped(why)),
            Some(Verdict::Warn(why)) => Ok(OutcomeStatus::Warned(why)),
            Some(Verdict::Fail(why)) => Err(TestFailure::new(FailureKind::Manual, why)),
            verdict => match result {
                Err(failure) => Err(failure),
                Ok(()) => {
                    if let Some(first) = self.suppressed.into_iter().next() {
                        Err(first)
                    } else if verdict.is_none() && self.assertions == 0 {
                        Err(TestFailure::no_assertions())
                    } else {
                        Ok(OutcomeStatus::Passed)
                    }
                }
            },
        };
        let delta = self.snapshots.into_delta();
        (self.scope, outcome.map(|status| (status, delta)))
    }
}

fn non_empty(reason: String, fallback: &str) -> String {
    if reason.is_empty() {
        fallback.to_owned()
    } else {
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use crate::snapshot::UpdatePolicy;

    fn make_context(policy: UpdatePolicy) -> TestContext {
        let file = Arc::new(FileInfo::new(PathBuf::from("/work/a.tests.yaml"), "/work".as_ref()));
        let scope = TestScope::new(file, TestDescriptor::new("ctx"));
        let recorder = SnapshotRecorder::new("ctx", policy, Arc::new(BTreeMap::new()));
        TestContext::new(scope, Duration::from_secs(1), CancellationToken::new(), recorder)
    }

    fn finish(ctx: TestContext, result: Result<(), TestFailure>) -> Result<OutcomeStatus, TestFailure> {
        ctx.finish(result).1.map(|(status, _)| status)
    }

    #[test]
    fn unbounded_timeout_has_a_future_deadline() {
        let file = Arc::new(FileInfo::new(PathBuf::from("/work/a.tests.yaml"), "/work".as_ref()));
        let scope = TestScope::new(file, TestDescriptor::new("ctx"));
        let recorder = SnapshotRecorder::new("ctx", UpdatePolicy::None, Arc::new(BTreeMap::new()));
        let ctx = TestContext::new(scope, Duration::MAX, CancellationToken::new(), recorder);
        assert!(ctx.deadline() > Instant::now());
        assert_eq!(ctx.timeout(), Duration::MAX);
    }

    #[test]
    fn no_assertions_fails() {
        let ctx = make_context(UpdatePolicy::None);
        let err = finish(ctx, Ok(())).unwrap_err();
        assert_eq!(err.message, "no assertions made");
    }

    #[test]
    fn assertion_counts_toward_pass() {
        let mut ctx = make_context(UpdatePolicy::None);
        ctx.assert(true, "holds").unwrap();
        assert_eq!(ctx.assertions(), 1);
        assert_eq!(finish(ctx, Ok(())).unwrap(), OutcomeStatus::Passed);
    }

    #[test]
    fn assert_eq_reports_both_values() {
        let mut ctx = make_context(UpdatePolicy::None);
        let err = ctx.assert_eq(3, 2).unwrap_err();
        assert_eq!(err.message, "expected 2, received 3");
        assert!(ctx.assert_ne(1, 2).is_ok());
    }

    #[test]
    fn explicit_pass_needs_no_assertions() {
        let mut ctx = make_context(UpdatePolicy::None);
        ctx.pass("");
        assert_eq!(finish(ctx, Ok(())).unwrap(), OutcomeStatus::Passed);
    }

    #[test]
    fn explicit_fail_wins_over_clean_return() {
        let mut ctx = make_context(UpdatePolicy::None);
        let _ = ctx.fail("");
        ctx.pass("too late");
        let err = finish(ctx, Ok(())).unwrap_err();
        assert_eq!(err.kind, FailureKind::Manual);
        assert_eq!(err.message, "manual failure");
    }

    #[test]
    fn in_test_skip_and_warn() {
        let mut ctx = make_context(UpdatePolicy::None);
        let halted = ctx.skip("not today");
        assert_eq!(
            finish(ctx, Err(halted)).unwrap(),
            OutcomeStatus::Skipped("not today".into())
        );

        let mut ctx = make_context(UpdatePolicy::None);
        let halted = ctx.warn("");
        assert_eq!(
            finish(ctx, Err(halted)).unwrap(),
            OutcomeStatus::Warned("in-test warn".into())
        );
    }

    #[test]
    fn body_error_is_returned() {
        let ctx = make_context(UpdatePolicy::None);
        let err = finish(ctx, Err(TestFailure::assertion("boom"))).unwrap_err();
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn snapshot_mismatch_is_suppressed_until_finish() {
        let mut ctx = make_context(UpdatePolicy::None);
        ctx.match_snapshot_str("new value");
        assert_eq!(ctx.assertions(), 1);
        let err = finish(ctx, Ok(())).unwrap_err();
        assert_eq!(err.kind, FailureKind::SnapshotMismatch);
    }

    #[test]
    fn snapshot_added_under_update_all() {
        let mut ctx = make_context(UpdatePolicy::All);
        ctx.match_snapshot(&serde_json::json!({ "a": 1 }));
        let (_, result) = ctx.finish(Ok(()));
        let (status, delta) = result.unwrap();
        assert_eq!(status, OutcomeStatus::Passed);
        assert!(delta.added.contains_key("ctx #1"));
    }

    #[test]
    fn sleep_wakes_on_cancel() {
        let ctx = make_context(UpdatePolicy::None);
        ctx.cancel.cancel();
        let err = ctx.sleep(Duration::from_secs(5)).unwrap_err();
        assert_eq!(err.kind, FailureKind::Cancelled);
    }

    #[test]
    fn sleep_completes() {
        let ctx = make_context(UpdatePolicy::None);
        assert!(ctx.sleep(Duration::from_millis(5)).is_ok());
        assert!(ctx.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn finish_returns_scope_with_state() {
        let mut ctx = make_context(UpdatePolicy::None);
        ctx.state_mut().insert("k".into(), serde_json::json!("v"));
        ctx.pass("ok");
        let (scope, _) = ctx.finish(Ok(()));
        assert_eq!(scope.state["k"], "v");
    }
}
