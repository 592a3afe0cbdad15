use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::plugin::HookPipeline;
use crate::runner::cancel::InterruptHandle;
use crate::runner::context::{FileInfo, TestRecord};
use crate::runner::pool::PoolError;
use crate::runner::result::{
    Bucket, FailureKind, OutcomeStatus, TestFailure, TestOutcome, panic_message,
};
use crate::snapshot::{SnapshotDelta, SnapshotRecorder, UpdatePolicy};
use crate::suite::{TestContext, TestDescriptor, TestFn, TestScope};

/// What the coordinator does with a registered test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The run already failed fast: neither dispatched nor recorded.
    Suppressed,
    /// Recorded as skipped without running.
    Skipped,
    Dispatch,
}

/// Skip precedence: fast failure, then `only` elsewhere in the file, then
/// the test's own `skip` flag.
pub fn disposition(test: &TestDescriptor, file_has_only: bool, has_fast_failure: bool) -> Disposition {
    if has_fast_failure {
        Disposition::Suppressed
    } else if file_has_only && !test.only {
        Disposition::Skipped
    } else if test.skip {
        Disposition::Skipped
    } else {
        Disposition::Dispatch
    }
}

/// Everything the `test` task needs. Workers get their own copy.
#[derive(Clone)]
pub struct TestJob {
    pub scope: TestScope,
    pub body: TestFn,
    pub timeout: Duration,
    pub policy: UpdatePolicy,
    /// The file's snapshot store as loaded.
    pub baseline: Arc<BTreeMap<String, String>>,
    pub pipeline: HookPipeline,
    pub interrupt: Option<InterruptHandle>,
}

/// The `test` task: `beforeEach`, the body raced against the timeout and
/// `cancel`, then `afterEach` whenever `beforeEach` ran.
///
/// # Errors
///
/// Returns the [`TestFailure`] that decides the test failed.
pub async fn run_test(job: TestJob, cancel: CancellationToken) -> Result<TestOutcome, TestFailure> {
    let started = Instant::now();
    if cancel.is_cancelled() {
        return Err(TestFailure::cancelled());
    }
    let TestJob {
        scope,
        body,
        timeout,
        policy,
        baseline,
        pipeline,
        interrupt,
    } = job;

    let hooks = pipeline.clone();
    let (scope, before) = tokio::task::spawn_blocking(move || {
        let mut scope = scope;
        let result = hooks.before_each(&mut scope);
        (scope, result)
    })
    .await
    .map_err(|e| TestFailure::new(FailureKind::Panic, join_message(e)))?;

    // Bodies abandoned on timeout or cancel never hand their scope back.
    let fallback = scope.clone();
    let recorder = SnapshotRecorder::new(&scope.test.name, policy, baseline);
    let (returned, mut outcome) = match before {
        Err(hook) => (None, Err(TestFailure::new(FailureKind::Hook, hook.to_string()))),
        Ok(()) => execute_body(scope, body, timeout, &cancel, recorder, interrupt).await,
    };

    let scope = returned.unwrap_or(fallback);
    let after = tokio::task::spawn_blocking(move || {
        let mut scope = scope;
        pipeline.after_each(&mut scope)
    })
    .await;
    let after = match after {
        Ok(result) => result.map_err(|hook| TestFailure::new(FailureKind::Hook, hook.to_string())),
        Err(e) => Err(TestFailure::new(FailureKind::Panic, join_message(e))),
    };
    if let Err(failure) = after
        && outcome.is_ok()
    {
        outcome = Err(failure);
    }

    let (status, snapshots) = outcome?;
    Ok(TestOutcome {
        status,
        duration: started.elapsed(),
        snapshots,
    })
}

type BodyResult = (Option<TestScope>, Result<(OutcomeStatus, SnapshotDelta), TestFailure>);

async fn execute_body(
    scope: TestScope,
    body: TestFn,
    timeout: Duration,
    cancel: &CancellationToken,
    recorder: SnapshotRecorder,
    interrupt: Option<InterruptHandle>,
) -> BodyResult {
    let body_token = cancel.child_token();
    let mut context = TestContext::new(scope, timeout, body_token.clone(), recorder);
    if let Some(interrupt) = interrupt {
        context = context.with_interrupt(interrupt);
    }

    let mut handle = tokio::task::spawn_blocking(move || {
        let result = catch_unwind(AssertUnwindSafe(|| body(&mut context))).unwrap_or_else(|payload| {
            Err(TestFailure::new(
                FailureKind::Panic,
                panic_message(payload.as_ref()),
            ))
        });
        context.finish(result)
    });

    tokio::select! {
        joined = &mut handle => match joined {
            Ok((scope, outcome)) => (Some(scope), outcome),
            Err(e) => (None, Err(TestFailure::new(FailureKind::Panic, join_message(e)))),
        },
        () = tokio::time::sleep(timeout) => {
            body_token.cancel();
            (None, Err(TestFailure::timeout(timeout)))
        }
        () = cancel.cancelled() => (None, Err(TestFailure::cancelled())),
    }
}

/// Message for a blocking task that did not return normally.
pub(crate) fn join_message(err: JoinError) -> String {
    if err.is_panic() {
        panic_message(err.into_panic().as_ref())
    } else {
        "task cancelled".to_owned()
    }
}

/// A settled test, ready for its bucket.
#[derive(Debug, Clone)]
pub struct Classified {
    pub bucket: Bucket,
    pub record: TestRecord,
    /// Snapshot changes to merge; only ever non-empty for passed tests.
    pub snapshots: SnapshotDelta,
}

/// Map a settled `test` task to its bucket. Pool lifecycle errors yield
/// `None`: the cancellation path already accounts for those tests.
pub fn classify(
    test: &TestDescriptor,
    file: &FileInfo,
    settled: Result<Result<TestOutcome, TestFailure>, PoolError>,
    elapsed: Duration,
) -> Option<Classified> {
    let record = TestRecord::new(test.clone(), file);
    let (bucket, record, snapshots) = match settled {
        Err(e) if e.is_lifecycle() => {
            debug!(test = %test.name, reason = %e, "discarding result");
            return None;
        }
        Err(PoolError::Panicked(message)) => {
            let failure = TestFailure::new(FailureKind::Panic, message);
            (Bucket::Failed, record.with_failure(&failure), SnapshotDelta::default())
        }
        Err(other) => {
            let failure = TestFailure::new(FailureKind::Panic, other.to_string());
            (Bucket::Failed, record.with_failure(&failure), SnapshotDelta::default())
        }
        Ok(Ok(outcome)) => {
            let record = record.with_duration(outcome.duration);
            match outcome.status {
                OutcomeStatus::Skipped(reason) => {
                    (Bucket::Skipped, record.with_reason(reason), SnapshotDelta::default())
                }
                OutcomeStatus::Warned(reason) => {
                    (Bucket::Warnings, record.with_reason(reason), SnapshotDelta::default())
                }
                OutcomeStatus::Passed => (Bucket::Passed, record, outcome.snapshots),
            }
        }
        Ok(Err(failure)) => {
            let record = record.with_failure(&failure).with_duration(elapsed);
            let bucket = if test.warn {
                Bucket::Warnings
            } else {
                Bucket::Failed
            };
            (bucket, record, SnapshotDelta::default())
        }
    };
    Some(Classified {
        bucket,
        record,
        snapshots,
    })
}
