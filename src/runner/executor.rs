use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::plugin::{HookFailure, HookPhase, HookPipeline, PluginRegistry};
use crate::runner::cancel::{CancelController, InterruptHandle, TaskId, listen_for_ctrl_c};
use crate::runner::config::{ConfigError, RunConfig};
use crate::runner::context::{FileContext, FileInfo, RunContext, TestRecord};
use crate::runner::discovery::{DiscoveryError, ShuffleRng, discover, shuffle_rng};
use crate::runner::execution::{Disposition, TestJob, classify, disposition, join_message, run_test};
use crate::runner::pool::{PoolError, WorkerPool};
use crate::runner::registration::{Registrar, RegistrationError};
use crate::runner::result::{Bucket, TestFailure, TestOutcome};
use crate::snapshot::SnapshotState;
use crate::suite::{LoaderRegistry, TestDefinition, TestDescriptor, TestScope};

/// Why a run ended abnormally.
///
/// Only [`NoTestFiles`](Self::NoTestFiles) and
/// [`Configuration`](Self::Configuration) are returned as `Err` from
/// [`TestRunner::run`]; everything else is reported on the returned
/// [`RunContext`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("No test files found matching: {}", .0.join(", "))]
    NoTestFiles(Vec<String>),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("failed to register {}: {message}", .file.display())]
    Registration { file: PathBuf, message: String },
    #[error("plugin {plugin} failed during {phase}: {message}")]
    Plugin {
        plugin: String,
        phase: HookPhase,
        message: String,
    },
    #[error("Run failed immediately since fail-fast is set")]
    FailFast,
    #[error("run cancelled")]
    Interrupted,
    #[error("run forcibly terminated")]
    ForcedTermination,
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl From<ConfigError> for RunError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<DiscoveryError> for RunError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::NoTestFiles(patterns) => Self::NoTestFiles(patterns),
            other => Self::Configuration(other.to_string()),
        }
    }
}

impl From<HookFailure> for RunError {
    fn from(failure: HookFailure) -> Self {
        Self::Plugin {
            plugin: failure.plugin,
            phase: failure.phase,
            message: failure.error.message,
        }
    }
}

/// Run the tests `config` selects with the built-in loaders and plugins.
///
/// # Errors
///
/// See [`TestRunner::run`].
pub async fn run(config: RunConfig) -> Result<RunContext, RunError> {
    TestRunner::new(config).run().await
}

/// The engine: discovery, the registration and execution pools, and the
/// coordinator that owns all run state.
pub struct TestRunner {
    config: RunConfig,
    loaders: Arc<LoaderRegistry>,
    plugins: PluginRegistry,
    interrupt: InterruptHandle,
    interrupts: mpsc::UnboundedReceiver<usize>,
}

impl TestRunner {
    /// Create a runner with the built-in loader and plugin registries.
    pub fn new(config: RunConfig) -> Self {
        Self::with_registries(config, LoaderRegistry::default(), PluginRegistry::default())
    }

    /// Create a runner with explicit registries (useful for embedding and testing).
    pub fn with_registries(config: RunConfig, loaders: LoaderRegistry, plugins: PluginRegistry) -> Self {
        let (interrupt, interrupts) = InterruptHandle::new();
        Self {
            config,
            loaders: Arc::new(loaders),
            plugins,
            interrupt,
            interrupts,
        }
    }

    /// Handle for delivering interrupts to this run from outside.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Execute the run.
    ///
    /// 1. Build the run context and resolve plugins
    /// 2. Discover and shuffle test files
    /// 3. Run `before` hooks
    /// 4. Register every file on the registration pool
    /// 5. Dispatch each registered file's tests to the execution pool
    /// 6. Prune and persist each file's snapshots once its tests settle
    /// 7. Run `after` hooks and terminate the pools
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] only for failures before any pool exists: an
    /// invalid configuration or no matching test files.
    pub async fn run(self) -> Result<RunContext, RunError> {
        let started = Instant::now();
        let Self {
            config,
            loaders,
            plugins,
            interrupt,
            interrupts,
        } = self;

        let mut ctx = RunContext::from_config(config)?;
        let pipeline = plugins.resolve(&ctx.config().plugins)?;
        let mut rng = shuffle_rng(ctx.config().seed);
        let files = discover(&ctx.config().tests, ctx.root(), &mut rng)?;
        ctx.set_files(files.clone());

        let size = ctx.config().pool_size();
        info!(files = files.len(), workers = size, "starting run");

        let registrar = Registrar::new(
            loaders,
            pipeline.clone(),
            ctx.filter().clone(),
            ctx.config().failed.iter().cloned(),
        );
        let signals = ctx
            .config()
            .handle_signals
            .then(|| listen_for_ctrl_c(interrupt.clone()));

        let (events_tx, events) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            ctx,
            pipeline,
            controller: CancelController::new(),
            registration_pool: WorkerPool::new("registration", size),
            execution_pool: WorkerPool::new("execution", size),
            events: events_tx,
            interrupt,
            rng,
            open: HashMap::new(),
            in_flight: HashMap::new(),
            next_file: 0,
        };
        let mut ctx = coordinator.drive(events, interrupts, &registrar, files).await;

        if let Some(task) = signals {
            task.abort();
        }
        ctx.set_duration(started.elapsed());
        info!(
            run = ctx.tests_run(),
            passed = ctx.passed().len(),
            failed = ctx.failed().len(),
            "run settled"
        );
        Ok(ctx)
    }
}

/// Messages from pool workers back to the coordinator.
enum Event {
    Registered {
        path: PathBuf,
        result: Result<Result<FileContext, RegistrationError>, PoolError>,
    },
    Settled {
        id: TaskId,
        result: Result<Result<TestOutcome, TestFailure>, PoolError>,
    },
}

/// How a `before`/`after` phase ended.
enum PhaseEnd {
    Completed(Result<(), RunError>),
    /// A second interrupt arrived while the hooks were running.
    Forced,
}

fn pipeline_label(pipeline: &HookPipeline) -> String {
    pipeline.names().join(", ")
}

/// A dispatched test that has not settled yet.
struct InFlight {
    file: usize,
    test: TestDescriptor,
    started: Instant,
}

/// A registered file whose tests are still running.
struct OpenFile {
    info: Arc<FileInfo>,
    snapshots: SnapshotState,
    pending: usize,
}

/// Sole owner of the run context and the snapshot stores. Every mutation
/// happens in response to one event, so no locking is needed.
struct Coordinator {
    ctx: RunContext,
    pipeline: HookPipeline,
    controller: CancelController,
    registration_pool: WorkerPool,
    execution_pool: WorkerPool,
    events: mpsc::UnboundedSender<Event>,
    interrupt: InterruptHandle,
    rng: ShuffleRng,
    open: HashMap<usize, OpenFile>,
    in_flight: HashMap<TaskId, InFlight>,
    next_file: usize,
}

impl Coordinator {
    async fn drive(
        mut self,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut interrupts: mpsc::UnboundedReceiver<usize>,
        registrar: &Registrar,
        files: Vec<PathBuf>,
    ) -> RunContext {
        match self.run_phase(HookPhase::Before, &mut interrupts).await {
            PhaseEnd::Completed(Ok(())) => {}
            PhaseEnd::Completed(Err(err)) => {
                error!(%err, "before phase failed");
                self.ctx.set_err(err);
                self.shutdown(false);
                return self.ctx;
            }
            PhaseEnd::Forced => return self.force_terminate(),
        }

        for path in files {
            self.spawn_registration(registrar, path);
        }

        while !(self.ctx.all_files_registered() && self.in_flight.is_empty()) {
            tokio::select! {
                biased;
                Some(count) = interrupts.recv() => {
                    if count >= 2 {
                        return self.force_terminate();
                    }
                    warn!("interrupted; cancelling in-flight tests");
                    self.trip(RunError::Interrupted);
                }
                Some(event) = events.recv() => match event {
                    Event::Registered { path, result } => self.registered(path, result),
                    Event::Settled { id, result } => self.settled(id, result),
                },
                else => break,
            }
        }

        self.controller.drain();
        debug!(state = %self.controller.state(), "running after phase");
        match self.run_phase(HookPhase::After, &mut interrupts).await {
            PhaseEnd::Completed(Ok(())) => {}
            PhaseEnd::Completed(Err(err)) => {
                error!(%err, "after phase failed");
                self.ctx.set_err(err);
            }
            PhaseEnd::Forced => return self.force_terminate(),
        }
        self.shutdown(false);
        self.ctx
    }

    /// Run the `before` or `after` hooks on a blocking thread while still
    /// listening for interrupts. A second interrupt abandons the hook.
    ///
    /// Hooks get a copy of the run context; only its `state` map is taken
    /// back once they finish.
    async fn run_phase(
        &mut self,
        phase: HookPhase,
        interrupts: &mut mpsc::UnboundedReceiver<usize>,
    ) -> PhaseEnd {
        if self.pipeline.is_empty() {
            return PhaseEnd::Completed(Ok(()));
        }
        let pipeline = self.pipeline.clone();
        let mut view = self.ctx.clone();
        let mut hooks = tokio::task::spawn_blocking(move || {
            let result = match phase {
                HookPhase::Before => pipeline.before(&mut view),
                _ => pipeline.after(&mut view),
            };
            (view, result)
        });

        loop {
            tokio::select! {
                biased;
                Some(count) = interrupts.recv() => {
                    if count >= 2 {
                        warn!(%phase, "interrupted again; abandoning hooks");
                        return PhaseEnd::Forced;
                    }
                    warn!(%phase, "interrupted; letting hooks finish");
                    self.trip(RunError::Interrupted);
                }
                joined = &mut hooks => {
                    return match joined {
                        Ok((view, result)) => {
                            self.ctx.state = view.state;
                            PhaseEnd::Completed(result.map_err(RunError::from))
                        }
                        Err(e) => PhaseEnd::Completed(Err(RunError::Plugin {
                            plugin: pipeline_label(&self.pipeline),
                            phase,
                            message: join_message(e),
                        })),
                    };
                }
            }
        }
    }

    fn spawn_registration(&self, registrar: &Registrar, path: PathBuf) {
        let file = Arc::new(FileInfo::new(path.clone(), self.ctx.root()));
        let registrar = registrar.clone();
        let pool = self.registration_pool.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = pool
                .exec(&CancellationToken::new(), async move {
                    tokio::task::spawn_blocking(move || registrar.register(file))
                        .await
                        .unwrap_or_else(|e| Err(RegistrationError::Panicked(join_message(e))))
                })
                .await;
            let _ = events.send(Event::Registered { path, result });
        });
    }

    fn registered(
        &mut self,
        path: PathBuf,
        result: Result<Result<FileContext, RegistrationError>, PoolError>,
    ) {
        let file_context = match result {
            Ok(Ok(file_context)) => Some(file_context),
            Err(e) if e.is_lifecycle() => None,
            Ok(Err(e)) => {
                self.registration_failed(path, e.to_string());
                None
            }
            Err(e) => {
                self.registration_failed(path, e.to_string());
                None
            }
        };

        let tests = file_context.as_ref().map_or(0, |fc| fc.tests.len());
        if self.ctx.file_registered(tests) {
            debug!(files = self.ctx.files_registered(), "all files registered");
            self.registration_pool.terminate(false);
        }
        if let Some(file_context) = file_context {
            self.dispatch_file(file_context);
        }
    }

    fn registration_failed(&mut self, file: PathBuf, message: String) {
        error!(file = %file.display(), %message, "registration failed");
        self.trip(RunError::Registration { file, message });
    }

    /// Mark the file's snapshots checked, then skip or dispatch each test.
    fn dispatch_file(&mut self, file_context: FileContext) {
        let policy = self.ctx.config().update_snapshot;
        let mut snapshots = match SnapshotState::load(&file_context.file.snapshot_path, policy) {
            Ok(snapshots) => snapshots,
            Err(e) => {
                error!(file = %file_context.file.relative_path.display(), error = %e, "cannot load snapshots");
                self.ctx.set_err(RunError::Snapshot(e.to_string()));
                return;
            }
        };
        // Every registered or filtered-out test counts as checked, whether or
        // not it ends up running.
        for test in &file_context.tests {
            snapshots.mark_checked_for_test(test.name());
        }
        for name in &file_context.excluded {
            snapshots.mark_checked_for_test(name);
        }

        let has_only = file_context.has_only();
        let FileContext {
            file, mut tests, ..
        } = file_context;
        tests.shuffle(&mut self.rng);

        let index = self.next_file;
        self.next_file += 1;
        let baseline = snapshots.baseline();
        let mut pending = 0;
        for test in tests {
            match disposition(&test.descriptor, has_only, self.ctx.has_fast_failure()) {
                Disposition::Suppressed => {}
                Disposition::Skipped => {
                    self.record(Bucket::Skipped, TestRecord::new(test.descriptor, &file));
                }
                Disposition::Dispatch => {
                    self.spawn_test(index, &file, test, &baseline);
                    pending += 1;
                }
            }
        }

        let open = OpenFile {
            info: file,
            snapshots,
            pending,
        };
        if pending == 0 {
            self.finalize(open);
        } else {
            self.open.insert(index, open);
        }
    }

    fn spawn_test(
        &mut self,
        file_index: usize,
        file: &Arc<FileInfo>,
        test: TestDefinition,
        baseline: &Arc<BTreeMap<String, String>>,
    ) {
        let (id, token) = self.controller.track();
        let job = TestJob {
            scope: TestScope::new(Arc::clone(file), test.descriptor.clone()),
            body: test.body(),
            timeout: self.ctx.timeout(),
            policy: self.ctx.config().update_snapshot,
            baseline: Arc::clone(baseline),
            pipeline: self.pipeline.clone(),
            interrupt: Some(self.interrupt.clone()),
        };
        self.in_flight.insert(
            id,
            InFlight {
                file: file_index,
                test: test.descriptor,
                started: Instant::now(),
            },
        );

        let pool = self.execution_pool.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = pool.exec(&token, run_test(job, token.clone())).await;
            let _ = events.send(Event::Settled { id, result });
        });
    }

    fn settled(&mut self, id: TaskId, result: Result<Result<TestOutcome, TestFailure>, PoolError>) {
        self.controller.settle(id);
        let Some(flight) = self.in_flight.remove(&id) else {
            return;
        };
        let Some(open) = self.open.get_mut(&flight.file) else {
            return;
        };
        open.pending -= 1;
        let classified = classify(&flight.test, &open.info, result, flight.started.elapsed()).map(
            |mut classified| {
                if classified.bucket == Bucket::Passed {
                    open.snapshots.absorb(std::mem::take(&mut classified.snapshots));
                }
                classified
            },
        );
        let file_done = open.pending == 0;

        if let Some(classified) = classified {
            let failed = classified.bucket == Bucket::Failed;
            self.record(classified.bucket, classified.record);
            if failed && self.ctx.config().fail_fast {
                self.trip(RunError::FailFast);
            }
        }
        if file_done && let Some(open) = self.open.remove(&flight.file) {
            self.finalize(open);
        }
    }

    fn record(&mut self, bucket: Bucket, record: TestRecord) {
        debug!(test = %record.test.name, file = %record.file.display(), result = %bucket, "test settled");
        self.ctx.record(bucket, record);
    }

    /// Prune obsolete entries and persist the file's store. Runs once per
    /// file, after every test dispatched for it settled.
    fn finalize(&mut self, mut open: OpenFile) {
        let pruned = open.snapshots.prune_unchecked();
        if !pruned.is_empty() {
            debug!(file = %open.info.relative_path.display(), pruned = pruned.len(), "pruned obsolete snapshots");
        }
        match open.snapshots.save() {
            Ok(true) => {
                let (added, updated, removed) = open.snapshots.changes();
                info!(
                    file = %open.info.relative_path.display(),
                    added,
                    updated,
                    removed,
                    "snapshots written"
                );
            }
            Ok(false) => {}
            Err(e) => {
                error!(file = %open.info.relative_path.display(), error = %e, "cannot write snapshots");
                self.ctx.set_err(RunError::Snapshot(e.to_string()));
            }
        }
    }

    /// Enter fast failure: stop dispatch and cancel everything in flight.
    fn trip(&mut self, reason: RunError) {
        self.ctx.set_fast_failure();
        self.ctx.set_err(reason);
        if self.controller.trip() {
            debug!(in_flight = self.controller.in_flight(), "fast failure");
        }
    }

    /// Second interrupt: abort everything and skip the `after` phase.
    fn force_terminate(mut self) -> RunContext {
        warn!("interrupted again; terminating immediately");
        self.ctx.set_fast_failure();
        self.ctx.override_err(RunError::ForcedTermination);
        self.shutdown(true);
        self.ctx
    }

    fn shutdown(&mut self, force: bool) {
        self.registration_pool.terminate(force);
        self.execution_pool.terminate(force);
        self.controller.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::runner::filter::MatchMode;
    use crate::suite::{StaticLoader, TestContext, TestSuite};

    fn ok(t: &mut TestContext) -> Result<(), TestFailure> {
        t.assert(true, "ok")
    }

    fn boom(t: &mut TestContext) -> Result<(), TestFailure> {
        t.assert(false, "boom")
    }

    /// Write an empty file so discovery finds it, and bind `suite` to it.
    fn fixture(dir: &Path, name: &str, suite: TestSuite, loader: &mut StaticLoader) {
        let path = dir.join(name);
        std::fs::write(&path, "").unwrap();
        loader.insert(&path, suite);
    }

    fn runner(dir: &Path, loader: StaticLoader, config: RunConfig) -> TestRunner {
        let mut loaders = LoaderRegistry::new();
        loaders.register(Arc::new(loader));
        let config = RunConfig {
            root: Some(dir.to_path_buf()),
            tests: vec!["*tests.yaml".into()],
            concurrency: Some(2),
            seed: Some(3),
            ..config
        };
        TestRunner::with_registries(config, loaders, PluginRegistry::new())
    }

    #[tokio::test]
    async fn example_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = StaticLoader::new();
        let suite = TestSuite::new()
            .test("a", ok)
            .test("b", boom)
            .add(TestDefinition::new("c", ok).tag("qa"));
        fixture(dir.path(), "x.tests.yaml", suite, &mut loader);

        let ctx = runner(dir.path(), loader, RunConfig::default()).run().await.unwrap();
        assert_eq!(ctx.tests_run(), 3);
        assert_eq!(ctx.passed().len(), 2);
        assert_eq!(ctx.failed().len(), 1);
        assert_eq!(ctx.failed()[0].test.name, "b");
        assert_eq!(ctx.failed()[0].err.as_deref(), Some("boom"));
        assert!(ctx.skipped().is_empty());
        assert!(ctx.err().is_none());
        assert!(!ctx.success());
    }

    #[tokio::test]
    async fn tag_filter_limits_registration() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = StaticLoader::new();
        let suite = TestSuite::new()
            .test("a", ok)
            .add(TestDefinition::new("c", ok).tag("qa"));
        fixture(dir.path(), "x.tests.yaml", suite, &mut loader);

        let config = RunConfig {
            tags: vec!["qa".into()],
            match_mode: MatchMode::Some.to_string(),
            ..RunConfig::default()
        };
        let ctx = runner(dir.path(), loader, config).run().await.unwrap();
        assert_eq!(ctx.tests_registered(), 1);
        assert_eq!(ctx.tests_run(), 1);
        assert_eq!(ctx.passed()[0].test.name, "c");
    }

    #[tokio::test]
    async fn no_files_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = runner(dir.path(), StaticLoader::new(), RunConfig::default())
            .run()
            .await
            .unwrap_err();
        assert_eq!(err, RunError::NoTestFiles(vec!["*tests.yaml".into()]));
    }

    #[tokio::test]
    async fn unknown_plugin_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            plugins: vec!["nope".into()],
            ..RunConfig::default()
        };
        let err = runner(dir.path(), StaticLoader::new(), config)
            .run()
            .await
            .unwrap_err();
        assert_eq!(err, RunError::Configuration("unknown plugin 'nope'".into()));
    }

    #[tokio::test]
    async fn unloadable_file_sets_err() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("orphan.tests.yaml"), "").unwrap();
        let ctx = runner(dir.path(), StaticLoader::new(), RunConfig::default())
            .run()
            .await
            .unwrap();
        assert!(matches!(ctx.err(), Some(RunError::Registration { .. })));
        assert_eq!(ctx.files_registered(), 1);
        assert_eq!(ctx.tests_run(), 0);
    }

    #[test]
    fn run_error_display() {
        assert_eq!(
            RunError::NoTestFiles(vec!["a".into(), "b".into()]).to_string(),
            "No test files found matching: a, b"
        );
        assert_eq!(
            RunError::FailFast.to_string(),
            "Run failed immediately since fail-fast is set"
        );
        assert_eq!(
            RunError::Registration {
                file: PathBuf::from("/w/a.tests.yaml"),
                message: "no loader".into()
            }
            .to_string(),
            "failed to register /w/a.tests.yaml: no loader"
        );
    }

    #[test]
    fn hook_failure_converts_to_plugin_error() {
        let failure = HookFailure {
            plugin: "browser".into(),
            phase: HookPhase::After,
            error: crate::plugin::PluginError::new("driver crashed"),
        };
        assert_eq!(
            RunError::from(failure).to_string(),
            "plugin browser failed during after: driver crashed"
        );
    }
}
