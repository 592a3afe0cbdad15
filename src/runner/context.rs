use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::runner::config::{ConfigError, RunConfig};
use crate::runner::executor::RunError;
use crate::runner::filter::TagFilter;
use crate::runner::result::{Bucket, FailureKind, TestFailure};
use crate::snapshot::snapshot_path_for;
use crate::suite::{TestDefinition, TestDescriptor};

/// Identity of one test file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub path: PathBuf,
    /// `path` relative to the run root, for display.
    pub relative_path: PathBuf,
    pub snapshot_path: PathBuf,
}

impl FileInfo {
    pub fn new(path: PathBuf, root: &Path) -> Self {
        let relative_path = path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.clone());
        Self {
            snapshot_path: snapshot_path_for(&path),
            relative_path,
            path,
        }
    }
}

/// A registered file: the tests that survived filtering and augmentation.
#[derive(Debug, Clone)]
pub struct FileContext {
    pub file: Arc<FileInfo>,
    pub tests: Vec<TestDefinition>,
    /// Names of exported tests dropped by the tag or name filter. Their
    /// snapshots still count as checked.
    pub excluded: Vec<String>,
}

impl FileContext {
    pub fn has_only(&self) -> bool {
        self.tests.iter().any(|t| t.descriptor.only)
    }
}

/// A settled test. Lands in exactly one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRecord {
    pub test: TestDescriptor,
    /// File path relative to the run root.
    pub file: PathBuf,
    pub err: Option<String>,
    pub kind: Option<FailureKind>,
    pub duration: Option<Duration>,
}

impl TestRecord {
    pub fn new(test: TestDescriptor, file: &FileInfo) -> Self {
        Self {
            test,
            file: file.relative_path.clone(),
            err: None,
            kind: None,
            duration: None,
        }
    }

    pub fn with_failure(mut self, failure: &TestFailure) -> Self {
        self.err = Some(failure.message.clone());
        self.kind = Some(failure.kind);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.err = Some(reason.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// State of one run. Built from a [`RunConfig`], mutated only by the
/// coordinator, and handed back to the caller when the run settles.
#[derive(Debug, Clone)]
pub struct RunContext {
    config: RunConfig,
    filter: TagFilter,
    root: PathBuf,
    files: Vec<PathBuf>,
    files_registered: usize,
    tests_registered: usize,
    tests_run: usize,
    passed: Vec<TestRecord>,
    failed: Vec<TestRecord>,
    warnings: Vec<TestRecord>,
    skipped: Vec<TestRecord>,
    has_fast_failure: bool,
    err: Option<RunError>,
    duration: Duration,
    /// Free-form values shared between `before` and `after` hooks.
    pub state: HashMap<String, serde_json::Value>,
}

impl RunContext {
    /// Merge `config` with defaults into a fresh run state.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid, e.g. an
    /// unknown match mode alongside tags.
    pub fn from_config(config: RunConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let filter = TagFilter::new(config.tags.iter().cloned(), config.match_mode()?);
        let root = match &config.root {
            Some(root) => root.clone(),
            None => std::env::current_dir().map_err(ConfigError::Root)?,
        };
        let root = std::fs::canonicalize(&root).unwrap_or(root);

        Ok(Self {
            config,
            filter,
            root,
            files: Vec::new(),
            files_registered: 0,
            tests_registered: 0,
            tests_run: 0,
            passed: Vec::new(),
            failed: Vec::new(),
            warnings: Vec::new(),
            skipped: Vec::new(),
            has_fast_failure: false,
            err: None,
            duration: Duration::ZERO,
            state: HashMap::new(),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn filter(&self) -> &TagFilter {
        &self.filter
    }

    /// Directory patterns are resolved against and paths are shown relative to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn files_registered(&self) -> usize {
        self.files_registered
    }

    pub fn tests_registered(&self) -> usize {
        self.tests_registered
    }

    pub fn tests_run(&self) -> usize {
        self.tests_run
    }

    pub fn passed(&self) -> &[TestRecord] {
        &self.passed
    }

    pub fn failed(&self) -> &[TestRecord] {
        &self.failed
    }

    pub fn warnings(&self) -> &[TestRecord] {
        &self.warnings
    }

    pub fn skipped(&self) -> &[TestRecord] {
        &self.skipped
    }

    pub fn has_fast_failure(&self) -> bool {
        self.has_fast_failure
    }

    /// Why the run ended abnormally, if it did.
    pub fn err(&self) -> Option<&RunError> {
        self.err.as_ref()
    }

    /// Wall-clock time from discovery until the run settled.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// True when nothing failed and the run ended normally.
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.err.is_none()
    }

    // -- coordinator-only mutation --

    pub(crate) fn set_files(&mut self, files: Vec<PathBuf>) {
        self.files = files;
    }

    /// Count a registered file. Returns true when it was the last one.
    pub(crate) fn file_registered(&mut self, tests: usize) -> bool {
        self.files_registered += 1;
        self.tests_registered += tests;
        self.files_registered == self.files.len()
    }

    pub(crate) fn all_files_registered(&self) -> bool {
        self.files_registered >= self.files.len()
    }

    /// Append a settled test to its bucket and count it as run.
    pub(crate) fn record(&mut self, bucket: Bucket, record: TestRecord) {
        let target = match bucket {
            Bucket::Passed => &mut self.passed,
            Bucket::Failed => &mut self.failed,
            Bucket::Warnings => &mut self.warnings,
            Bucket::Skipped => &mut self.skipped,
        };
        target.push(record);
        self.tests_run += 1;
    }

    pub(crate) fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }

    pub(crate) fn set_fast_failure(&mut self) {
        self.has_fast_failure = true;
    }

    /// Keep the first abnormal-termination reason.
    pub(crate) fn set_err(&mut self, err: RunError) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    /// Replace whatever reason was recorded. Used when a forced termination
    /// overrides a softer one.
    pub(crate) fn override_err(&mut self, err: RunError) {
        self.err = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::filter::MatchMode;

    fn make_context() -> RunContext {
        let config = RunConfig {
            root: Some(PathBuf::from("/")),
            ..RunConfig::default()
        };
        RunContext::from_config(config).unwrap()
    }

    fn record(name: &str) -> TestRecord {
        let file = FileInfo::new(PathBuf::from("/work/a.tests.yaml"), Path::new("/work"));
        TestRecord::new(TestDescriptor::new(name), &file)
    }

    #[test]
    fn file_info_paths() {
        let info = FileInfo::new(PathBuf::from("/work/tests/a.tests.yaml"), Path::new("/work"));
        assert_eq!(info.relative_path, PathBuf::from("tests/a.tests.yaml"));
        assert_eq!(
            info.snapshot_path,
            PathBuf::from("/work/tests/snapshots/a.tests.yaml.snap")
        );
    }

    #[test]
    fn file_info_outside_root_keeps_absolute_path() {
        let info = FileInfo::new(PathBuf::from("/elsewhere/a.tests.yaml"), Path::new("/work"));
        assert_eq!(info.relative_path, PathBuf::from("/elsewhere/a.tests.yaml"));
    }

    #[test]
    fn builder_applies_defaults() {
        let ctx = make_context();
        assert_eq!(ctx.timeout(), Duration::from_secs(60));
        assert_eq!(ctx.filter().mode(), MatchMode::Some);
        assert!(ctx.filter().is_empty());
        assert_eq!(ctx.tests_run(), 0);
        assert!(!ctx.has_fast_failure());
        assert!(ctx.success());
    }

    #[test]
    fn builder_rejects_bad_match_with_tags() {
        let config = RunConfig {
            tags: vec!["qa".into()],
            match_mode: "any".into(),
            ..RunConfig::default()
        };
        let err = RunContext::from_config(config).unwrap_err();
        assert_eq!(
            err.to_string(),
            "match value must be 'some' or 'every', not 'any'"
        );
    }

    #[test]
    fn record_appends_and_counts() {
        let mut ctx = make_context();
        ctx.record(Bucket::Passed, record("a"));
        ctx.record(Bucket::Failed, record("b").with_reason("boom"));
        ctx.record(Bucket::Skipped, record("c"));
        assert_eq!(ctx.tests_run(), 3);
        assert_eq!(ctx.passed().len(), 1);
        assert_eq!(ctx.failed()[0].err.as_deref(), Some("boom"));
        assert_eq!(ctx.skipped().len(), 1);
        assert!(!ctx.success());
    }

    #[test]
    fn file_registration_counts() {
        let mut ctx = make_context();
        ctx.set_files(vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!(!ctx.file_registered(2));
        assert!(!ctx.all_files_registered());
        assert!(ctx.file_registered(3));
        assert!(ctx.all_files_registered());
        assert_eq!(ctx.tests_registered(), 5);
    }

    #[test]
    fn first_err_wins_unless_overridden() {
        let mut ctx = make_context();
        ctx.set_err(RunError::FailFast);
        ctx.set_err(RunError::Interrupted);
        assert_eq!(ctx.err(), Some(&RunError::FailFast));
        ctx.override_err(RunError::ForcedTermination);
        assert_eq!(ctx.err(), Some(&RunError::ForcedTermination));
    }

    #[test]
    fn file_context_has_only() {
        let file = Arc::new(FileInfo::new(PathBuf::from("/w/a.yaml"), Path::new("/w")));
        let body = |t: &mut crate::suite::TestContext| t.assert(true, "ok");
        let mut fc = FileContext {
            file,
            tests: vec![TestDefinition::new("a", body)],
            excluded: vec![],
        };
        assert!(!fc.has_only());
        fc.tests.push(TestDefinition::new("b", body).only());
        assert!(fc.has_only());
    }
}
