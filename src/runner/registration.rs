use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::plugin::{HookFailure, HookPipeline};
use crate::runner::context::{FileContext, FileInfo};
use crate::runner::filter::TagFilter;
use crate::suite::{LoadError, LoaderRegistry, TestDefinition, TestMap};

/// Rewrites a file's filtered tests, e.g. fanning one test out per browser.
pub type Augmenter = Arc<dyn Fn(Vec<TestDefinition>) -> Vec<TestDefinition> + Send + Sync>;

/// What `registration` hooks see and may change for one file.
pub struct Registration {
    pub file: Arc<FileInfo>,
    tests: Option<TestMap>,
    augmenter: Option<Augmenter>,
}

impl Registration {
    pub fn new(file: Arc<FileInfo>) -> Self {
        Self {
            file,
            tests: None,
            augmenter: None,
        }
    }

    /// Supply the file's tests instead of loading them from disk.
    pub fn set_tests(&mut self, tests: TestMap) {
        self.tests = Some(tests);
    }

    pub fn tests(&self) -> Option<&TestMap> {
        self.tests.as_ref()
    }

    /// Install the augmentation applied after filtering. The last plugin to
    /// install one wins.
    pub fn augment_tests<F>(&mut self, augment: F)
    where
        F: Fn(Vec<TestDefinition>) -> Vec<TestDefinition> + Send + Sync + 'static,
    {
        self.augmenter = Some(Arc::new(augment));
    }

    pub fn has_augmenter(&self) -> bool {
        self.augmenter.is_some()
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("file", &self.file)
            .field("tests", &self.tests.as_ref().map(TestMap::len))
            .field("augmenter", &self.augmenter.is_some())
            .finish()
    }
}

/// Why a file could not be registered.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Hook(#[from] HookFailure),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("registration panicked: {0}")]
    Panicked(String),
}

/// The `register` task: everything a registration worker needs, cloned
/// into each worker.
#[derive(Clone)]
pub struct Registrar {
    loaders: Arc<LoaderRegistry>,
    pipeline: HookPipeline,
    filter: TagFilter,
    names: Arc<BTreeSet<String>>,
}

impl Registrar {
    /// `names`, when non-empty, restricts the run to tests with those names.
    pub fn new<I>(loaders: Arc<LoaderRegistry>, pipeline: HookPipeline, filter: TagFilter, names: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            loaders,
            pipeline,
            filter,
            names: Arc::new(names.into_iter().collect()),
        }
    }

    /// Register one file: run `registration` hooks, load the test map unless
    /// a hook supplied it, filter by tags, augment, then filter by name.
    /// Never runs a test body.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError`] if a hook or the loader fails.
    pub fn register(&self, file: Arc<FileInfo>) -> Result<FileContext, RegistrationError> {
        let mut registration = Registration::new(Arc::clone(&file));
        self.pipeline.registration(&mut registration)?;

        let Registration {
            tests, augmenter, ..
        } = registration;
        let tests = match tests {
            Some(tests) => tests,
            None => self.loaders.load(&file.path)?,
        };
        let exported = tests.len();

        let mut excluded = Vec::new();
        let mut kept = Vec::with_capacity(exported);
        for test in tests.into_values() {
            if self.filter.matches(&test.descriptor.tags) {
                kept.push(test);
            } else {
                excluded.push(test.descriptor.name.clone());
            }
        }

        if let Some(augment) = augmenter {
            kept = augment(kept);
        }

        if !self.names.is_empty() {
            let (selected, dropped): (Vec<_>, Vec<_>) = kept
                .into_iter()
                .partition(|t| self.names.contains(t.name()));
            excluded.extend(dropped.into_iter().map(|t| t.descriptor.name));
            kept = selected;
        }

        debug!(
            file = %file.relative_path.display(),
            exported,
            registered = kept.len(),
            excluded = excluded.len(),
            "registered file"
        );
        Ok(FileContext {
            file,
            tests: kept,
            excluded,
        })
    }
}
