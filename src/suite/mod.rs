//! Test definitions and the loaders that produce them.
//!
//! A test file is turned into a [`TestMap`] by a [`TestLoader`]. Nothing is
//! registered globally: loaders return the map and the registration task
//! passes it along explicitly.

pub mod context;
pub mod loader;
pub mod shell;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::runner::result::TestFailure;

pub use context::{TestContext, TestScope};
pub use loader::{LoadError, LoaderRegistry, StaticLoader, TestLoader};
pub use shell::ShellLoader;

/// Body of a test. Runs on a blocking worker thread.
pub type TestFn = Arc<dyn Fn(&mut TestContext) -> Result<(), TestFailure> + Send + Sync>;

/// Tests exported by one file, keyed by test key.
pub type TestMap = BTreeMap<String, TestDefinition>;

/// The data half of a test: everything but the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDescriptor {
    /// Key the test was exported under.
    pub key: String,
    /// Display name. Equal to `key` unless a plugin renamed the test.
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub only: bool,
    #[serde(default)]
    pub warn: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
}

impl TestDescriptor {
    pub fn new(name: &str) -> Self {
        let name = one_line(name);
        Self {
            key: name.clone(),
            name,
            tags: BTreeSet::new(),
            skip: false,
            only: false,
            warn: false,
            line_number: None,
        }
    }
}

/// Collapse runs of whitespace so multi-line names key the same way.
fn one_line(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A registered test: descriptor plus body.
#[derive(Clone)]
pub struct TestDefinition {
    pub descriptor: TestDescriptor,
    body: TestFn,
}

impl TestDefinition {
    /// Define a test. The caller's line is recorded for verbose output.
    #[track_caller]
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: Fn(&mut TestContext) -> Result<(), TestFailure> + Send + Sync + 'static,
    {
        let mut descriptor = TestDescriptor::new(name);
        descriptor.line_number = Some(std::panic::Location::caller().line());
        Self {
            descriptor,
            body: Arc::new(body),
        }
    }

    pub fn from_parts(descriptor: TestDescriptor, body: TestFn) -> Self {
        Self { descriptor, body }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.descriptor.tags.insert(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn skip(mut self) -> Self {
        self.descriptor.skip = true;
        self
    }

    pub fn only(mut self) -> Self {
        self.descriptor.only = true;
        self
    }

    pub fn warn(mut self) -> Self {
        self.descriptor.warn = true;
        self
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.descriptor.line_number = Some(line);
        self
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn body(&self) -> TestFn {
        Arc::clone(&self.body)
    }

    /// A runtime variant of this test under a new display name. Key and body
    /// are shared with the original.
    pub fn renamed(&self, name: &str) -> Self {
        let mut variant = self.clone();
        variant.descriptor.name = one_line(name);
        variant
    }
}

impl fmt::Debug for TestDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDefinition")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Builder for a file's [`TestMap`]. A later test with the same key replaces
/// an earlier one.
#[derive(Debug, Clone, Default)]
pub struct TestSuite {
    tests: TestMap,
}

impl TestSuite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plain test.
    #[track_caller]
    pub fn test<F>(self, name: &str, body: F) -> Self
    where
        F: Fn(&mut TestContext) -> Result<(), TestFailure> + Send + Sync + 'static,
    {
        self.add(TestDefinition::new(name, body))
    }

    /// Add a fully configured test.
    pub fn add(mut self, test: TestDefinition) -> Self {
        self.tests.insert(test.descriptor.key.clone(), test);
        self
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn into_map(self) -> TestMap {
        self.tests
    }
}
