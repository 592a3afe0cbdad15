use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::suite::{ShellLoader, TestMap, TestSuite};

/// Errors turning a test file into a [`TestMap`].
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no loader can handle {0}")]
    Unsupported(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid test file {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

/// Turns a test file into the tests it exports.
pub trait TestLoader: Send + Sync {
    /// Loader name, for logs and `list`.
    fn name(&self) -> &str;

    /// Whether this loader understands `path`.
    fn handles(&self, path: &Path) -> bool;

    /// Load the file's tests without running any of them.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the file cannot be read or is malformed.
    fn load(&self, path: &Path) -> Result<TestMap, LoadError>;
}

/// Registry of test loaders, consulted in registration order.
#[derive(Clone)]
pub struct LoaderRegistry {
    loaders: Vec<Arc<dyn TestLoader>>,
}

impl LoaderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            loaders: Vec::new(),
        }
    }

    /// A registry with the built-in shell loader.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellLoader::new()));
        registry
    }

    /// Look up a loader by name.
    pub fn get(&self, name: &str) -> Option<&dyn TestLoader> {
        self.loaders
            .iter()
            .find(|l| l.name() == name)
            .map(|l| l.as_ref())
    }

    /// The first loader that handles `path`.
    pub fn detect(&self, path: &Path) -> Option<&dyn TestLoader> {
        self.loaders
            .iter()
            .find(|l| l.handles(path))
            .map(|l| l.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.loaders.iter().map(|l| l.name()).collect()
    }

    /// Register a loader. Earlier registrations take precedence.
    pub fn register(&mut self, loader: Arc<dyn TestLoader>) {
        self.loaders.push(loader);
    }

    /// Load `path` with the first loader that handles it.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Unsupported`] if no loader handles the file, or
    /// whatever the chosen loader returns.
    pub fn load(&self, path: &Path) -> Result<TestMap, LoadError> {
        self.detect(path)
            .ok_or_else(|| LoadError::Unsupported(path.to_path_buf()))?
            .load(path)
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Loader for suites defined in Rust and bound to a file path.
#[derive(Debug, Clone, Default)]
pub struct StaticLoader {
    suites: HashMap<PathBuf, TestMap>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `suite` to `path`, replacing any earlier binding.
    pub fn insert(&mut self, path: impl AsRef<Path>, suite: TestSuite) {
        self.suites.insert(normalize(path.as_ref()), suite.into_map());
    }

    pub fn with_suite(mut self, path: impl AsRef<Path>, suite: TestSuite) -> Self {
        self.insert(path, suite);
        self
    }
}

impl TestLoader for StaticLoader {
    fn name(&self) -> &str {
        "static"
    }

    fn handles(&self, path: &Path) -> bool {
        self.suites.contains_key(&normalize(path))
    }

    fn load(&self, path: &Path) -> Result<TestMap, LoadError> {
        self.suites
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| LoadError::Unsupported(path.to_path_buf()))
    }
}

/// Discovery hands out canonical paths; bind suites the same way.
fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
