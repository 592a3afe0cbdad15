use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runner::discovery::DEFAULT_PATTERNS;
use crate::runner::filter::MatchMode;
use crate::snapshot::UpdatePolicy;

/// Config file picked up from the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "testpool.yaml";

/// Errors building a run from configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("match value must be 'some' or 'every', not '{0}'")]
    InvalidMatch(String),
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("cannot determine working directory: {0}")]
    Root(#[source] io::Error),
}

/// Configuration for a test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Glob patterns, files or directories to collect test files from.
    pub tests: Vec<String>,
    /// Only run tests carrying these tags.
    #[serde(alias = "tag")]
    pub tags: Vec<String>,
    /// How `tags` combine: "some" or "every".
    #[serde(rename = "match")]
    pub match_mode: String,
    /// Per-test timeout.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Workers per pool. Defaults to the host's available parallelism.
    pub concurrency: Option<usize>,
    pub update_snapshot: UpdatePolicy,
    /// Stop dispatching after the first failure.
    pub fail_fast: bool,
    /// Record file:line and duration with each result.
    pub verbose: bool,
    /// Plugin names, resolved against the plugin registry.
    pub plugins: Vec<String>,
    /// Log level for the CLI's subscriber.
    pub log: Option<String>,
    /// Directory patterns are resolved against. Defaults to the working directory.
    pub root: Option<PathBuf>,
    /// Only run tests with these names, e.g. the failures of a previous run.
    pub failed: Vec<String>,
    /// Seed for file and test shuffling.
    pub seed: Option<u64>,
    /// Install a Ctrl-C listener for the duration of the run.
    pub handle_signals: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            tests: DEFAULT_PATTERNS.iter().map(|p| (*p).to_owned()).collect(),
            tags: Vec::new(),
            match_mode: MatchMode::Some.to_string(),
            timeout: Duration::from_secs(60),
            concurrency: None,
            update_snapshot: UpdatePolicy::None,
            fail_fast: false,
            verbose: false,
            plugins: Vec::new(),
            log: None,
            root: None,
            failed: Vec::new(),
            seed: None,
            handle_signals: false,
        }
    }
}

impl RunConfig {
    /// Load a config file. `.json` files are read as JSON, anything else as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&text).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(&text).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// The tag match mode. Only checked when tags are configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidMatch`] for anything but "some"/"every"
    /// when tags are set.
    pub fn match_mode(&self) -> Result<MatchMode, ConfigError> {
        match self.match_mode.parse::<MatchMode>() {
            Ok(mode) => Ok(mode),
            Err(_) if self.tags.is_empty() => Ok(MatchMode::default()),
            Err(_) => Err(ConfigError::InvalidMatch(self.match_mode.clone())),
        }
    }

    /// Pool size: `concurrency` or the host's parallelism.
    pub fn pool_size(&self) -> usize {
        self.concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.match_mode()?;
        if self.concurrency == Some(0) {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

/// Durations as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
