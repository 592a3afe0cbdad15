//! Lifecycle hooks for third-party plugins.
//!
//! A plugin implements any subset of the five phase methods on [`Plugin`];
//! the rest default to no-ops. [`HookPipeline`] runs one phase across all
//! configured plugins, strictly in configuration order.

pub mod pipeline;
pub mod registry;

use std::fmt;

use crate::runner::context::RunContext;
use crate::runner::registration::Registration;
use crate::suite::TestScope;

pub use pipeline::{HookFailure, HookPipeline};
pub use registry::{PluginRegistry, TracePlugin};

/// A named point in the run, file or test lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    /// Once, before any file is registered.
    Before,
    /// Once per file, inside the registration worker.
    Registration,
    /// Once per dispatched test, before its body.
    BeforeEach,
    /// Once per dispatched test whose `beforeEach` ran, even on failure.
    AfterEach,
    /// Once, after every test settled.
    After,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Before => write!(f, "before"),
            Self::Registration => write!(f, "registration"),
            Self::BeforeEach => write!(f, "beforeEach"),
            Self::AfterEach => write!(f, "afterEach"),
            Self::After => write!(f, "after"),
        }
    }
}

/// Error returned by a hook.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PluginError {
    pub message: String,
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Hooks a plugin may provide. All of them run on blocking threads, so
/// plugins are free to do blocking I/O.
///
/// `before` and `after` see a copy of the run context; changes to its
/// `state` map are kept, everything else is read-only in effect. A second
/// interrupt abandons a running `before` or `after` hook without waiting for
/// it to return.
pub trait Plugin: Send + Sync {
    /// Name the plugin is configured under.
    fn name(&self) -> &str;

    fn before(&self, _context: &mut RunContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// May supply the file's tests or install an augmentation function.
    fn registration(&self, _registration: &mut Registration) -> Result<(), PluginError> {
        Ok(())
    }

    fn before_each(&self, _scope: &mut TestScope) -> Result<(), PluginError> {
        Ok(())
    }

    fn after_each(&self, _scope: &mut TestScope) -> Result<(), PluginError> {
        Ok(())
    }

    fn after(&self, _context: &mut RunContext) -> Result<(), PluginError> {
        Ok(())
    }
}
