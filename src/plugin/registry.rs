use std::sync::Arc;

use tracing::{debug, info};

use crate::plugin::{HookPipeline, Plugin, PluginError};
use crate::runner::config::ConfigError;
use crate::runner::context::RunContext;
use crate::runner::registration::Registration;
use crate::suite::TestScope;

/// Registry of plugins a configuration may name.
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    /// A registry holding the built-in plugins.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TracePlugin));
        registry
    }

    /// Look up a plugin by name.
    pub fn get(&self, name: &str) -> Option<&dyn Plugin> {
        self.plugins
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
    }

    /// List all registered plugin names.
    pub fn list(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Register an additional plugin. A later registration under the same
    /// name shadows nothing; lookups return the first.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// Build a pipeline from configured names, keeping their order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownPlugin`] for a name nothing registered.
    pub fn resolve(&self, names: &[String]) -> Result<HookPipeline, ConfigError> {
        let mut chosen = Vec::with_capacity(names.len());
        for name in names {
            let plugin = self
                .plugins
                .iter()
                .find(|p| p.name() == name)
                .ok_or_else(|| ConfigError::UnknownPlugin(name.clone()))?;
            chosen.push(Arc::clone(plugin));
        }
        Ok(HookPipeline::new(chosen))
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Emits a tracing event at every lifecycle point.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracePlugin;

impl Plugin for TracePlugin {
    fn name(&self) -> &str {
        "trace"
    }

    fn before(&self, context: &mut RunContext) -> Result<(), PluginError> {
        info!(root = %context.root().display(), "run starting");
        Ok(())
    }

    fn registration(&self, registration: &mut Registration) -> Result<(), PluginError> {
        debug!(file = %registration.file.relative_path.display(), "registering file");
        Ok(())
    }

    fn before_each(&self, scope: &mut TestScope) -> Result<(), PluginError> {
        debug!(test = %scope.test.name, file = %scope.file.relative_path.display(), "test starting");
        Ok(())
    }

    fn after_each(&self, scope: &mut TestScope) -> Result<(), PluginError> {
        debug!(test = %scope.test.name, "test finished");
        Ok(())
    }

    fn after(&self, context: &mut RunContext) -> Result<(), PluginError> {
        info!(
            run = context.tests_run(),
            passed = context.passed().len(),
            failed = context.failed().len(),
            "run finished"
        );
        Ok(())
    }
}
