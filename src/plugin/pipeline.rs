use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::debug;

use crate::plugin::{HookPhase, Plugin, PluginError};
use crate::runner::context::RunContext;
use crate::runner::registration::Registration;
use crate::runner::result::panic_message;
use crate::suite::TestScope;

/// A hook that failed, with the plugin and phase it failed in.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("plugin {plugin} failed during {phase}: {error}")]
pub struct HookFailure {
    pub plugin: String,
    pub phase: HookPhase,
    #[source]
    pub error: PluginError,
}

/// The configured plugins, in order. Cheap to clone into workers.
#[derive(Clone, Default)]
pub struct HookPipeline {
    plugins: Arc<Vec<Arc<dyn Plugin>>>,
}

impl HookPipeline {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self {
            plugins: Arc::new(plugins),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// # Errors
    ///
    /// Returns the first [`HookFailure`]; later plugins do not run.
    pub fn before(&self, context: &mut RunContext) -> Result<(), HookFailure> {
        self.run(HookPhase::Before, context, |p, c| p.before(c))
    }

    /// # Errors
    ///
    /// Returns the first [`HookFailure`]; later plugins do not run.
    pub fn registration(&self, registration: &mut Registration) -> Result<(), HookFailure> {
        self.run(HookPhase::Registration, registration, |p, r| p.registration(r))
    }

    /// # Errors
    ///
    /// Returns the first [`HookFailure`]; later plugins do not run.
    pub fn before_each(&self, scope: &mut TestScope) -> Result<(), HookFailure> {
        self.run(HookPhase::BeforeEach, scope, |p, s| p.before_each(s))
    }

    /// # Errors
    ///
    /// Returns the first [`HookFailure`]; later plugins do not run.
    pub fn after_each(&self, scope: &mut TestScope) -> Result<(), HookFailure> {
        self.run(HookPhase::AfterEach, scope, |p, s| p.after_each(s))
    }

    /// # Errors
    ///
    /// Returns the first [`HookFailure`]; later plugins do not run.
    pub fn after(&self, context: &mut RunContext) -> Result<(), HookFailure> {
        self.run(HookPhase::After, context, |p, c| p.after(c))
    }

    /// Run one phase sequentially. A panicking hook counts as a failure.
    fn run<T>(
        &self,
        phase: HookPhase,
        target: &mut T,
        hook: impl Fn(&dyn Plugin, &mut T) -> Result<(), PluginError>,
    ) -> Result<(), HookFailure> {
        for plugin in self.plugins.iter() {
            debug!(plugin = plugin.name(), %phase, "running hook");
            let result = catch_unwind(AssertUnwindSafe(|| hook(plugin.as_ref(), target)))
                .unwrap_or_else(|payload| {
                    Err(PluginError::new(format!(
                        "hook panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                });
            result.map_err(|error| HookFailure {
                plugin: plugin.name().to_owned(),
                phase,
                error,
            })?;
        }
        Ok(())
    }
}
