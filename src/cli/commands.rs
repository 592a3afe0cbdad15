use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::{Cli, CliError, CliResult, ExitCode, cli_defaults};
use crate::emit::run_result::{emit_run_json, emit_run_yaml, emit_runs_json, emit_runs_yaml};
use crate::runner::config::{DEFAULT_CONFIG_FILE, RunConfig};
use crate::runner::context::RunContext;
use crate::runner::display::{format_results, format_run_header, format_summary};
use crate::runner::executor::{RunError, TestRunner};
use crate::runner::report::{RunReport, SummaryReport, to_report};
use crate::snapshot::UpdatePolicy;

/// Output format for run results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
}

impl std::str::FromStr for OutputFormat {
    type Err = CliError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "yaml" => Ok(Self::Yaml),
            other => Err(CliError::failure(format!(
                "Unknown format '{other}'. Use: text, json, yaml"
            ))),
        }
    }
}

/// Options for a test run, as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub patterns: Vec<String>,
    pub config: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub update_snapshot: bool,
    pub tags: Vec<String>,
    pub match_mode: Option<String>,
    pub timeout_ms: Option<u64>,
    pub fail_fast: bool,
    pub verbose: bool,
    pub runs: usize,
    pub failed: Vec<String>,
    pub seed: Option<u64>,
    pub plugins: Vec<String>,
    pub root: Option<PathBuf>,
    pub format: String,
    pub output: Option<PathBuf>,
    pub log: Option<String>,
}

impl From<Cli> for RunOptions {
    fn from(cli: Cli) -> Self {
        Self {
            patterns: cli.patterns,
            config: cli.config,
            concurrency: cli.concurrency,
            update_snapshot: cli.update_snapshot,
            tags: cli.tags,
            match_mode: cli.match_mode,
            timeout_ms: cli.timeout,
            fail_fast: cli.fail_fast,
            verbose: cli.verbose,
            runs: cli.runs,
            failed: cli.failed,
            seed: cli.seed,
            plugins: cli.plugins,
            root: cli.root,
            format: cli.format,
            output: cli.output,
            log: cli.log,
        }
    }
}

impl RunOptions {
    /// Build the run configuration: the config file first, flags on top.
    ///
    /// The config file is `--config` when given, else `testpool.yaml` in the
    /// root directory when it exists.
    pub fn to_config(&self) -> CliResult<RunConfig> {
        let mut config = match self.config_file() {
            Some(path) => RunConfig {
                handle_signals: true,
                ..RunConfig::from_file(&path).map_err(|e| CliError::failure(e.to_string()))?
            },
            None => cli_defaults(),
        };

        if !self.patterns.is_empty() {
            config.tests = self.patterns.clone();
        }
        if self.concurrency.is_some() {
            config.concurrency = self.concurrency;
        }
        if self.update_snapshot {
            config.update_snapshot = UpdatePolicy::All;
        }
        if !self.tags.is_empty() {
            config.tags = self.tags.clone();
        }
        if let Some(mode) = &self.match_mode {
            config.match_mode = mode.clone();
        }
        if let Some(ms) = self.timeout_ms {
            config.timeout = Duration::from_millis(ms);
        }
        config.fail_fast |= self.fail_fast;
        config.verbose |= self.verbose;
        if !self.failed.is_empty() {
            config.failed = self.failed.clone();
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if !self.plugins.is_empty() {
            config.plugins = self.plugins.clone();
        }
        if self.root.is_some() {
            config.root = self.root.clone();
        }
        if self.log.is_some() {
            config.log = self.log.clone();
        }

        config.validate().map_err(|e| CliError::failure(e.to_string()))?;
        Ok(config)
    }

    fn config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config {
            return Some(path.clone());
        }
        let root = self.root.as_deref().unwrap_or(Path::new("."));
        let default = root.join(DEFAULT_CONFIG_FILE);
        default.is_file().then_some(default)
    }
}

/// Run the configured tests `options.runs` times and write the results.
pub async fn run_tests(options: &RunOptions, config: RunConfig) -> CliResult<ExitCode> {
    let format: OutputFormat = options.format.parse()?;
    let contexts = execute_runs(config, options.runs.max(1)).await?;

    let output = render(&contexts, format);
    match &options.output {
        Some(path) => {
            std::fs::write(path, &output)
                .map_err(|e| CliError::failure(format!("Failed to write {}: {e}", path.display())))?;
            tracing::info!(path = %path.display(), "results written");
        }
        None => println!("{output}"),
    }

    Ok(exit_code(&contexts))
}

/// Run the engine `runs` times. Stops early after an interrupted run.
///
/// # Errors
///
/// Returns a [`CliError`] when a run cannot start: invalid configuration or
/// no matching test files.
pub async fn execute_runs(config: RunConfig, runs: usize) -> CliResult<Vec<RunContext>> {
    let mut contexts = Vec::with_capacity(runs);
    for i in 0..runs {
        if runs > 1 {
            tracing::info!(run = i + 1, of = runs, "starting repeated run");
        }
        let ctx = TestRunner::new(config.clone()).run().await.map_err(start_error)?;
        let stop = matches!(
            ctx.err(),
            Some(RunError::Interrupted | RunError::ForcedTermination)
        );
        contexts.push(ctx);
        if stop {
            break;
        }
    }
    Ok(contexts)
}

fn start_error(err: RunError) -> CliError {
    CliError::failure(err.to_string())
}

/// Render settled runs in the requested format.
pub fn render(contexts: &[RunContext], format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => render_text(contexts),
        OutputFormat::Json | OutputFormat::Yaml => {
            let reports: Vec<RunReport> = contexts.iter().map(to_report).collect();
            match (format, reports.as_slice()) {
                (OutputFormat::Json, [single]) => emit_run_json(single),
                (OutputFormat::Json, _) => emit_runs_json(&reports),
                (_, [single]) => emit_run_yaml(single),
                (_, _) => emit_runs_yaml(&reports),
            }
        }
    }
}

fn render_text(contexts: &[RunContext]) -> String {
    let mut lines = Vec::new();
    let mut summary = SummaryReport {
        success: true,
        ..SummaryReport::default()
    };
    let mut secs = 0.0;

    for (i, ctx) in contexts.iter().enumerate() {
        if contexts.len() > 1 {
            lines.push(format!("Run {}/{}", i + 1, contexts.len()));
        }
        lines.push(format_run_header(ctx.files().len(), ctx.config().pool_size()));
        lines.extend(format_results(ctx, ctx.config().verbose));
        if let Some(err) = ctx.err() {
            lines.push(format!("\nerror: {err}"));
        }
        summary.add(&to_report(ctx).summary);
        secs += ctx.duration().as_secs_f64();
    }

    lines.push(format_summary(&summary, secs));
    lines.join("\n")
}

/// The most severe exit code across all runs.
pub fn exit_code(contexts: &[RunContext]) -> ExitCode {
    contexts
        .iter()
        .map(|ctx| ExitCode::for_run(ctx.success(), ctx.err()))
        .max()
        .unwrap_or(ExitCode::SUCCESS)
}
