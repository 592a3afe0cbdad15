//! Command-line interface for the test engine.
//!
//! Command functions return `CliResult<T>` instead of calling
//! `process::exit`; only [`run`] turns errors into exit codes.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod commands;

use std::fmt;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::runner::config::RunConfig;
use crate::runner::executor::RunError;

/// Exit code for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExitCode(pub i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    /// Failed tests, or the run errored.
    pub const FAILURE: ExitCode = ExitCode(1);
    /// The run stopped early because fail-fast tripped.
    pub const FAIL_FAST: ExitCode = ExitCode(2);
    /// First interrupt: the run drained and ran its `after` phase.
    pub const INTERRUPTED: ExitCode = ExitCode(130);
    /// Second interrupt: the run was torn down immediately.
    pub const FORCED: ExitCode = ExitCode(131);

    /// Exit code for one settled run.
    pub fn for_run(success: bool, err: Option<&RunError>) -> Self {
        match err {
            Some(RunError::ForcedTermination) => Self::FORCED,
            Some(RunError::Interrupted) => Self::INTERRUPTED,
            Some(RunError::FailFast) => Self::FAIL_FAST,
            Some(_) => Self::FAILURE,
            None if success => Self::SUCCESS,
            None => Self::FAILURE,
        }
    }
}

/// Error type for CLI operations.
///
/// Contains a user-facing message and an exit code. The CLI entry point
/// catches these errors, prints the message, and exits with the code.
#[derive(Debug)]
pub struct CliError {
    /// User-facing error message (already formatted for display)
    pub message: String,
    /// Exit code to return to the shell
    pub exit_code: ExitCode,
}

impl CliError {
    /// Create a new CLI error with a message and exit code.
    pub fn new(message: impl Into<String>, exit_code: ExitCode) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }

    /// Create a failure error (exit code 1).
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(message, ExitCode::FAILURE)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

/// Run test files concurrently.
#[derive(Parser, Debug)]
#[command(name = "testpool", version, about = "Run test files concurrently", long_about = None)]
pub struct Cli {
    /// Test files, directories or glob patterns (default: *tests.yaml, tests/**/*tests.yaml)
    #[arg(value_name = "PATTERNS")]
    pub patterns: Vec<String>,

    /// Workers per pool (default: available parallelism)
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Write new snapshots and overwrite mismatching ones
    #[arg(short = 'u', long)]
    pub update_snapshot: bool,

    /// Only run tests with this tag (repeatable)
    #[arg(short, long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,

    /// How tags combine: some or every
    #[arg(short, long = "match", value_name = "MODE")]
    pub match_mode: Option<String>,

    /// Per-test timeout in milliseconds
    #[arg(short = 'T', long, value_name = "MS")]
    pub timeout: Option<u64>,

    /// Stop dispatching after the first failure
    #[arg(short, long)]
    pub fail_fast: bool,

    /// Show file:line and duration with each result
    #[arg(short, long)]
    pub verbose: bool,

    /// Repeat the run this many times
    #[arg(short, long, default_value_t = 1)]
    pub runs: usize,

    /// Only run tests with this name (repeatable)
    #[arg(short = 'F', long = "failed", value_name = "NAME")]
    pub failed: Vec<String>,

    /// Seed for shuffling files and tests
    #[arg(long)]
    pub seed: Option<u64>,

    /// Plugin to enable (repeatable)
    #[arg(short, long = "plugin", value_name = "NAME")]
    pub plugins: Vec<String>,

    /// Directory patterns are resolved against (default: current directory)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Config file (default: testpool.yaml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Output format: text, json or yaml
    #[arg(long, default_value = "text")]
    pub format: String,

    /// Output file (default: stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, value_name = "LEVEL")]
    pub log: Option<String>,
}

/// Main CLI entry point.
///
/// Parses arguments, executes the command, and handles errors.
/// This is the only function that calls `process::exit`.
pub fn run() {
    let cli = Cli::parse();

    let code = match execute(cli) {
        Ok(code) => code,
        Err(e) => {
            if !e.message.is_empty() {
                eprintln!("error: {}", e.message);
            }
            e.exit_code
        }
    };
    process::exit(code.0);
}

fn execute(cli: Cli) -> CliResult<ExitCode> {
    let options = commands::RunOptions::from(cli);
    let config = options.to_config()?;
    init_logging(config.log.as_deref());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::failure(format!("failed to start runtime: {e}")))?;
    let code = runtime.block_on(commands::run_tests(&options, config));
    // Don't wait on hooks or test bodies a forced termination abandoned.
    runtime.shutdown_background();
    code
}

/// Install the tracing subscriber on stderr. `RUST_LOG` wins over `level`.
fn init_logging(level: Option<&str>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info"))),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Default configuration with signal handling on, as the binary runs it.
pub fn cli_defaults() -> RunConfig {
    RunConfig {
        handle_signals: true,
        ..RunConfig::default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_by_outcome() {
        assert_eq!(ExitCode::for_run(true, None), ExitCode::SUCCESS);
        assert_eq!(ExitCode::for_run(false, None), ExitCode::FAILURE);
        assert_eq!(ExitCode::for_run(false, Some(&RunError::FailFast)), ExitCode::FAIL_FAST);
        assert_eq!(ExitCode::for_run(true, Some(&RunError::Interrupted)), ExitCode(130));
        assert_eq!(ExitCode::for_run(true, Some(&RunError::ForcedTermination)), ExitCode(131));
        assert_eq!(
            ExitCode::for_run(true, Some(&RunError::Snapshot("disk full".into()))),
            ExitCode::FAILURE
        );
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "testpool", "tests/", "-c", "4", "-u", "-t", "qa", "-t", "dev", "-m", "every", "-T",
            "500", "-f", "-v", "-r", "2", "-F", "login", "--seed", "7", "--format", "json",
        ])
        .unwrap();
        assert_eq!(cli.patterns, vec!["tests/"]);
        assert_eq!(cli.concurrency, Some(4));
        assert!(cli.update_snapshot);
        assert_eq!(cli.tags, vec!["qa", "dev"]);
        assert_eq!(cli.match_mode.as_deref(), Some("every"));
        assert_eq!(cli.timeout, Some(500));
        assert!(cli.fail_fast && cli.verbose);
        assert_eq!(cli.runs, 2);
        assert_eq!(cli.failed, vec!["login"]);
        assert_eq!(cli.seed, Some(7));
        assert_eq!(cli.format, "json");
    }

    #[test]
    fn cli_defaults_handle_signals() {
        assert!(cli_defaults().handle_signals);
        let cli = Cli::try_parse_from(["testpool"]).unwrap();
        assert_eq!(cli.runs, 1);
        assert_eq!(cli.format, "text");
    }
}
