//! YAML test files whose tests are shell commands.
//!
//! ```yaml
//! tests:
//!   prints greeting:
//!     run: echo hello
//!     tags: [smoke]
//!     expect:
//!       stdout: hello
//!   greeting output is stable:
//!     run: echo hello
//!     snapshot: true
//! ```

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Deserialize;

use crate::runner::result::{FailureKind, TestFailure};
use crate::suite::loader::{LoadError, TestLoader};
use crate::suite::{TestContext, TestDefinition, TestDescriptor, TestFn, TestMap};

/// How often a running command is polled for exit or cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Deserialize)]
struct ShellFile {
    #[serde(default)]
    tests: BTreeMap<String, ShellTest>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShellTest {
    run: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    skip: bool,
    #[serde(default)]
    only: bool,
    #[serde(default)]
    warn: bool,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    expect: ShellExpect,
    /// Snapshot the command's stdout.
    #[serde(default)]
    snapshot: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShellExpect {
    #[serde(default)]
    status: i32,
    stdout: Option<String>,
    stderr: Option<String>,
}

/// Loader for `*.yaml`/`*.yml` test files.
#[derive(Debug, Clone)]
pub struct ShellLoader {
    /// Shell interpreter (default: "/bin/sh").
    pub shell: String,
    /// Flags passed before `-c` (default: ["-e"]).
    pub shell_args: Vec<String>,
}

impl ShellLoader {
    pub fn new() -> Self {
        Self {
            shell: "/bin/sh".to_owned(),
            shell_args: vec!["-e".to_owned()],
        }
    }

    fn build_test(&self, path: &Path, source: &str, name: &str, entry: ShellTest) -> TestDefinition {
        let mut descriptor = TestDescriptor::new(name);
        descriptor.tags = entry.tags.iter().cloned().collect();
        descriptor.skip = entry.skip;
        descriptor.only = entry.only;
        descriptor.warn = entry.warn;
        descriptor.line_number = line_of_key(source, name);

        let command = ShellCommand {
            shell: self.shell.clone(),
            shell_args: self.shell_args.clone(),
            working_dir: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            test: entry,
        };
        let body: TestFn = Arc::new(move |t: &mut TestContext| command.run(t));
        TestDefinition::from_parts(descriptor, body)
    }
}

impl Default for ShellLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl TestLoader for ShellLoader {
    fn name(&self) -> &str {
        "shell"
    }

    fn handles(&self, path: &Path) -> bool {
        path.extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
    }

    fn load(&self, path: &Path) -> Result<TestMap, LoadError> {
        let source = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ShellFile = serde_yaml::from_str(&source).map_err(|e| LoadError::Invalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        Ok(file
            .tests
            .into_iter()
            .map(|(name, entry)| {
                let test = self.build_test(path, &source, &name, entry);
                (test.descriptor.key.clone(), test)
            })
            .collect())
    }
}

/// 1-based line where `name` appears as a mapping key.
fn line_of_key(source: &str, name: &str) -> Option<u32> {
    let plain = format!("{name}:");
    let double = format!("\"{name}\":");
    let single = format!("'{name}':");
    source
        .lines()
        .position(|line| {
            let line = line.trim_start();
            line.starts_with(&plain) || line.starts_with(&double) || line.starts_with(&single)
        })
        .and_then(|i| u32::try_from(i + 1).ok())
}

/// One shell test, captured by its body closure.
#[derive(Debug, Clone)]
struct ShellCommand {
    shell: String,
    shell_args: Vec<String>,
    working_dir: PathBuf,
    test: ShellTest,
}

/// Raw output from a finished command.
#[derive(Debug)]
struct ProcessOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl ShellCommand {
    fn run(&self, t: &mut TestContext) -> Result<(), TestFailure> {
        let output = self.execute(t)?;
        let expect = &self.test.expect;

        t.assert(
            output.exit_code == expect.status,
            format!(
                "command exited with code {}, expected {}",
                output.exit_code, expect.status
            ),
        )
        .map_err(|f| attach_stderr(f, &output.stderr))?;

        if let Some(fragment) = &expect.stdout {
            t.assert(
                output.stdout.contains(fragment.as_str()),
                format!("stdout does not contain {fragment:?}"),
            )
            .map_err(|f| f.with_detail(output.stdout.clone()))?;
        }

        if let Some(fragment) = &expect.stderr {
            t.assert(
                output.stderr.contains(fragment.as_str()),
                format!("stderr does not contain {fragment:?}"),
            )
            .map_err(|f| attach_stderr(f, &output.stderr))?;
        }

        if self.test.snapshot {
            t.match_snapshot_str(&output.stdout);
        }

        Ok(())
    }

    /// Run the command, killing it if the test is cancelled or times out.
    fn execute(&self, t: &TestContext) -> Result<ProcessOutput, TestFailure> {
        let mut cmd = Command::new(&self.shell);
        cmd.args(&self.shell_args)
            .arg("-c")
            .arg(&self.test.run)
            .current_dir(&self.working_dir)
            .envs(&self.test.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            TestFailure::new(FailureKind::Assertion, format!("failed to start command: {e}"))
        })?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if t.is_cancelled() {
                kill(&mut child);
                return Err(TestFailure::cancelled());
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    kill(&mut child);
                    return Err(TestFailure::new(
                        FailureKind::Assertion,
                        format!("failed to wait for command: {e}"),
                    ));
                }
            }
        };

        Ok(ProcessOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }
}

fn attach_stderr(failure: TestFailure, stderr: &str) -> TestFailure {
    if stderr.is_empty() {
        failure
    } else {
        failure.with_detail(stderr.to_owned())
    }
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Read a pipe to the end on its own thread so a chatty command never blocks.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
