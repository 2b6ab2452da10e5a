//! External test command execution
//!
//! Each test file runs as its own OS process with the environment's
//! URLs and the fixture bundle path injected. The command is expected
//! to emit a machine-parseable summary as the last JSON line on
//! stdout:
//!
//! ```json
//! {"tests": 4, "passed": 3, "failed": 1, "skipped": 0,
//!  "failures": [{"test": "adds a term", "message": "expected 201"}]}
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use lingotest_common::{Error, Result, TestFailure, TestResult};

/// How to invoke the external test command
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// e.g. `npx`
    pub command: String,
    /// e.g. `["vitest", "run", "--reporter=json"]`; the file path is
    /// appended per invocation
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ReporterSummary {
    tests: usize,
    passed: usize,
    failed: usize,
    #[serde(default)]
    skipped: usize,
    #[serde(default)]
    failures: Vec<ReporterFailure>,
}

#[derive(Debug, Deserialize)]
struct ReporterFailure {
    test: String,
    message: String,
}

/// Run one test file to completion, enforcing the timeout
pub async fn run_file(
    config: &ExecConfig,
    suite: &str,
    file: &Path,
    env: &HashMap<String, String>,
    timeout_ms: u64,
) -> Result<TestResult> {
    let started = Instant::now();

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .arg(file)
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    debug!(suite, file = %file.display(), "executing test file");

    let mut child = cmd.spawn().map_err(|source| Error::Spawn {
        command: config.command.clone(),
        source,
    })?;

    let output = match timeout(
        Duration::from_millis(timeout_ms),
        child.wait_with_output(),
    )
    .await
    {
        Ok(output) => output?,
        Err(_elapsed) => {
            // wait_with_output consumed the child; kill_on_drop has
            // already sent SIGKILL by the time we get here
            return Err(Error::ExecutionTimeout {
                file: file.display().to_string(),
                timeout_ms,
            });
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    let stdout = String::from_utf8_lossy(&output.stdout);

    match parse_summary(&stdout) {
        Some(summary) => Ok(TestResult {
            suite: suite.to_string(),
            file: file.to_path_buf(),
            tests: summary.tests,
            passed: summary.passed,
            failed: summary.failed,
            skipped: summary.skipped,
            duration_ms,
            failures: summary
                .failures
                .into_iter()
                .map(|f| TestFailure {
                    test: f.test,
                    message: f.message,
                })
                .collect(),
            violations: Vec::new(),
        }),
        None if !output.status.success() => Err(Error::CommandFailed {
            file: file.display().to_string(),
            code: output.status.code(),
        }),
        None => Err(Error::ReporterParse(format!(
            "no summary line in output of {}",
            file.display()
        ))),
    }
}

/// The summary is the last stdout line that parses as a reporter
/// object; diagnostic noise above it is ignored.
fn parse_summary(stdout: &str) -> Option<ReporterSummary> {
    stdout
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<ReporterSummary>(line.trim()).ok())
}
