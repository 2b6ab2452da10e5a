//! Batched Playwright invocation
//!
//! End-to-end suites that allow parallelism invoke Playwright once
//! with the full file list and `--reporter=json`, letting it manage
//! its own worker pool and paying its startup cost once. The JSON
//! report's nested suite/spec/test tree is then walked and every test
//! re-attributed to its originating file so per-file results stay
//! accurate.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use lingotest_common::{Error, Result, TestFailure, TestResult, TestSuite};

/// How to invoke the browser-automation command
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub command: String,
    /// e.g. `["playwright", "test", "--reporter=json"]`
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            command: "npx".to_string(),
            args: vec![
                "playwright".to_string(),
                "test".to_string(),
                "--reporter=json".to_string(),
            ],
            working_dir: None,
        }
    }
}

// Playwright JSON reporter shapes, reduced to the fields we read
#[derive(Debug, Deserialize)]
struct Report {
    #[serde(default)]
    suites: Vec<ReportSuite>,
}

#[derive(Debug, Deserialize)]
struct ReportSuite {
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    suites: Vec<ReportSuite>,
    #[serde(default)]
    specs: Vec<ReportSpec>,
}

#[derive(Debug, Deserialize)]
struct ReportSpec {
    title: String,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    tests: Vec<ReportTest>,
}

#[derive(Debug, Deserialize)]
struct ReportTest {
    #[serde(default)]
    results: Vec<ReportAttempt>,
}

#[derive(Debug, Deserialize)]
struct ReportAttempt {
    status: String,
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    error: Option<ReportError>,
}

#[derive(Debug, Deserialize)]
struct ReportError {
    #[serde(default)]
    message: String,
}

/// Run the whole file list in one invocation
pub async fn run_batch(
    config: &PlaywrightConfig,
    suite: &TestSuite,
    env: &HashMap<String, String>,
) -> Result<Vec<TestResult>> {
    let started = Instant::now();

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .args(&suite.files)
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    debug!(suite = %suite.name, files = suite.files.len(), "batched playwright run");

    let child = cmd.spawn().map_err(|source| Error::Spawn {
        command: config.command.clone(),
        source,
    })?;

    // The whole batch gets the per-file budget times the file count
    let batch_timeout = suite.timeout_ms * suite.files.len().max(1) as u64;
    let output = match timeout(
        Duration::from_millis(batch_timeout),
        child.wait_with_output(),
    )
    .await
    {
        Ok(output) => output?,
        Err(_elapsed) => {
            return Err(Error::ExecutionTimeout {
                file: format!("{} (batch)", suite.name),
                timeout_ms: batch_timeout,
            })
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let results = parse_report(&stdout, suite)?;

    debug!(
        suite = %suite.name,
        duration_ms = started.elapsed().as_millis() as u64,
        "batch complete"
    );
    Ok(results)
}

/// Parse the JSON report and attribute per-file results in the
/// suite's original file order
pub fn parse_report(stdout: &str, suite: &TestSuite) -> Result<Vec<TestResult>> {
    // Playwright may print warnings before the report object
    let json_start = stdout
        .find('{')
        .ok_or_else(|| Error::ReporterParse("no JSON object in playwright output".to_string()))?;
    let report: Report = serde_json::from_str(&stdout[json_start..])
        .map_err(|e| Error::ReporterParse(format!("playwright report: {e}")))?;

    // file path -> accumulated counts
    let mut by_file: HashMap<String, TestResult> = HashMap::new();
    for top in &report.suites {
        collect(top, top.file.as_deref(), &suite.name, &mut by_file);
    }

    let mut results = Vec::with_capacity(suite.files.len());
    for file in &suite.files {
        let matched = by_file
            .keys()
            .find(|reported| paths_match(file, reported))
            .cloned();
        match matched.and_then(|key| by_file.remove(&key)) {
            Some(mut result) => {
                result.file = file.clone();
                results.push(result);
            }
            None => {
                warn!(file = %file.display(), "no tests reported for file");
                results.push(TestResult {
                    suite: suite.name.clone(),
                    file: file.clone(),
                    tests: 0,
                    passed: 0,
                    failed: 0,
                    skipped: 0,
                    duration_ms: 0,
                    failures: Vec::new(),
                    violations: Vec::new(),
                });
            }
        }
    }
    Ok(results)
}

fn collect(
    node: &ReportSuite,
    inherited_file: Option<&str>,
    suite_name: &str,
    by_file: &mut HashMap<String, TestResult>,
) {
    let here = node.file.as_deref().or(inherited_file);

    for spec in &node.specs {
        let Some(file) = spec.file.as_deref().or(here) else {
            continue;
        };
        let entry = by_file
            .entry(file.to_string())
            .or_insert_with(|| TestResult {
                suite: suite_name.to_string(),
                file: PathBuf::from(file),
                tests: 0,
                passed: 0,
                failed: 0,
                skipped: 0,
                duration_ms: 0,
                failures: Vec::new(),
                violations: Vec::new(),
            });

        for test in &spec.tests {
            entry.tests += 1;
            // The last attempt decides the outcome; retries inside
            // Playwright count toward duration
            entry.duration_ms += test.results.iter().map(|r| r.duration).sum::<u64>();
            match test.results.last().map(|r| r.status.as_str()) {
                Some("passed") => entry.passed += 1,
                Some("skipped") | None => entry.skipped += 1,
                Some(_) => {
                    entry.failed += 1;
                    let message = test
                        .results
                        .last()
                        .and_then(|r| r.error.as_ref())
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "test failed".to_string());
                    entry.failures.push(TestFailure {
                        test: spec.title.clone(),
                        message,
                    });
                }
            }
        }
    }

    for child in &node.suites {
        collect(child, here, suite_name, by_file);
    }
}

/// Reporter paths are usually relative to the Playwright project root
fn paths_match(declared: &Path, reported: &str) -> bool {
    let reported = Path::new(reported);
    declared.ends_with(reported) || reported.ends_with(declared)
}
