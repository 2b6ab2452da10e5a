//! Declarative suite descriptions and per-file results

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// What kind of tests a suite contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteKind {
    Unit,
    Integration,
    EndToEnd,
    Contract,
}

/// Whether a suite needs its own environment or can share one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Own backend+frontend pair, torn down after the suite
    #[default]
    Isolated,
    /// Reuses the long-lived shared pair, runs environment-serial
    Shared,
}

/// A declarative unit of scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuite {
    /// Unique name for this suite
    pub name: String,

    /// Test files to execute
    pub files: Vec<PathBuf>,

    /// Kind of tests in this suite
    pub kind: SuiteKind,

    #[serde(default)]
    pub isolation: IsolationMode,

    /// Whether files within the suite may run concurrently
    #[serde(default)]
    pub parallel: bool,

    /// Per-file execution timeout
    #[serde(default = "default_file_timeout")]
    pub timeout_ms: u64,

    /// How many times a failing file is re-executed
    #[serde(default)]
    pub retries: u32,
}

fn default_file_timeout() -> u64 {
    120_000
}

impl TestSuite {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load every suite declaration under a directory
    pub fn load_all(dir: &Path) -> Result<Vec<Self>> {
        let mut suites = Vec::new();

        for entry in walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            suites.push(Self::from_file(entry.path())?);
        }

        Ok(suites)
    }
}

/// One failed test within a file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestFailure {
    pub test: String,
    pub message: String,
}

/// Outcome of one test file within one suite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub suite: String,
    pub file: PathBuf,
    pub tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    #[serde(default)]
    pub failures: Vec<TestFailure>,
    #[serde(default)]
    pub violations: Vec<ContractViolation>,
}

impl TestResult {
    /// A result recording an error that prevented the file from
    /// producing its own counts (spawn failure, timeout, ...)
    pub fn from_error(suite: &str, file: &Path, message: String) -> Self {
        Self {
            suite: suite.to_string(),
            file: file.to_path_buf(),
            tests: 1,
            passed: 0,
            failed: 1,
            skipped: 0,
            duration_ms: 0,
            failures: vec![TestFailure {
                test: file.display().to_string(),
                message,
            }],
            violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Which half of an HTTP exchange violated its schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Request,
    Response,
}

/// A detected mismatch between a live exchange and its declared schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractViolation {
    /// `"METHOD path-template"` key of the endpoint
    pub endpoint: String,
    pub direction: Direction,
    pub expected: String,
    pub actual: serde_json::Value,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Aggregate of a whole run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub suites: usize,
    pub failed_suites: usize,
    pub results: Vec<TestResult>,
}

impl RunSummary {
    pub fn from_results(results: Vec<TestResult>, duration_ms: u64) -> Self {
        let mut summary = Self {
            duration_ms,
            ..Default::default()
        };

        let mut suites = std::collections::BTreeSet::new();
        let mut failed_suites = std::collections::BTreeSet::new();

        for r in &results {
            summary.total += r.tests;
            summary.passed += r.passed;
            summary.failed += r.failed;
            summary.skipped += r.skipped;
            suites.insert(r.suite.clone());
            if !r.is_success() {
                failed_suites.insert(r.suite.clone());
            }
        }

        summary.suites = suites.len();
        summary.failed_suites = failed_suites.len();
        summary.results = results;
        summary
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suite_yaml() {
        let yaml = r#"
name: vocabulary-api
kind: integration
isolation: shared
files:
  - tests/integration/vocabulary.spec.ts
  - tests/integration/progress.spec.ts
retries: 1
"#;
        let suite = TestSuite::from_yaml(yaml).unwrap();
        assert_eq!(suite.name, "vocabulary-api");
        assert_eq!(suite.kind, SuiteKind::Integration);
        assert_eq!(suite.isolation, IsolationMode::Shared);
        assert_eq!(suite.files.len(), 2);
        assert_eq!(suite.retries, 1);
        assert!(!suite.parallel);
        assert_eq!(suite.timeout_ms, 120_000);
    }

    #[test]
    fn test_summary_counts_distinct_suites() {
        let ok = TestResult {
            suite: "a".into(),
            file: "x.ts".into(),
            tests: 3,
            passed: 3,
            failed: 0,
            skipped: 0,
            duration_ms: 10,
            failures: vec![],
            violations: vec![],
        };
        let bad = TestResult::from_error("b", Path::new("y.ts"), "boom".into());

        let summary = RunSummary::from_results(vec![ok.clone(), ok, bad], 25);
        assert_eq!(summary.total, 7);
        assert_eq!(summary.passed, 6);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.suites, 2);
        assert_eq!(summary.failed_suites, 1);
        assert!(!summary.is_success());
    }
}
