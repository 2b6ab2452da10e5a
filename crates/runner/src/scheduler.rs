//! Suite scheduling: isolation partitioning, the rolling window,
//! retry, and bail

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use lingotest_common::{
    EventBus, IsolationMode, Result, RunEvent, RunSummary, SuiteKind, TestFailure, TestResult,
    TestSuite,
};
use lingotest_contract::ContractValidator;
use lingotest_fixtures::TestDataManager;
use lingotest_orchestrator::{Orchestrator, TestEnvironment};

use crate::exec::{self, ExecConfig};
use crate::playwright::{self, PlaywrightConfig};

/// Runner policy knobs
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Upper bound on concurrently live isolated environments
    pub max_workers: usize,
    /// Stop dequeuing new work on the first failing result
    pub bail: bool,
    /// Run-level retry count, used when a suite declares none
    pub retries: u32,
    /// Scenario seeded into every environment
    pub fixture_scenario: String,
    pub exec: ExecConfig,
    pub playwright: PlaywrightConfig,
    pub output_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            bail: false,
            retries: 0,
            fixture_scenario: "basic".to_string(),
            exec: ExecConfig {
                command: "npx".to_string(),
                args: vec!["vitest".to_string(), "run".to_string()],
                working_dir: None,
            },
            playwright: PlaywrightConfig::default(),
            output_dir: PathBuf::from("test-results"),
        }
    }
}

/// Top-level scheduler
///
/// Explicitly constructed with its collaborators; owns no global
/// state. One `run` call corresponds to one event-channel lifetime.
pub struct TestRunner {
    orchestrator: Arc<Orchestrator>,
    config: RunnerConfig,
    validator: Option<Arc<ContractValidator>>,
    events: EventBus,
    bailed: AtomicBool,
}

impl TestRunner {
    pub fn new(orchestrator: Arc<Orchestrator>, config: RunnerConfig, events: EventBus) -> Self {
        Self {
            orchestrator,
            config,
            validator: None,
            events,
            bailed: AtomicBool::new(false),
        }
    }

    /// Attach a contract validator; Contract-kind suites get its
    /// violation log attached to their results.
    pub fn with_validator(mut self, validator: Arc<ContractValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Execute every declared suite and aggregate the results
    pub async fn run(&self, suites: &[TestSuite]) -> RunSummary {
        let started = Instant::now();
        self.bailed.store(false, Ordering::SeqCst);

        let mut isolated = Vec::new();
        let mut shared = Vec::new();
        for (index, suite) in suites.iter().enumerate() {
            match suite.isolation {
                IsolationMode::Isolated => isolated.push((index, suite)),
                IsolationMode::Shared => shared.push((index, suite)),
            }
        }

        let mut indexed: Vec<(usize, Vec<TestResult>)> = Vec::new();
        indexed.extend(self.run_isolated(isolated).await);
        indexed.extend(self.run_shared(shared).await);

        // Final order is declaration order, not completion order
        indexed.sort_by_key(|(index, _)| *index);
        let results = indexed.into_iter().flat_map(|(_, r)| r).collect();

        RunSummary::from_results(results, started.elapsed().as_millis() as u64)
    }

    /// Each isolated suite gets its own environment; at most
    /// `max_workers` are live at once.
    async fn run_isolated(
        &self,
        suites: Vec<(usize, &TestSuite)>,
    ) -> Vec<(usize, Vec<TestResult>)> {
        let jobs: VecDeque<BoxFuture<(usize, Vec<TestResult>)>> = suites
            .into_iter()
            .map(|(index, suite)| {
                let fut: BoxFuture<(usize, Vec<TestResult>)> =
                    Box::pin(async move { (index, self.run_isolated_suite(suite).await) });
                fut
            })
            .collect();

        rolling_window(self.config.max_workers, jobs, || {
            self.bailed.load(Ordering::SeqCst)
        })
        .await
    }

    async fn run_isolated_suite(&self, suite: &TestSuite) -> Vec<TestResult> {
        self.events.emit(RunEvent::SuiteStarted {
            suite: suite.name.clone(),
        });

        let mut env = match self.orchestrator.provision(&suite.name).await {
            Ok(env) => env,
            Err(e) => {
                error!(suite = %suite.name, error = %e, "provisioning failed");
                let results = self.all_failed(suite, &e.to_string());
                self.note_failures(&suite.name, results.len());
                return results;
            }
        };

        let results = self.run_suite_in(suite, &env).await;
        env.stop().await;

        let failed = results.iter().filter(|r| !r.is_success()).count();
        self.note_failures(&suite.name, failed);
        results
    }

    /// Shared suites run environment-serial against one long-lived
    /// pair, amortizing startup cost.
    async fn run_shared(
        &self,
        suites: Vec<(usize, &TestSuite)>,
    ) -> Vec<(usize, Vec<TestResult>)> {
        if suites.is_empty() || self.bailed.load(Ordering::SeqCst) {
            return Vec::new();
        }

        let mut env = match self.orchestrator.provision("shared").await {
            Ok(env) => env,
            Err(e) => {
                error!(error = %e, "shared environment provisioning failed");
                return suites
                    .into_iter()
                    .map(|(index, suite)| {
                        let results = self.all_failed(suite, &e.to_string());
                        self.note_failures(&suite.name, results.len());
                        (index, results)
                    })
                    .collect();
            }
        };

        let mut out = Vec::new();
        for (index, suite) in suites {
            if self.bailed.load(Ordering::SeqCst) {
                break;
            }
            self.events.emit(RunEvent::SuiteStarted {
                suite: suite.name.clone(),
            });
            let results = self.run_suite_in(suite, &env).await;
            let failed = results.iter().filter(|r| !r.is_success()).count();
            self.note_failures(&suite.name, failed);
            out.push((index, results));
        }

        env.stop().await;
        out
    }

    /// Execute one suite's files inside an already-started environment
    async fn run_suite_in(&self, suite: &TestSuite, env: &TestEnvironment) -> Vec<TestResult> {
        let child_env = match self.seed_fixtures(suite, env) {
            Ok(child_env) => child_env,
            Err(e) => {
                error!(suite = %suite.name, error = %e, "fixture seeding failed");
                return self.all_failed(suite, &e.to_string());
            }
        };

        if suite.kind == SuiteKind::EndToEnd && suite.parallel {
            return self.run_e2e_batch(suite, &child_env).await;
        }

        // Contract suites run serial even when marked parallel, so
        // each file drains only its own entries from the shared
        // violation log
        if suite.parallel && suite.kind != SuiteKind::Contract {
            let jobs: VecDeque<BoxFuture<(usize, TestResult)>> = suite
                .files
                .iter()
                .enumerate()
                .map(|(i, file)| {
                    let child_env = child_env.clone();
                    let fut: BoxFuture<(usize, TestResult)> = Box::pin(async move {
                        (i, self.run_file_with_retry(suite, file, &child_env).await)
                    });
                    fut
                })
                .collect();

            let indexed = rolling_window(self.config.max_workers, jobs, || {
                self.bailed.load(Ordering::SeqCst)
            })
            .await;
            return indexed.into_iter().map(|(_, r)| r).collect();
        }

        let mut results = Vec::with_capacity(suite.files.len());
        for file in &suite.files {
            if self.bailed.load(Ordering::SeqCst) {
                break;
            }
            results.push(self.run_file_with_retry(suite, file, &child_env).await);
        }
        results
    }

    /// One Playwright invocation for the whole file list, then
    /// per-file retries for whatever failed.
    async fn run_e2e_batch(
        &self,
        suite: &TestSuite,
        child_env: &std::collections::HashMap<String, String>,
    ) -> Vec<TestResult> {
        let mut results = match playwright::run_batch(&self.config.playwright, suite, child_env)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!(suite = %suite.name, error = %e, "batched run failed");
                return self.all_failed(suite, &e.to_string());
            }
        };

        let retries = self.retries_for(suite);
        for result in &mut results {
            for _ in 0..retries {
                if result.is_success() {
                    break;
                }
                info!(file = %result.file.display(), "retrying failed e2e file");
                let single = TestSuite {
                    files: vec![result.file.clone()],
                    retries: 0,
                    ..suite.clone()
                };
                match playwright::run_batch(&self.config.playwright, &single, child_env).await {
                    Ok(mut rerun) if rerun.first().map(|r| r.is_success()).unwrap_or(false) => {
                        *result = rerun.remove(0);
                        break;
                    }
                    Ok(_) | Err(_) => {}
                }
            }
            self.events.emit(RunEvent::FileFinished {
                suite: suite.name.clone(),
                file: result.file.display().to_string(),
                passed: result.is_success(),
                duration_ms: result.duration_ms,
            });
        }
        results
    }

    async fn run_file_with_retry(
        &self,
        suite: &TestSuite,
        file: &Path,
        child_env: &std::collections::HashMap<String, String>,
    ) -> TestResult {
        let mut result = self.run_file_once(suite, file, child_env).await;

        // The inner calls carry no retry budget of their own, so a
        // flaky file can never trigger a retry storm.
        let retries = self.retries_for(suite);
        for _ in 0..retries {
            if result.is_success() {
                break;
            }
            info!(file = %file.display(), "retrying failed file");
            let attempt = self.run_file_once(suite, file, child_env).await;
            if attempt.is_success() {
                result = attempt;
                break;
            }
        }

        if let Some(validator) = &self.validator {
            if suite.kind == SuiteKind::Contract {
                result.violations = validator.take_violations();
                // Violations are non-fatal unless the contract is
                // strict; the strict failure is a synthetic test so
                // pass/fail counts keep adding up to the total
                if validator.strict() && !result.violations.is_empty() {
                    result.tests += 1;
                    result.failed += 1;
                    result.failures.push(TestFailure {
                        test: "contract".to_string(),
                        message: format!(
                            "{} contract violation(s)",
                            result.violations.len()
                        ),
                    });
                }
            }
        }

        self.events.emit(RunEvent::FileFinished {
            suite: suite.name.clone(),
            file: file.display().to_string(),
            passed: result.is_success(),
            duration_ms: result.duration_ms,
        });
        result
    }

    async fn run_file_once(
        &self,
        suite: &TestSuite,
        file: &Path,
        child_env: &std::collections::HashMap<String, String>,
    ) -> TestResult {
        match exec::run_file(
            &self.config.exec,
            &suite.name,
            file,
            child_env,
            suite.timeout_ms,
        )
        .await
        {
            Ok(result) => result,
            Err(e) => TestResult::from_error(&suite.name, file, e.to_string()),
        }
    }

    fn retries_for(&self, suite: &TestSuite) -> u32 {
        if suite.retries > 0 {
            suite.retries
        } else {
            self.config.retries
        }
    }

    /// Seed a fixture scenario into the environment's scratch dir and
    /// build the child environment map.
    fn seed_fixtures(
        &self,
        suite: &TestSuite,
        env: &TestEnvironment,
    ) -> Result<std::collections::HashMap<String, String>> {
        let mut child_env = env.child_env();

        let scratch = match env.scratch_path() {
            Some(path) => path.to_path_buf(),
            None => return Ok(child_env),
        };

        let mut manager = TestDataManager::new();
        manager.create_scenario(&self.config.fixture_scenario)?;
        let path = scratch.join(format!("fixtures-{}.json", suite.name));
        manager.write_bundle(&self.config.fixture_scenario, &path)?;
        child_env.insert("FIXTURES_PATH".to_string(), path.display().to_string());
        Ok(child_env)
    }

    fn all_failed(&self, suite: &TestSuite, message: &str) -> Vec<TestResult> {
        suite
            .files
            .iter()
            .map(|file| TestResult::from_error(&suite.name, file, message.to_string()))
            .collect()
    }

    fn note_failures(&self, suite: &str, failed: usize) {
        self.events.emit(RunEvent::SuiteFinished {
            suite: suite.to_string(),
            failed,
        });
        if failed > 0 && self.config.bail && !self.bailed.swap(true, Ordering::SeqCst) {
            warn!(suite, "bailing: no further work will be dequeued");
            self.events.emit(RunEvent::Bail {
                suite: suite.to_string(),
            });
        }
    }
}

/// Keep up to `k` jobs in flight, backfilling from the queue as each
/// completes; `stop` is consulted before every backfill. Results come
/// back sorted by the job's original index.
async fn rolling_window<R>(
    k: usize,
    mut queue: VecDeque<BoxFuture<'_, (usize, R)>>,
    stop: impl Fn() -> bool,
) -> Vec<(usize, R)> {
    let k = k.max(1);
    let mut in_flight = FuturesUnordered::new();
    let mut out = Vec::new();

    loop {
        while in_flight.len() < k && !stop() {
            match queue.pop_front() {
                Some(job) => in_flight.push(job),
                None => break,
            }
        }
        match in_flight.next().await {
            Some(done) => out.push(done),
            None => break,
        }
    }

    out.sort_by_key(|(index, _)| *index);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use lingotest_contract::{ContractDocument, ValidationMode};
    use lingotest_orchestrator::{EnvironmentConfig, PortPool, ServerConfig, TestEnvironment};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn never_used_server(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            command: "/bin/false".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            candidate_ports: Vec::new(),
            health_path: "/health".to_string(),
            ready_patterns: vec!["never".to_string()],
            startup_timeout_ms: 1_000,
            shutdown_timeout_ms: 1_000,
            health_poll_ms: 50,
            health_attempts: 1,
        }
    }

    fn runner_with_exec(exec: ExecConfig, retries: u32) -> TestRunner {
        let orchestrator = Arc::new(Orchestrator::new(
            EnvironmentConfig {
                backend: never_used_server("backend"),
                frontend: never_used_server("frontend"),
            },
            Arc::new(PortPool::new(45000, 45010)),
            PathBuf::from("/tmp"),
            EventBus::detached(),
        ));
        TestRunner::new(
            orchestrator,
            RunnerConfig {
                retries,
                exec,
                ..RunnerConfig::default()
            },
            EventBus::detached(),
        )
    }

    fn unit_suite(file: &str) -> TestSuite {
        TestSuite {
            name: "unit".to_string(),
            files: vec![PathBuf::from(file)],
            kind: SuiteKind::Unit,
            isolation: IsolationMode::Isolated,
            parallel: false,
            timeout_ms: 5_000,
            retries: 0,
        }
    }

    #[tokio::test]
    async fn test_retry_replaces_failure_with_success() {
        // Fails on the first invocation, passes once the marker exists
        let dir = tempfile::tempdir().unwrap();
        let script = concat!(
            r#"if [ -f "$MARKER" ]; then echo '{"tests":1,"passed":1,"failed":0}'; "#,
            r#"else touch "$MARKER"; "#,
            r#"echo '{"tests":1,"passed":0,"failed":1,"failures":[{"test":"t","message":"flaky"}]}'; fi"#,
        );
        let runner = runner_with_exec(
            ExecConfig {
                command: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                working_dir: None,
            },
            1,
        );

        let mut child_env = HashMap::new();
        child_env.insert(
            "MARKER".to_string(),
            dir.path().join("marker").display().to_string(),
        );

        let suite = unit_suite("flaky.spec.ts");
        let result = runner
            .run_file_with_retry(&suite, Path::new("flaky.spec.ts"), &child_env)
            .await;
        assert!(result.is_success());
        assert_eq!(result.passed, 1);
    }

    #[tokio::test]
    async fn test_persistent_failure_survives_retries() {
        let runner = runner_with_exec(
            ExecConfig {
                command: "/bin/sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    r#"echo '{"tests":1,"passed":0,"failed":1,"failures":[{"test":"t","message":"broken"}]}'"#
                        .to_string(),
                ],
                working_dir: None,
            },
            2,
        );

        let suite = unit_suite("broken.spec.ts");
        let result = runner
            .run_file_with_retry(&suite, Path::new("broken.spec.ts"), &HashMap::new())
            .await;
        assert!(!result.is_success());
        assert_eq!(result.failures[0].message, "broken");
    }

    fn passing_exec() -> ExecConfig {
        ExecConfig {
            command: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"echo '{"tests":1,"passed":1,"failed":0}'"#.to_string(),
            ],
            working_dir: None,
        }
    }

    fn contract_validator(mode: ValidationMode) -> Arc<ContractValidator> {
        let doc = ContractDocument::from_value(json!({
            "paths": { "/x": { "post": {
                "requestBody": { "content": { "application/json": { "schema": {
                    "type": "object",
                    "required": ["a"],
                    "properties": { "a": { "type": "string" } }
                }}}},
                "responses": {}
            }}}
        }))
        .unwrap();
        Arc::new(ContractValidator::from_document(&doc, mode).unwrap())
    }

    fn contract_suite(files: &[&str], parallel: bool) -> TestSuite {
        TestSuite {
            name: "contract".to_string(),
            files: files.iter().map(PathBuf::from).collect(),
            kind: SuiteKind::Contract,
            isolation: IsolationMode::Shared,
            parallel,
            timeout_ms: 5_000,
            retries: 0,
        }
    }

    #[tokio::test]
    async fn test_strict_violations_count_as_a_failed_test() {
        let validator = contract_validator(ValidationMode::Strict);
        // Missing required field, recorded in the shared log
        validator.validate_request(
            "POST",
            "/x",
            Some(&json!({})),
            &HashMap::new(),
            &HashMap::new(),
        );
        assert_eq!(validator.violation_count(), 1);

        let runner = runner_with_exec(passing_exec(), 0).with_validator(validator);
        let suite = contract_suite(&["api.spec.ts"], false);
        let result = runner
            .run_file_with_retry(&suite, Path::new("api.spec.ts"), &HashMap::new())
            .await;

        assert_eq!(result.violations.len(), 1);
        assert!(!result.is_success());
        // The strict failure shows up as one synthetic test so the
        // counts stay additive
        assert_eq!(result.tests, 2);
        assert_eq!(result.passed + result.failed + result.skipped, result.tests);
        assert!(result.failures.iter().any(|f| f.test == "contract"));
    }

    #[tokio::test]
    async fn test_contract_suite_drains_violations_per_file_in_order() {
        let validator = contract_validator(ValidationMode::Lenient);
        validator.validate_request(
            "POST",
            "/x",
            Some(&json!({})),
            &HashMap::new(),
            &HashMap::new(),
        );

        let runner = runner_with_exec(passing_exec(), 0).with_validator(validator);

        let dir = tempfile::tempdir().unwrap();
        let mut env = TestEnvironment::new(
            "contract",
            EnvironmentConfig {
                backend: never_used_server("backend"),
                frontend: never_used_server("frontend"),
            },
            Arc::new(PortPool::new(45100, 45110)),
            dir.path(),
            EventBus::detached(),
        )
        .unwrap();

        // Even with parallel requested, the suite runs serial, so the
        // pre-existing violation attaches to the first file only
        let suite = contract_suite(&["a.spec.ts", "b.spec.ts"], true);
        let results = runner.run_suite_in(&suite, &env).await;
        env.stop().await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].violations.len(), 1);
        assert!(results[1].violations.is_empty());
        // Lenient violations never fail the file
        assert!(results[0].is_success());
    }

    async fn job(
        index: usize,
        live: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    ) -> (usize, usize) {
        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        live.fetch_sub(1, Ordering::SeqCst);
        (index, index * 2)
    }

    #[tokio::test]
    async fn test_window_never_exceeds_k() {
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let queue: VecDeque<BoxFuture<(usize, usize)>> = (0..10)
            .map(|i| {
                let live = live.clone();
                let peak = peak.clone();
                let fut: BoxFuture<(usize, usize)> = Box::pin(job(i, live, peak));
                fut
            })
            .collect();

        let results = rolling_window(3, queue, || false).await;
        assert_eq!(results.len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_window_results_in_original_order() {
        let queue: VecDeque<BoxFuture<(usize, u64)>> = (0..6u64)
            .map(|i| {
                // Later jobs finish first
                let fut: BoxFuture<(usize, u64)> = Box::pin(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(60 - i * 10)).await;
                    (i as usize, i)
                });
                fut
            })
            .collect();

        let results = rolling_window(6, queue, || false).await;
        let order: Vec<usize> = results.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_stop_prevents_backfill_but_drains_in_flight() {
        let stopped = Arc::new(AtomicBool::new(false));
        let ran = Arc::new(AtomicUsize::new(0));

        let queue: VecDeque<BoxFuture<(usize, ())>> = (0..8)
            .map(|i| {
                let stopped = stopped.clone();
                let ran = ran.clone();
                let fut: BoxFuture<(usize, ())> = Box::pin(async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    if i == 0 {
                        stopped.store(true, Ordering::SeqCst);
                    }
                    (i, ())
                });
                fut
            })
            .collect();

        let stop = {
            let stopped = stopped.clone();
            move || stopped.load(Ordering::SeqCst)
        };
        let results = rolling_window(2, queue, stop).await;

        // The first window (2 jobs) ran; once job 0 flipped the flag
        // nothing new was dequeued.
        assert!(results.len() < 8);
        assert_eq!(ran.load(Ordering::SeqCst), results.len());
    }
}
