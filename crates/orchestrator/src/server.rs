//! Server lifecycle: spawn, readiness gating, health checks, teardown

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use lingotest_common::{log_tail, Error, EventBus, Result, RunEvent};

use crate::ports::PortPool;

const LOG_TAIL_LINES: usize = 20;

/// Signals that a spawned process has finished initializing
///
/// Log scraping is inherently text-protocol-dependent; this trait
/// isolates it so an alternative signal (a sentinel file, a dedicated
/// ready socket) can be substituted without touching the scheduler.
pub trait ReadinessSignal: Send + Sync {
    fn line_matches(&self, line: &str) -> bool;
}

/// Ordered list of regex patterns tested against every log line
#[derive(Debug)]
pub struct RegexReadiness {
    patterns: Vec<regex::Regex>,
}

impl RegexReadiness {
    pub fn compile(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                regex::Regex::new(p)
                    .map_err(|e| Error::InvalidConfig(format!("bad ready pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }
}

impl ReadinessSignal for RegexReadiness {
    fn line_matches(&self, line: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(line))
    }
}

/// Immutable description of a spawnable service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Name used in logs, events, and error diagnostics
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Merged over the orchestrator's own process environment, never
    /// replacing it (the child keeps PATH and friends)
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Preferred ports; empty means any port from the pool's range
    #[serde(default)]
    pub candidate_ports: Vec<u16>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Regexes tested against each log line on both streams
    pub ready_patterns: Vec<String>,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    #[serde(default = "default_health_poll")]
    pub health_poll_ms: u64,
    #[serde(default = "default_health_attempts")]
    pub health_attempts: u32,
}

fn default_health_path() -> String {
    "/health".to_string()
}
fn default_startup_timeout() -> u64 {
    30_000
}
fn default_shutdown_timeout() -> u64 {
    10_000
}
fn default_health_poll() -> u64 {
    200
}
fn default_health_attempts() -> u32 {
    50
}

/// Runtime record bound 1:1 to a ServerConfig
pub struct ServerInstance {
    config: ServerConfig,
    pool: Arc<PortPool>,
    probe: Arc<dyn ReadinessSignal>,
    child: Option<Child>,
    port: Option<u16>,
    url: Option<String>,
    ready: bool,
    pid: Option<u32>,
    started_at: Option<Instant>,
    logs: Arc<Mutex<Vec<String>>>,
}

impl ServerInstance {
    pub fn new(config: ServerConfig, pool: Arc<PortPool>) -> Result<Self> {
        let probe = Arc::new(RegexReadiness::compile(&config.ready_patterns)?);
        Ok(Self::with_probe(config, pool, probe))
    }

    pub fn with_probe(
        config: ServerConfig,
        pool: Arc<PortPool>,
        probe: Arc<dyn ReadinessSignal>,
    ) -> Self {
        Self {
            config,
            pool,
            probe,
            child: None,
            port: None,
            url: None,
            ready: false,
            pid: None,
            started_at: None,
            logs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Resolved base URL; defined only once ready
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn log_tail(&self) -> String {
        log_tail(&self.logs.lock(), LOG_TAIL_LINES)
    }

    /// Spawn the process and wait for a ready-pattern match
    ///
    /// `extra_env` carries the environment-synthesized variables; the
    /// config's own overrides win over it, and both layer on top of
    /// the inherited process environment. `PORT` is always set to the
    /// assigned port.
    pub async fn start(
        &mut self,
        extra_env: &HashMap<String, String>,
        log_file: &Path,
        events: &EventBus,
    ) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }

        let port = if self.config.candidate_ports.is_empty() {
            self.pool.acquire().await?
        } else {
            self.pool.acquire_one_of(&self.config.candidate_ports).await?
        };
        self.port = Some(port);

        info!(server = %self.config.name, port, "spawning");

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(extra_env)
            .envs(&self.config.env)
            .env("PORT", port.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| {
            self.pool.release(port);
            self.port = None;
            Error::Spawn {
                command: self.config.command.clone(),
                source,
            }
        })?;

        self.pid = child.id();
        self.started_at = Some(Instant::now());

        let sink = Arc::new(tokio::sync::Mutex::new(
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)
                .await?,
        ));

        // Some runtimes log their ready banner to stderr, so both
        // streams feed the readiness probe.
        let (ready_tx, mut ready_rx) = mpsc::channel::<()>(1);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(
                stdout,
                self.logs.clone(),
                sink.clone(),
                self.probe.clone(),
                ready_tx.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(
                stderr,
                self.logs.clone(),
                sink,
                self.probe.clone(),
                ready_tx,
            ));
        }

        let startup = Duration::from_millis(self.config.startup_timeout_ms);
        tokio::select! {
            _ = ready_rx.recv() => {}
            status = child.wait() => {
                // Give the pump tasks a moment to drain the last lines
                sleep(Duration::from_millis(100)).await;
                self.cleanup_port();
                return Err(Error::ExitedEarly {
                    name: self.config.name.clone(),
                    code: status.ok().and_then(|s| s.code()),
                    log_tail: self.log_tail(),
                });
            }
            _ = sleep(startup) => {
                let _ = child.start_kill();
                let _ = timeout(Duration::from_secs(2), child.wait()).await;
                self.cleanup_port();
                return Err(Error::StartupTimeout {
                    name: self.config.name.clone(),
                    timeout_ms: self.config.startup_timeout_ms,
                    log_tail: self.log_tail(),
                });
            }
        }

        self.child = Some(child);
        self.ready = true;
        let url = format!("http://127.0.0.1:{port}");
        self.url = Some(url.clone());
        events.emit(RunEvent::ServerReady {
            name: self.config.name.clone(),
            url,
        });
        info!(server = %self.config.name, port, "ready pattern matched");
        Ok(())
    }

    /// Poll the health path until a 2xx arrives
    ///
    /// A log line announcing readiness does not guarantee the listener
    /// socket accepts connections yet, hence this second gate.
    pub async fn wait_for_health(&self) -> Result<()> {
        let url = match &self.url {
            Some(base) => format!("{base}{}", self.config.health_path),
            None => {
                return Err(Error::HealthTimeout {
                    name: self.config.name.clone(),
                    attempts: 0,
                })
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        for attempt in 1..=self.config.health_attempts {
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(server = %self.config.name, attempt, "healthy");
                    return Ok(());
                }
                Ok(resp) => {
                    debug!(server = %self.config.name, status = %resp.status(), "not healthy yet");
                }
                Err(e) if e.is_connect() => {}
                Err(e) => warn!(server = %self.config.name, error = %e, "health probe error"),
            }
            sleep(Duration::from_millis(self.config.health_poll_ms)).await;
        }

        Err(Error::HealthTimeout {
            name: self.config.name.clone(),
            attempts: self.config.health_attempts,
        })
    }

    /// Graceful-then-forced shutdown
    ///
    /// Never errors and never leaks a port: whichever of exit, force
    /// timer, or absolute timeout fires, the single cleanup path runs.
    pub async fn stop(&mut self) {
        self.ready = false;
        self.url = None;

        let Some(mut child) = self.child.take() else {
            self.cleanup_port();
            return;
        };

        let name = self.config.name.clone();
        info!(server = %name, pid = ?self.pid, "stopping");

        let grace = Duration::from_millis(self.config.shutdown_timeout_ms / 2);
        let absolute = Duration::from_millis(self.config.shutdown_timeout_ms);

        if send_term(&child) {
            if timeout(grace, child.wait()).await.is_ok() {
                debug!(server = %name, "exited gracefully");
                self.cleanup_port();
                return;
            }
            warn!(server = %name, "graceful shutdown expired, forcing");
        }

        let _ = child.start_kill();
        if timeout(absolute.saturating_sub(grace), child.wait())
            .await
            .is_err()
        {
            warn!(server = %name, "process did not reap within shutdown timeout");
        }
        self.cleanup_port();
    }

    fn cleanup_port(&mut self) {
        if let Some(port) = self.port.take() {
            self.pool.release(port);
        }
        self.pid = None;
    }
}

#[cfg(unix)]
fn send_term(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok(),
        None => false,
    }
}

#[cfg(not(unix))]
fn send_term(_child: &Child) -> bool {
    false
}

async fn pump_lines<R>(
    stream: R,
    logs: Arc<Mutex<Vec<String>>>,
    sink: Arc<tokio::sync::Mutex<tokio::fs::File>>,
    probe: Arc<dyn ReadinessSignal>,
    ready_tx: mpsc::Sender<()>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        {
            let mut file = sink.lock().await;
            let _ = file.write_all(line.as_bytes()).await;
            let _ = file.write_all(b"\n").await;
        }
        if probe.line_matches(&line) {
            let _ = ready_tx.try_send(());
        }
        logs.lock().push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            command: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo 'listening on port'; sleep 30".to_string(),
            ],
            working_dir: None,
            env: HashMap::new(),
            candidate_ports: Vec::new(),
            health_path: "/health".to_string(),
            ready_patterns: vec!["listening on".to_string()],
            startup_timeout_ms: 5_000,
            shutdown_timeout_ms: 2_000,
            health_poll_ms: 50,
            health_attempts: 3,
        }
    }

    #[test]
    fn test_regex_readiness_matches_any_pattern() {
        let probe =
            RegexReadiness::compile(&["ready".to_string(), r"listening on \d+".to_string()])
                .unwrap();
        assert!(probe.line_matches("server ready"));
        assert!(probe.line_matches("listening on 8080"));
        assert!(!probe.line_matches("starting up"));
    }

    #[test]
    fn test_bad_pattern_is_config_error() {
        let err = RegexReadiness::compile(&["(".to_string()]).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_url_undefined_before_ready() {
        let pool = Arc::new(PortPool::new(43100, 43110));
        let server = ServerInstance::new(config("backend"), pool).unwrap();
        assert!(!server.ready());
        assert!(server.url().is_none());
    }

    #[tokio::test]
    async fn test_start_sets_ready_and_url() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("backend.log");
        let pool = Arc::new(PortPool::new(43200, 43220));
        let mut server = ServerInstance::new(config("backend"), pool.clone()).unwrap();

        server
            .start(&HashMap::new(), &log, &EventBus::detached())
            .await
            .unwrap();
        assert!(server.ready());
        let url = server.url().unwrap().to_string();
        assert!(url.starts_with("http://127.0.0.1:"));
        assert_eq!(pool.in_use(), 1);

        server.stop().await;
        assert!(!server.ready());
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_ready_pattern_on_stderr_counts() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");
        let pool = Arc::new(PortPool::new(43230, 43240));

        let mut cfg = config("stderr-banner");
        cfg.args = vec![
            "-c".to_string(),
            "echo 'listening on port' 1>&2; sleep 30".to_string(),
        ];
        let mut server = ServerInstance::new(cfg, pool).unwrap();
        server
            .start(&HashMap::new(), &log, &EventBus::detached())
            .await
            .unwrap();
        assert!(server.ready());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_early_exit_fails_with_log_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");
        let pool = Arc::new(PortPool::new(43250, 43260));

        let mut cfg = config("crashy");
        cfg.args = vec!["-c".to_string(), "echo 'boom'; exit 3".to_string()];
        let mut server = ServerInstance::new(cfg, pool.clone()).unwrap();

        let err = server
            .start(&HashMap::new(), &log, &EventBus::detached())
            .await
            .unwrap_err();
        match err {
            Error::ExitedEarly { code, log_tail, .. } => {
                assert_eq!(code, Some(3));
                assert!(log_tail.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_startup_timeout_kills_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");
        let pool = Arc::new(PortPool::new(43270, 43280));

        let mut cfg = config("silent");
        cfg.args = vec!["-c".to_string(), "sleep 30".to_string()];
        cfg.startup_timeout_ms = 300;
        let mut server = ServerInstance::new(cfg, pool.clone()).unwrap();

        let err = server
            .start(&HashMap::new(), &log, &EventBus::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StartupTimeout { .. }));
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_even_unstarted() {
        let pool = Arc::new(PortPool::new(43290, 43295));
        let mut server = ServerInstance::new(config("never-started"), pool.clone()).unwrap();
        server.stop().await;
        server.stop().await;
        assert!(!server.ready());
        assert_eq!(pool.in_use(), 0);
    }
}
