//! Error types for the LingoReel test harness

use thiserror::Error;

/// Result type alias using harness Error
pub type Result<T> = std::result::Result<T, Error>;

/// Harness error types
///
/// Provisioning and execution variants carry enough context (command,
/// captured log tail) to diagnose a failed run from the summary alone.
#[derive(Error, Debug)]
pub enum Error {
    // Provisioning
    #[error("no free port in {start}..={end} after {attempts} scan attempts")]
    PortExhausted { start: u16, end: u16, attempts: usize },

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server '{name}' not ready after {timeout_ms}ms\n--- last log lines ---\n{log_tail}")]
    StartupTimeout {
        name: String,
        timeout_ms: u64,
        log_tail: String,
    },

    #[error("server '{name}' exited with {code:?} before becoming ready\n--- last log lines ---\n{log_tail}")]
    ExitedEarly {
        name: String,
        code: Option<i32>,
        log_tail: String,
    },

    #[error("server '{name}' failed health check after {attempts} attempts")]
    HealthTimeout { name: String, attempts: u32 },

    // Execution
    #[error("test command for {file} exited with {code:?}")]
    CommandFailed { file: String, code: Option<i32> },

    #[error("test command for {file} timed out after {timeout_ms}ms")]
    ExecutionTimeout { file: String, timeout_ms: u64 },

    #[error("unparseable reporter output: {0}")]
    ReporterParse(String),

    // Contract
    #[error("invalid contract document: {0}")]
    ContractDocument(String),

    #[error("{count} contract violation(s) on {endpoint}")]
    StrictViolation { endpoint: String, count: usize },

    #[error("no contract entry matches {method} {path}")]
    UnmatchedEndpoint { method: String, path: String },

    // Fixtures
    #[error("unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("fixture store has {count} dangling reference(s)")]
    Consistency { count: usize },

    // Config / plumbing
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether this error should become a failed TestResult rather
    /// than abort the run.
    pub fn is_recordable(&self) -> bool {
        !matches!(self, Error::InvalidConfig(_) | Error::ContractDocument(_))
    }
}
