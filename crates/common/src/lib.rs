//! LingoTest Common Library
//!
//! Shared types for the LingoReel test harness: the error taxonomy,
//! suite/result records, and the per-run event channel.

pub mod error;
pub mod events;
pub mod suite;

// Re-export commonly used types
pub use error::{Error, Result};
pub use events::{EventBus, RunEvent};
pub use suite::{
    ContractViolation, Direction, IsolationMode, RunSummary, SuiteKind, TestFailure, TestResult,
    TestSuite,
};

/// Harness version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Keep the last `n` lines of captured output for diagnostics
pub fn log_tail(lines: &[String], n: usize) -> String {
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
