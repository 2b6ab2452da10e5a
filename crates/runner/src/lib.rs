//! LingoTest Runner
//!
//! The top-level scheduler: partitions declared suites by isolation
//! requirement, obtains environments from the orchestrator, seeds
//! fixtures, executes test files (batched through Playwright for
//! parallel end-to-end suites), applies retry and bail policies, and
//! aggregates everything into a summary and report.

pub mod exec;
pub mod playwright;
pub mod report;
pub mod scheduler;

pub use exec::ExecConfig;
pub use playwright::PlaywrightConfig;
pub use scheduler::{RunnerConfig, TestRunner};
