//! LingoTest Orchestrator
//!
//! Provisions isolated backend/frontend process pairs: port
//! allocation from a shared pool, spawn with ready-pattern gating,
//! health-check verification, and graceful-then-forced teardown.

pub mod environment;
pub mod ports;
pub mod server;

pub use environment::{EnvironmentConfig, Orchestrator, TestEnvironment};
pub use ports::PortPool;
pub use server::{ReadinessSignal, RegexReadiness, ServerConfig, ServerInstance};
