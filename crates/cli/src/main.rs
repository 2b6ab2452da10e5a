//! LingoTest CLI - Main Entry Point
//!
//! Sequences a full harness run: provision environments, execute the
//! declared suites, tear down, report. The `ci` subcommand wraps each
//! phase in a wall-clock timeout so a wedged phase fails without
//! taking the whole pipeline down with it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lingotest_common::{EventBus, RunEvent, RunSummary, SuiteKind, TestSuite};
use lingotest_contract::{ContractDocument, ContractValidator, ValidationMode};
use lingotest_orchestrator::{EnvironmentConfig, Orchestrator, PortPool, ServerConfig};
use lingotest_runner::{report, RunnerConfig, TestRunner};

/// LingoReel test harness
#[derive(Parser)]
#[command(name = "lingotest")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every declared suite once
    Run(RunArgs),

    /// CI mode: same phases, each under a wall-clock timeout
    Ci(CiArgs),
}

#[derive(Parser)]
struct RunArgs {
    /// Harness config describing the backend/frontend process pair
    #[arg(short, long, default_value = "lingotest.yaml")]
    config: PathBuf,

    /// Directory of suite declarations
    #[arg(short, long, default_value = "suites")]
    suites: PathBuf,

    /// Upper bound on concurrently live isolated environments
    #[arg(long)]
    max_workers: Option<usize>,

    /// Stop dequeuing new work on the first failure
    #[arg(long)]
    bail: bool,

    /// Run-level retry count for failing files
    #[arg(long, default_value = "0")]
    retries: u32,

    /// Fixture scenario seeded into every environment
    #[arg(long, default_value = "basic")]
    scenario: String,

    /// API contract document to validate against
    #[arg(long)]
    contract: Option<PathBuf>,

    /// Treat any contract violation as a hard failure
    #[arg(long)]
    strict_contract: bool,

    /// Inclusive port range for the pool, as start:end
    #[arg(long, default_value = "4300:4399")]
    port_range: String,

    /// Output directory for results and the HTML report
    #[arg(short, long, default_value = "test-results")]
    output: PathBuf,
}

#[derive(Parser)]
struct CiArgs {
    #[command(flatten)]
    run: RunArgs,

    /// Wall-clock budget per phase, in seconds
    #[arg(long, default_value = "600")]
    phase_timeout_secs: u64,
}

/// Process-pair description loaded from the harness config file
#[derive(Debug, Deserialize)]
struct HarnessConfig {
    backend: ServerConfig,
    frontend: ServerConfig,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to create runtime: {e}");
            std::process::exit(2);
        }
    };

    let result = rt.block_on(async {
        match cli.command {
            Commands::Run(args) => run(args, None).await,
            Commands::Ci(args) => run_ci(args).await,
        }
    });

    match result {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(2);
        }
    }
}

fn parse_port_range(raw: &str) -> Result<(u16, u16)> {
    let (start, end) = raw
        .split_once(':')
        .context("port range must be start:end")?;
    let start: u16 = start.parse().context("bad range start")?;
    let end: u16 = end.parse().context("bad range end")?;
    anyhow::ensure!(start <= end, "port range start exceeds end");
    Ok((start, end))
}

/// Build the collaborators, run the suites, write the reports.
///
/// `phase_timeout` switches on CI mode: suites are grouped into
/// phases by kind and each phase gets its own budget.
async fn run(args: RunArgs, phase_timeout: Option<Duration>) -> Result<bool> {
    let config: HarnessConfig = serde_yaml::from_str(
        &std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?,
    )
    .context("parsing harness config")?;

    let suites = TestSuite::load_all(&args.suites)
        .with_context(|| format!("loading suites from {}", args.suites.display()))?;
    anyhow::ensure!(!suites.is_empty(), "no suite declarations found");

    let (start, end) = parse_port_range(&args.port_range)?;
    let (events, mut event_rx) = EventBus::channel();

    // Progress consumer for this run
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                RunEvent::ServerReady { name, url } => info!("{name} ready at {url}"),
                RunEvent::FileFinished {
                    file,
                    passed,
                    duration_ms,
                    ..
                } => {
                    let mark = if passed { "✓" } else { "✗" };
                    info!("{mark} {file} ({duration_ms} ms)");
                }
                RunEvent::SuiteFinished { suite, failed } if failed > 0 => {
                    warn!("suite {suite}: {failed} file(s) failed")
                }
                RunEvent::ContractViolation(v) => {
                    warn!("contract violation on {}: {}", v.endpoint, v.message)
                }
                RunEvent::Bail { suite } => warn!("bailed after suite {suite}"),
                _ => {}
            }
        }
    });

    let orchestrator = Arc::new(Orchestrator::new(
        EnvironmentConfig {
            backend: config.backend,
            frontend: config.frontend,
        },
        Arc::new(PortPool::new(start, end)),
        args.output.join("logs"),
        events.clone(),
    ));

    let mut runner_config = RunnerConfig {
        bail: args.bail,
        retries: args.retries,
        fixture_scenario: args.scenario.clone(),
        output_dir: args.output.clone(),
        ..RunnerConfig::default()
    };
    if let Some(max_workers) = args.max_workers {
        runner_config.max_workers = max_workers;
    }

    let mut runner = TestRunner::new(orchestrator, runner_config, events);
    if let Some(contract_path) = &args.contract {
        let document = ContractDocument::from_file(contract_path)?;
        let mode = if args.strict_contract {
            ValidationMode::Strict
        } else {
            ValidationMode::Lenient
        };
        runner = runner.with_validator(Arc::new(ContractValidator::from_document(
            &document, mode,
        )?));
    }

    let summary = match phase_timeout {
        None => runner.run(&suites).await,
        Some(budget) => run_phased(&runner, suites, budget).await,
    };

    report::write_json(&summary, &args.output)?;
    report::write_html(&summary, &args.output)?;

    info!(
        "{} tests: {} passed, {} failed, {} skipped across {} suite(s) ({} ms)",
        summary.total,
        summary.passed,
        summary.failed,
        summary.skipped,
        summary.suites,
        summary.duration_ms
    );

    drop(runner);
    printer.abort();
    Ok(summary.is_success())
}

async fn run_ci(args: CiArgs) -> Result<bool> {
    let budget = Duration::from_secs(args.phase_timeout_secs);
    run(args.run, Some(budget)).await
}

/// CI phases in fixed order: unit, then integration and contract,
/// then end-to-end. An exceeded phase fails without aborting the rest.
async fn run_phased(runner: &TestRunner, suites: Vec<TestSuite>, budget: Duration) -> RunSummary {
    let phases: [(&str, Vec<SuiteKind>); 3] = [
        ("unit", vec![SuiteKind::Unit]),
        ("integration", vec![SuiteKind::Integration, SuiteKind::Contract]),
        ("end-to-end", vec![SuiteKind::EndToEnd]),
    ];

    let mut results = Vec::new();
    let mut duration_ms = 0;

    for (phase, kinds) in phases {
        let phase_suites: Vec<TestSuite> = suites
            .iter()
            .filter(|s| kinds.contains(&s.kind))
            .cloned()
            .collect();
        if phase_suites.is_empty() {
            continue;
        }

        info!(phase, suites = phase_suites.len(), "starting phase");
        match tokio::time::timeout(budget, runner.run(&phase_suites)).await {
            Ok(summary) => {
                duration_ms += summary.duration_ms;
                results.extend(summary.results);
            }
            Err(_elapsed) => {
                error!(phase, "phase exceeded its wall-clock budget");
                duration_ms += budget.as_millis() as u64;
                for suite in &phase_suites {
                    for file in &suite.files {
                        results.push(lingotest_common::TestResult::from_error(
                            &suite.name,
                            file,
                            format!("{phase} phase exceeded {}s budget", budget.as_secs()),
                        ));
                    }
                }
            }
        }
    }

    RunSummary::from_results(results, duration_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("4300:4399").unwrap(), (4300, 4399));
        assert!(parse_port_range("4300").is_err());
        assert!(parse_port_range("4399:4300").is_err());
    }

    #[test]
    fn test_harness_config_parses() {
        let yaml = r#"
backend:
  name: backend
  command: node
  args: [server/dist/index.js]
  ready_patterns: ["listening on port \\d+"]
frontend:
  name: frontend
  command: npx
  args: [vite, preview]
  ready_patterns: ["Local:"]
  health_path: /
"#;
        let config: HarnessConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.backend.name, "backend");
        assert_eq!(config.frontend.health_path, "/");
        assert_eq!(config.backend.startup_timeout_ms, 30_000);
    }
}
