//! Relay - Orchestration loop for ACP-compliant coding agents
//!
//! CLI entry point for the Relay orchestrator.

// Allow multiple crate versions from dependencies (can't easily control)
#![allow(clippy::multiple_crate_versions)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use relay::acp::adapter::AcpAdapter;
use relay::config::RelayConfig;
use relay::log::JsonlLogger;
use relay::orchestrator::{self, RunOutcome};

/// How long a graceful Ctrl-C shutdown may take before the agent is killed.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Orchestration loop for ACP-compliant coding agents
///
/// Spawns an agent subprocess, speaks JSON-RPC 2.0 over its stdio, and
/// loops prompt turns until the task completes.
#[derive(Parser, Debug)]
#[command(name = "relay", version, about)]
struct Cli {
    /// Path to the relay.toml configuration file
    #[arg(long, default_value = "relay.toml")]
    config: PathBuf,

    /// Override the prompt file from the configuration
    #[arg(long)]
    prompt_file: Option<String>,

    /// Override the iteration cap from the configuration
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Directory for log files (.relay by default)
    #[arg(long, default_value = ".relay")]
    log_dir: PathBuf,
}

/// Arm Ctrl-C handling: the first signal requests a graceful stop between
/// iterations; if shutdown takes too long (or a second signal arrives) the
/// agent is killed outright.
fn arm_signal_handler(adapter: &Arc<AcpAdapter>, stop: &Arc<AtomicBool>) {
    let adapter = Arc::clone(adapter);
    let stop = Arc::clone(stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("Interrupt received; finishing the current turn before stopping.");
        stop.store(true, Ordering::SeqCst);

        let deadline = tokio::time::sleep(SHUTDOWN_DEADLINE);
        tokio::select! {
            () = deadline => {
                eprintln!("Shutdown deadline passed; killing the agent.");
                adapter.kill_now();
            }
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    eprintln!("Second interrupt; killing the agent.");
                    adapter.kill_now();
                }
            }
        }
    });
}

fn report(outcome: RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Completed { iterations } => {
            println!("{} task completed in {iterations} iteration(s)", "●".green().bold());
            0
        }
        RunOutcome::FailureLimit { iterations } => {
            eprintln!("Stopping: too many consecutive failed turns ({iterations} iterations run).");
            1
        }
        RunOutcome::IterationCap => {
            eprintln!("Stopping: iteration cap reached without completion marker.");
            1
        }
        RunOutcome::Interrupted { iterations } => {
            eprintln!("Interrupted after {iterations} iteration(s).");
            130
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Load configuration, applying CLI overrides
    let mut config = RelayConfig::from_path(&cli.config)
        .with_context(|| format!("Failed to load config from '{}'", cli.config.display()))?;
    if let Some(prompt_file) = cli.prompt_file {
        config.run.prompt_file = prompt_file;
    }
    if let Some(max_iterations) = cli.max_iterations {
        config.run.max_iterations = max_iterations;
    }

    // Initialize
    let adapter = Arc::new(
        AcpAdapter::new(config.adapter_config()).context("Failed to set up the agent adapter")?,
    );
    let logger = JsonlLogger::new(&cli.log_dir).context("Failed to initialize JSONL logger")?;
    let stop = Arc::new(AtomicBool::new(false));
    arm_signal_handler(&adapter, &stop);

    // Run the loop, then always stop the agent gracefully
    let outcome = orchestrator::run(&adapter, &config.run, &logger, &stop).await;
    adapter.shutdown().await;

    let stats = adapter.permission_stats();
    if stats.approved + stats.denied > 0 {
        eprintln!(
            "Permissions: {} approved, {} denied.",
            stats.approved, stats.denied
        );
    }

    let code = report(outcome?);
    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}
