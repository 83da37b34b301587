//! Orchestration loop
//!
//! Repeatedly feeds the prompt file to the agent, one turn per iteration,
//! until the completion marker appears in the output, the failure streak
//! hits its limit, or the iteration cap is reached.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::{info, warn};

use crate::acp::adapter::AcpAdapter;
use crate::config::LoopConfig;
use crate::log::{JsonlLogger, TurnRecord};

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The completion marker appeared in turn output.
    Completed {
        /// Iterations executed, including the completing one.
        iterations: u32,
    },
    /// Too many consecutive failed turns.
    FailureLimit {
        /// Iterations executed.
        iterations: u32,
    },
    /// The iteration cap was reached without completion.
    IterationCap,
    /// A stop was requested between iterations.
    Interrupted {
        /// Iterations executed before the stop.
        iterations: u32,
    },
}

/// Drive the loop to one of its stop conditions.
///
/// The prompt file is re-read every iteration so edits made while the loop
/// runs take effect on the next turn. Each turn is appended to the JSONL
/// log whether it succeeded or not. The `stop` flag is checked between
/// iterations only; an in-flight turn is never abandoned here.
pub async fn run(
    adapter: &AcpAdapter,
    config: &LoopConfig,
    logger: &JsonlLogger,
    stop: &AtomicBool,
) -> Result<RunOutcome> {
    let mut consecutive_failures = 0u32;

    for iteration in 1..=config.max_iterations {
        if stop.load(Ordering::SeqCst) {
            info!("Stop requested; ending loop before iteration {iteration}");
            return Ok(RunOutcome::Interrupted {
                iterations: iteration - 1,
            });
        }

        let prompt = read_prompt(&config.prompt_file)?;
        println!(
            "{} iteration {iteration}/{}",
            "▶".blue().bold(),
            config.max_iterations
        );

        let started = Instant::now();
        let result = adapter.run_turn(&prompt).await;
        let duration_secs = started.elapsed().as_secs();

        logger
            .append(&TurnRecord::from_result(&result, iteration, duration_secs))
            .context("Failed to write to JSONL log")?;

        if result.success {
            consecutive_failures = 0;
            println!(
                "{} turn completed ({} tool calls, {duration_secs}s)",
                "✓".green(),
                result.metadata.tool_call_count
            );
        } else {
            consecutive_failures += 1;
            let detail = result.error.as_deref().unwrap_or("unknown error");
            warn!("Turn {iteration} failed: {detail}");
            println!("{} turn failed: {detail}", "✗".red());
        }

        if result.output.contains(&config.completion_marker) {
            println!("{} completion marker found", "●".green().bold());
            return Ok(RunOutcome::Completed {
                iterations: iteration,
            });
        }

        if consecutive_failures >= config.max_consecutive_failures {
            warn!(
                "Stopping after {consecutive_failures} consecutive failures \
                 (limit {})",
                config.max_consecutive_failures
            );
            return Ok(RunOutcome::FailureLimit {
                iterations: iteration,
            });
        }
    }

    Ok(RunOutcome::IterationCap)
}

fn read_prompt(path: &str) -> Result<String> {
    let prompt = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("Failed to read prompt file: {path}"))?;
    if prompt.trim().is_empty() {
        anyhow::bail!("Prompt file is empty: {path}");
    }
    Ok(prompt)
}
