//! JSONL (JSON Lines) logging for turn execution history
//!
//! Provides append-only logging of turn records to `.relay/log.jsonl`

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};

use crate::acp::models::TurnResult;

/// Record of a single prompt turn, as persisted to the log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnRecord {
    /// The iteration number (1-indexed)
    pub iteration: u32,
    /// ISO 8601 timestamp of when the turn completed
    pub timestamp: DateTime<Utc>,
    /// Whether the turn succeeded
    pub success: bool,
    /// Agent-side session id
    pub session_id: String,
    /// Stop reason reported by the agent, if any
    pub stop_reason: Option<String>,
    /// Number of tool calls observed during the turn
    pub tool_call_count: usize,
    /// Error detail for failed turns
    pub error: Option<String>,
    /// Length of the accumulated output in bytes
    pub output_len: usize,
    /// Duration of the turn in seconds
    pub duration_secs: u64,
}

impl TurnRecord {
    /// Build a record from a turn result.
    #[must_use]
    pub fn from_result(result: &TurnResult, iteration: u32, duration_secs: u64) -> Self {
        Self {
            iteration,
            timestamp: Utc::now(),
            success: result.success,
            session_id: result.metadata.session_id.clone(),
            stop_reason: result
                .metadata
                .stop_reason
                .as_ref()
                .map(|r| r.as_str().to_string()),
            tool_call_count: result.metadata.tool_call_count,
            error: result.error.clone(),
            output_len: result.output.len(),
            duration_secs,
        }
    }
}

/// JSONL logger for turn execution history
///
/// Provides append-only logging to `.relay/log.jsonl`.
/// Each line is a JSON object representing a single turn.
pub struct JsonlLogger {
    log_path: PathBuf,
}

impl JsonlLogger {
    /// Create a new JSONL logger rooted at `log_dir` (typically `.relay`).
    ///
    /// # Errors
    /// Returns an error if the log directory cannot be created
    pub fn new<P: AsRef<Path>>(log_dir: P) -> Result<Self> {
        let log_dir = log_dir.as_ref();
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
        Ok(Self {
            log_path: log_dir.join("log.jsonl"),
        })
    }

    /// Append a turn record to the log
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or written
    pub fn append(&self, record: &TurnRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("Failed to open log file: {}", self.log_path.display()))?;

        let json =
            serde_json::to_string(record).context("Failed to serialize turn record to JSON")?;
        writeln!(file, "{json}").context("Failed to write to log file")?;
        Ok(())
    }

    /// Read all turn records from the log, in chronological order
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or a line fails to parse
    pub fn read_all(&self) -> Result<Vec<TurnRecord>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.log_path)
            .with_context(|| format!("Failed to read log file: {}", self.log_path.display()))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .with_context(|| format!("Failed to parse log line: {line}"))
            })
            .collect()
    }
}
