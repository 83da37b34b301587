//! Terminal capability handlers
//!
//! Lets the agent run commands on the host: `terminal/create` spawns a
//! process and returns an opaque id, then `terminal/output`,
//! `terminal/wait_for_exit`, `terminal/kill`, and `terminal/release`
//! operate on it. Output is captured into a bounded buffer by background
//! reader tasks so a chatty process never blocks anyone.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::{codes, RpcError};

/// Captured output is capped at 1 MiB; anything beyond is dropped and the
/// buffer flagged truncated.
const OUTPUT_CAP: usize = 1024 * 1024;

/// Grace between SIGTERM and SIGKILL when killing a terminal.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Default)]
struct OutputBuf {
    data: String,
    truncated: bool,
}

struct TerminalEntry {
    output: Arc<StdMutex<OutputBuf>>,
    exit: watch::Receiver<Option<i32>>,
    pid: i32,
}

/// Registry of agent-spawned terminals, keyed by opaque uuid.
#[derive(Default)]
pub struct TerminalManager {
    terminals: StdMutex<HashMap<String, TerminalEntry>>,
}

impl TerminalManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_pid_and_exit(
        &self,
        id: &str,
    ) -> Result<(i32, watch::Receiver<Option<i32>>), RpcError> {
        let terminals = lock(&self.terminals);
        terminals
            .get(id)
            .map(|e| (e.pid, e.exit.clone()))
            .ok_or_else(|| not_found(id))
    }

    /// Handle `terminal/create`: spawn the command and return its id.
    ///
    /// `command` is an array: the program followed by its arguments.
    pub fn create(&self, params: &Value) -> Result<Value, RpcError> {
        let argv = match params.get("command") {
            None => {
                return Err(RpcError::invalid_params(
                    "Missing required parameter 'command'",
                ))
            }
            Some(Value::Array(items)) => {
                let mut argv = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(s) => argv.push(s),
                        None => {
                            return Err(RpcError::new(
                                codes::WRONG_TYPE,
                                "command elements must be strings",
                            ))
                        }
                    }
                }
                argv
            }
            Some(_) => {
                return Err(RpcError::new(codes::WRONG_TYPE, "command must be a list"))
            }
        };
        let Some((command, args)) = argv.split_first() else {
            return Err(RpcError::invalid_params("command must not be empty"));
        };

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = params.get("cwd").and_then(Value::as_str) {
            cmd.current_dir(cwd);
        }
        if let Some(env) = params.get("env").and_then(Value::as_array) {
            for pair in env {
                if let (Some(name), Some(value)) = (
                    pair.get("name").and_then(Value::as_str),
                    pair.get("value").and_then(Value::as_str),
                ) {
                    cmd.env(name, value);
                }
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RpcError::new(codes::NOT_FOUND, format!("Command not found: {command}"))
            } else {
                RpcError::new(
                    codes::INTERNAL_ERROR,
                    format!("Failed to spawn '{command}': {e}"),
                )
            }
        })?;

        let id = Uuid::new_v4().to_string();
        let pid = child.id().and_then(|p| i32::try_from(p).ok()).unwrap_or(0);
        debug!("Terminal {id} spawned '{command}' (pid {pid})");

        let output = Arc::new(StdMutex::new(OutputBuf::default()));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, Arc::clone(&output)));
        }

        // The waiter owns the child; a process killed by signal reports -1.
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!("Failed waiting on terminal child: {e}");
                    -1
                }
            };
            let _ = exit_tx.send(Some(code));
        });

        lock(&self.terminals).insert(
            id.clone(),
            TerminalEntry {
                output,
                exit: exit_rx,
                pid,
            },
        );
        Ok(json!({"terminalId": id}))
    }

    /// Handle `terminal/output`: current captured output plus exit status
    /// if the process has finished.
    pub fn output(&self, params: &Value) -> Result<Value, RpcError> {
        let id = require_id(params)?;
        let terminals = lock(&self.terminals);
        let entry = terminals.get(id).ok_or_else(|| not_found(id))?;
        let (data, truncated) = {
            let buf = lock_buf(&entry.output);
            (buf.data.clone(), buf.truncated)
        };
        let exit_code = *entry.exit.borrow();
        Ok(json!({
            "output": data,
            "truncated": truncated,
            "done": exit_code.is_some(),
            "exitStatus": exit_code.map(|code| json!({"exitCode": code})),
        }))
    }

    /// Handle `terminal/wait_for_exit`: block until the process exits, or
    /// until the optional `timeout` (seconds) elapses.
    pub async fn wait_for_exit(&self, params: &Value) -> Result<Value, RpcError> {
        let id = require_id(params)?;
        let (_, mut exit) = self.entry_pid_and_exit(id)?;
        let timeout = params.get("timeout").and_then(Value::as_f64);

        let wait = exit.wait_for(Option::is_some);
        let status = match timeout {
            Some(secs) => tokio::time::timeout(Duration::from_secs_f64(secs), wait)
                .await
                .map_err(|_| {
                    RpcError::new(
                        codes::TIMED_OUT,
                        format!("Terminal {id} did not exit within {secs}s"),
                    )
                })?,
            None => wait.await,
        };
        match status {
            Ok(guard) => {
                let code = guard.unwrap_or(-1);
                Ok(json!({"exitCode": code}))
            }
            // Sender dropped without publishing; treat as killed.
            Err(_) => Ok(json!({"exitCode": -1})),
        }
    }

    /// Handle `terminal/kill`: SIGTERM, a bounded grace, then SIGKILL.
    /// The terminal stays registered so its output remains queryable.
    pub async fn kill(&self, params: &Value) -> Result<Value, RpcError> {
        let id = require_id(params)?;
        let (pid, mut exit) = self.entry_pid_and_exit(id)?;
        kill_process(pid, &mut exit).await;
        Ok(json!({"success": true}))
    }

    /// Handle `terminal/release`: forget the terminal without killing it.
    pub fn release(&self, params: &Value) -> Result<Value, RpcError> {
        let id = require_id(params)?;
        lock(&self.terminals)
            .remove(id)
            .ok_or_else(|| not_found(id))?;
        debug!("Terminal {id} released");
        Ok(json!({"success": true}))
    }

    /// Kill every live terminal; used during adapter shutdown.
    pub async fn kill_all(&self) {
        let entries: Vec<(i32, watch::Receiver<Option<i32>>)> = {
            let mut terminals = lock(&self.terminals);
            terminals
                .drain()
                .map(|(_, e)| (e.pid, e.exit))
                .collect()
        };
        for (pid, mut exit) in entries {
            if exit.borrow().is_none() {
                kill_process(pid, &mut exit).await;
            }
        }
    }

    /// Number of terminals currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.terminals).len()
    }

    /// Whether no terminals are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn kill_process(pid: i32, exit: &mut watch::Receiver<Option<i32>>) {
    if exit.borrow().is_some() {
        return;
    }
    if pid > 0 {
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }
    let wait = exit.wait_for(Option::is_some);
    if tokio::time::timeout(KILL_GRACE, wait).await.is_err() {
        warn!("Terminal pid {pid} ignored SIGTERM; sending SIGKILL");
        if pid > 0 {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
        let _ = exit.wait_for(Option::is_some).await;
    }
}

async fn pump(
    mut reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    output: Arc<StdMutex<OutputBuf>>,
) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]);
                let mut buf = lock_buf(&output);
                let room = OUTPUT_CAP.saturating_sub(buf.data.len());
                if room >= text.len() {
                    buf.data.push_str(&text);
                } else {
                    let mut end = room;
                    while end > 0 && !text.is_char_boundary(end) {
                        end -= 1;
                    }
                    buf.data.push_str(&text[..end]);
                    buf.truncated = true;
                }
            }
        }
    }
}

fn require_id(params: &Value) -> Result<&str, RpcError> {
    params
        .get("terminalId")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params("Missing required parameter 'terminalId'"))
}

fn not_found(id: &str) -> RpcError {
    RpcError::new(codes::NOT_FOUND, format!("Unknown terminal: {id}"))
}

fn lock(
    terminals: &StdMutex<HashMap<String, TerminalEntry>>,
) -> std::sync::MutexGuard<'_, HashMap<String, TerminalEntry>> {
    terminals.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn lock_buf(output: &StdMutex<OutputBuf>) -> std::sync::MutexGuard<'_, OutputBuf> {
    output.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
