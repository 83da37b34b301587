//! ACP transport client
//!
//! Owns the agent subprocess and the duplex message routing on top of its
//! stdio: a read-loop task decodes newline-delimited JSON-RPC from stdout
//! and routes responses to pending requests, notifications to registered
//! handlers, and inbound requests to registered async handlers (whose
//! results are written back with the peer's id). Writes to stdin are
//! serialized so no two messages ever interleave on the wire.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use super::models::AdapterConfig;
use super::protocol::{
    decode, encode_error_response, encode_notification, encode_response, Message, RequestIds,
    RpcError,
};

/// How long `stop` waits for the agent to exit after stdin closes, before
/// escalating to SIGTERM.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// How long `stop` waits after SIGTERM before force-killing.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The agent executable could not be spawned.
    #[error("Failed to spawn agent '{command}': {source}")]
    Spawn {
        /// The command that failed to spawn.
        command: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The transport was stopped or the agent's pipe closed while a request
    /// was outstanding.
    #[error("Transport closed")]
    Closed,
    /// A request did not receive a response within its deadline.
    #[error("Request timed out after {0:?}")]
    TimedOut(Duration),
    /// The agent answered a request with a JSON-RPC error.
    #[error("Agent error: {0}")]
    Rpc(RpcError),
    /// A write was attempted while the transport is not running.
    #[error("Transport is not running")]
    NotRunning,
    /// I/O failure on the agent's stdin.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A registered notification handler, invoked inline on the read loop.
pub type NotificationHandler = Box<dyn Fn(Value) + Send + Sync>;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;

/// A registered inbound-request handler. Runs on its own task so servicing
/// a request never stalls message consumption.
pub type RequestHandler = Box<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Registration table mapping method names to handlers, resolved once at
/// setup and never re-inspected per message.
#[derive(Default)]
pub struct Router {
    notifications: HashMap<String, NotificationHandler>,
    requests: HashMap<String, RequestHandler>,
}

impl Router {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a notification handler for a method name.
    pub fn on_notification<F>(&mut self, method: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.notifications.insert(method.to_string(), Box::new(handler));
    }

    /// Register an inbound-request handler for a method name.
    pub fn on_request<F, Fut>(&mut self, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.requests.insert(
            method.to_string(),
            Box::new(move |params| Box::pin(handler(params))),
        );
    }
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>;

/// Duplex JSON-RPC client over an agent subprocess's stdio.
#[derive(Debug)]
pub struct AcpClient {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    pending: Arc<StdMutex<PendingMap>>,
    ids: RequestIds,
    child: Mutex<Option<Child>>,
    /// Raw pid for the signal-safe kill path; 0 when not running.
    pid: Arc<AtomicI32>,
    timeout: Duration,
}

impl AcpClient {
    /// Spawn the agent subprocess and start the read loop.
    ///
    /// stderr is captured separately for diagnostics and never parsed as
    /// protocol. Fails with [`TransportError::Spawn`] if the executable is
    /// missing or the spawn fails.
    pub fn start(config: &AdapterConfig, router: Router) -> Result<Self, TransportError> {
        let mut child = Command::new(&config.agent_command)
            .args(&config.agent_args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                command: config.agent_command.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(TransportError::NotRunning)?;
        let stdout = child.stdout.take().ok_or(TransportError::NotRunning)?;
        let stderr = child.stderr.take().ok_or(TransportError::NotRunning)?;

        let pid = Arc::new(AtomicI32::new(
            child.id().and_then(|p| i32::try_from(p).ok()).unwrap_or(0),
        ));

        let client = Self {
            stdin: Arc::new(Mutex::new(Some(stdin))),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            ids: RequestIds::new(),
            child: Mutex::new(Some(child)),
            pid: Arc::clone(&pid),
            timeout: config.timeout,
        };

        // Drain stderr so the agent never blocks on a full pipe.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "relay::agent_stderr", "{line}");
            }
        });

        let pending = Arc::clone(&client.pending);
        let stdin_for_reader = Arc::clone(&client.stdin);
        tokio::spawn(async move {
            let router = Arc::new(router);
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        route_message(&line, &pending, &router, &stdin_for_reader);
                    }
                    // EOF or pipe failure ends the loop either way.
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Agent stdout read failed: {e}");
                        break;
                    }
                }
            }
            pid.store(0, Ordering::SeqCst);
            fail_pending(&pending);
        });

        Ok(client)
    }

    /// Whether the agent subprocess is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.pid.load(Ordering::SeqCst) != 0
    }

    /// A handle that can kill the subprocess synchronously from a signal
    /// context (holds no locks, just the raw pid).
    #[must_use]
    pub fn kill_handle(&self) -> KillHandle {
        KillHandle {
            pid: Arc::clone(&self.pid),
        }
    }

    /// Send a request and suspend until its response, an error, a timeout,
    /// or transport shutdown.
    pub async fn send_request(
        &self,
        method: &str,
        params: &Value,
    ) -> Result<Value, TransportError> {
        self.send_request_with_timeout(method, params, self.timeout)
            .await
    }

    /// Like [`Self::send_request`] with an explicit deadline.
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let (id, message) = self.ids.encode_request(method, params);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            pending.insert(id, tx);
        }

        if let Err(e) = self.write_line(&message).await {
            let mut pending = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped: the pending table was drained at shutdown.
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                let mut pending = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                pending.remove(&id);
                Err(TransportError::TimedOut(timeout))
            }
        }
    }

    /// Send a notification. Fire-and-forget; no pending-request entry.
    pub async fn send_notification(
        &self,
        method: &str,
        params: &Value,
    ) -> Result<(), TransportError> {
        self.write_line(&encode_notification(method, params)).await
    }

    /// Graceful shutdown: close stdin (EOF to the peer), wait a bounded
    /// grace period, escalate to SIGTERM, then force-kill. All pending
    /// requests are rejected with a "closed" reason immediately rather than
    /// left to time out. Idempotent and safe to call concurrently with an
    /// in-flight turn.
    pub async fn stop(&self) {
        // Close stdin so a well-behaved agent exits on its own.
        drop(self.stdin.lock().await.take());

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
                self.kill_handle().terminate();
                if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        self.pid.store(0, Ordering::SeqCst);
        fail_pending(&self.pending);
    }

    async fn write_line(&self, message: &str) -> Result<(), TransportError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::NotRunning)?;
        stdin.write_all(message.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Signal-safe kill primitive: sends signals to the stored raw pid without
/// touching any lock the normal write path holds.
#[derive(Debug, Clone)]
pub struct KillHandle {
    pid: Arc<AtomicI32>,
}

impl KillHandle {
    /// Send SIGTERM to the agent if it is running.
    pub fn terminate(&self) {
        self.signal(nix::sys::signal::Signal::SIGTERM);
    }

    /// Send SIGKILL to the agent if it is running.
    pub fn kill(&self) {
        self.signal(nix::sys::signal::Signal::SIGKILL);
    }

    fn signal(&self, sig: nix::sys::signal::Signal) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid > 0 {
            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), sig);
        }
    }
}

/// Route one decoded message from the read loop.
fn route_message(
    line: &str,
    pending: &Arc<StdMutex<PendingMap>>,
    router: &Arc<Router>,
    stdin: &Arc<Mutex<Option<ChildStdin>>>,
) {
    match decode(line) {
        Message::Response { id, result } => {
            resolve_pending(pending, &id, Ok(result));
        }
        Message::Error { id, error } => {
            resolve_pending(pending, &id, Err(TransportError::Rpc(error)));
        }
        Message::Notification { method, params } => {
            if let Some(handler) = router.notifications.get(&method) {
                handler(params);
            } else {
                debug!("Dropping notification for unhandled method '{method}'");
            }
        }
        Message::Request { id, method, params } => {
            // Service inbound requests on their own task so a slow handler
            // never pauses message consumption.
            let stdin = Arc::clone(stdin);
            if let Some(handler) = router.requests.get(&method) {
                let fut = handler(params);
                tokio::spawn(async move {
                    let reply = match fut.await {
                        Ok(result) => encode_response(&id, &result),
                        Err(error) => encode_error_response(&id, &error),
                    };
                    write_reply(&stdin, &reply).await;
                });
            } else {
                // An unanswered request would hang the peer.
                warn!("No handler for inbound request method '{method}'");
                let reply = encode_error_response(&id, &RpcError::method_not_found(&method));
                tokio::spawn(async move {
                    write_reply(&stdin, &reply).await;
                });
            }
        }
        Message::Malformed { reason } => {
            // One bad message does not terminate the loop.
            warn!("Skipping malformed message: {reason}");
        }
    }
}

async fn write_reply(stdin: &Arc<Mutex<Option<ChildStdin>>>, message: &str) {
    let mut guard = stdin.lock().await;
    if let Some(stdin) = guard.as_mut() {
        let write = async {
            stdin.write_all(message.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        if let Err(e) = write.await {
            warn!("Failed to write reply to agent: {e}");
        }
    }
}

fn resolve_pending(
    pending: &Arc<StdMutex<PendingMap>>,
    id: &Value,
    outcome: Result<Value, TransportError>,
) {
    let Some(id) = id.as_u64() else {
        warn!("Dropping response with non-integer id {id}");
        return;
    };
    let sender = {
        let mut pending = pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        pending.remove(&id)
    };
    match sender {
        // The caller may have timed out and gone away; that is not an error.
        Some(tx) => drop(tx.send(outcome)),
        None => warn!("Dropping response for unknown request id {id}"),
    }
}

/// Reject every outstanding request with a "closed" reason.
fn fail_pending(pending: &Arc<StdMutex<PendingMap>>) {
    let drained: Vec<_> = {
        let mut pending = pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        pending.drain().collect()
    };
    for (_, tx) in drained {
        let _ = tx.send(Err(TransportError::Closed));
    }
}
