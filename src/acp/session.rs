//! Session state and streaming engine
//!
//! The [`Session`] accumulator folds streamed `session/update` payloads into
//! per-turn state (output, thoughts, tool calls, plan). The
//! [`SessionEngine`] drives the initialize → session/new → prompt cycle over
//! the transport client and owns the adapter's lifecycle state machine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::{json, Value};
use tracing::debug;

use super::client::{AcpClient, Router, TransportError};
use super::models::{
    AdapterConfig, SessionUpdate, StopReason, ToolCall, ToolCallStatus, TurnMetadata, TurnResult,
    PROTOCOL_VERSION,
};

/// Per-prompt accumulator for streamed session updates.
///
/// Reset before each turn so updates from different turns never bleed into
/// one another; the backing agent session (and its id) persists across turns
/// for context continuity.
#[derive(Debug, Default)]
pub struct Session {
    /// The agent-issued session id (empty until `session/new` completes).
    pub session_id: String,
    output: String,
    thoughts: String,
    tool_calls: HashMap<String, ToolCall>,
    plan: Vec<String>,
    /// Stop reason of the most recently completed turn.
    pub last_stop_reason: Option<StopReason>,
}

impl Session {
    /// Clear per-turn state, retaining the session id.
    pub fn reset(&mut self) {
        self.output.clear();
        self.thoughts.clear();
        self.tool_calls.clear();
        self.plan.clear();
        self.last_stop_reason = None;
    }

    /// Fold one streamed update into the accumulator. Updates are applied in
    /// receipt order and never reordered.
    pub fn apply(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::AgentMessageChunk { text } => self.output.push_str(&text),
            SessionUpdate::AgentThoughtChunk { text } => self.thoughts.push_str(&text),
            SessionUpdate::ToolCall { id, kind, status } => {
                self.tool_calls.insert(
                    id.clone(),
                    ToolCall {
                        id,
                        kind,
                        status,
                        result: None,
                    },
                );
            }
            SessionUpdate::ToolCallUpdate { id, status, result } => {
                // An update can race ahead of its tool_call announcement;
                // synthesize the record rather than dropping the update.
                let call = self.tool_calls.entry(id.clone()).or_insert_with(|| ToolCall {
                    id,
                    kind: None,
                    status: ToolCallStatus::Pending,
                    result: None,
                });
                if let Some(status) = status {
                    call.status = status;
                }
                if result.is_some() {
                    call.result = result;
                }
            }
            SessionUpdate::Plan { entries } => self.plan = entries,
            SessionUpdate::Unknown { kind } => {
                debug!("Ignoring unknown session update kind '{kind}'");
            }
        }
    }

    /// Accumulated agent output for the current turn.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Accumulated agent thoughts (never exposed as task output).
    #[must_use]
    pub fn thoughts(&self) -> &str {
        &self.thoughts
    }

    /// Number of tool calls observed this turn.
    #[must_use]
    pub fn tool_call_count(&self) -> usize {
        self.tool_calls.len()
    }

    /// Look up a tool call by id.
    #[must_use]
    pub fn tool_call(&self, id: &str) -> Option<&ToolCall> {
        self.tool_calls.get(id)
    }

    /// Latest plan entries, recorded for diagnostics.
    #[must_use]
    pub fn plan(&self) -> &[String] {
        &self.plan
    }

    fn metadata(&self, stop_reason: Option<StopReason>) -> TurnMetadata {
        TurnMetadata {
            session_id: self.session_id.clone(),
            stop_reason,
            tool_call_count: self.tool_calls.len(),
            had_thoughts: !self.thoughts.is_empty(),
        }
    }
}

/// Lifecycle state of a [`SessionEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No transport yet.
    Uninitialized,
    /// Handshake in flight.
    Initializing,
    /// Handshake complete; a prompt turn may start.
    Ready,
    /// A prompt turn is in flight.
    Prompting,
    /// Shutdown in progress.
    ShuttingDown,
    /// Transport stopped; re-initialization required before further turns.
    Terminated,
}

/// Drives the initialize → session/new → prompt cycle over an [`AcpClient`].
///
/// Only one prompt turn may be active at a time; the adapter facade
/// serializes callers. Initialization is idempotent.
pub struct SessionEngine {
    config: AdapterConfig,
    client: Option<Arc<AcpClient>>,
    session: Arc<StdMutex<Session>>,
    state: EngineState,
}

impl SessionEngine {
    /// Create an engine in the `Uninitialized` state.
    #[must_use]
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            config,
            client: None,
            session: Arc::new(StdMutex::new(Session::default())),
            state: EngineState::Uninitialized,
        }
    }

    /// The shared session accumulator, for wiring the `session/update`
    /// notification handler.
    #[must_use]
    pub fn session(&self) -> Arc<StdMutex<Session>> {
        Arc::clone(&self.session)
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> EngineState {
        self.state
    }

    /// The transport client, once started.
    #[must_use]
    pub fn client(&self) -> Option<Arc<AcpClient>> {
        self.client.clone()
    }

    /// Perform the handshake: start the transport, send `initialize` with
    /// the protocol version and host capabilities, then `session/new`, and
    /// store the returned session id.
    ///
    /// Idempotent: a call while already `Ready` (or mid-turn) is a no-op.
    pub async fn initialize(&mut self, router: Router) -> Result<(), TransportError> {
        match self.state {
            EngineState::Ready | EngineState::Prompting => return Ok(()),
            EngineState::ShuttingDown => return Err(TransportError::Closed),
            EngineState::Uninitialized | EngineState::Initializing | EngineState::Terminated => {}
        }

        self.state = EngineState::Initializing;
        let client = Arc::new(AcpClient::start(&self.config, router)?);

        let handshake = async {
            let init = client
                .send_request(
                    "initialize",
                    &json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "clientCapabilities": {
                            "fs": {"readTextFile": true, "writeTextFile": true},
                            "terminal": true,
                        },
                    }),
                )
                .await?;
            if init.get("protocolVersion").is_none() {
                return Err(TransportError::Rpc(super::protocol::RpcError::new(
                    super::protocol::codes::INVALID_REQUEST,
                    "Invalid initialize response: missing protocolVersion",
                )));
            }

            // The server-capability negotiation field is required even when
            // empty.
            let session = client
                .send_request("session/new", &json!({"mcpServers": []}))
                .await?;
            session
                .get("sessionId")
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| {
                    TransportError::Rpc(super::protocol::RpcError::new(
                        super::protocol::codes::INVALID_REQUEST,
                        "Invalid session/new response: missing sessionId",
                    ))
                })
        };

        match handshake.await {
            Ok(session_id) => {
                {
                    let mut session = lock(&self.session);
                    session.reset();
                    session.session_id = session_id;
                }
                self.client = Some(client);
                self.state = EngineState::Ready;
                Ok(())
            }
            Err(e) => {
                client.stop().await;
                self.state = EngineState::Uninitialized;
                Err(e)
            }
        }
    }

    /// Run one prompt turn: reset the accumulator, send `session/prompt`,
    /// and fold concurrent `session/update` notifications until the response
    /// arrives.
    ///
    /// Timeouts and agent-reported errors come back as failed
    /// [`TurnResult`]s with the session left `Ready`; transport-fatal
    /// failures are returned as errors and terminate the engine.
    pub async fn prompt(&mut self, text: &str) -> Result<TurnResult, TransportError> {
        if self.state != EngineState::Ready {
            return Err(TransportError::NotRunning);
        }
        let client = self.client.clone().ok_or(TransportError::NotRunning)?;

        let session_id = {
            let mut session = lock(&self.session);
            session.reset();
            session.session_id.clone()
        };

        self.state = EngineState::Prompting;
        let response = client
            .send_request(
                "session/prompt",
                &json!({
                    "sessionId": session_id,
                    "prompt": [{"type": "text", "text": text}],
                }),
            )
            .await;
        self.state = EngineState::Ready;

        match response {
            Ok(response) => {
                let stop_reason = response
                    .get("stopReason")
                    .and_then(Value::as_str)
                    .map(StopReason::parse);
                let mut session = lock(&self.session);
                session.last_stop_reason = stop_reason.clone();
                let failed = stop_reason.as_ref().is_some_and(StopReason::is_error);
                Ok(TurnResult {
                    success: !failed,
                    output: session.output().to_string(),
                    error: failed.then(|| {
                        format!(
                            "Agent stopped with reason '{}'",
                            stop_reason.as_ref().map_or("unknown", StopReason::as_str)
                        )
                    }),
                    metadata: session.metadata(stop_reason),
                })
            }
            Err(TransportError::TimedOut(t)) => {
                // The caller gives up; the agent may keep emitting updates
                // into the stale accumulator, which the next reset clears.
                let session = lock(&self.session);
                Ok(TurnResult {
                    success: false,
                    output: session.output().to_string(),
                    error: Some(format!("Prompt turn timed out after {t:?}")),
                    metadata: session.metadata(None),
                })
            }
            Err(TransportError::Rpc(e)) => {
                let session = lock(&self.session);
                Ok(TurnResult {
                    success: false,
                    output: session.output().to_string(),
                    error: Some(format!("Agent error: {e}")),
                    metadata: session.metadata(None),
                })
            }
            Err(e) => {
                self.state = EngineState::Terminated;
                Err(e)
            }
        }
    }

    /// Stop the transport and mark the engine terminated. Idempotent.
    pub async fn shutdown(&mut self) {
        if matches!(
            self.state,
            EngineState::ShuttingDown | EngineState::Terminated
        ) {
            return;
        }
        self.state = EngineState::ShuttingDown;
        if let Some(client) = self.client.take() {
            client.stop().await;
        }
        self.state = EngineState::Terminated;
    }
}

fn lock(session: &Arc<StdMutex<Session>>) -> std::sync::MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Wire a `session/update` notification handler that folds updates into the
/// shared accumulator.
pub fn register_update_handler(router: &mut Router, session: Arc<StdMutex<Session>>) {
    router.on_notification("session/update", move |params| {
        if let Some(update) = SessionUpdate::from_params(&params) {
            let mut session = session.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            session.apply(update);
        } else {
            debug!("Dropping session/update with no recognizable payload");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn chunk(text: &str) -> SessionUpdate {
        SessionUpdate::AgentMessageChunk {
            text: text.to_string(),
        }
    }

    #[test]
    fn test_chunks_accumulate_in_receipt_order() {
        let mut session = Session::default();
        session.apply(chunk("a"));
        session.apply(chunk("b"));
        session.apply(chunk("c"));
        assert_eq!(session.output(), "abc");
    }

    #[test]
    fn test_thoughts_kept_separate_from_output() {
        let mut session = Session::default();
        session.apply(chunk("visible"));
        session.apply(SessionUpdate::AgentThoughtChunk {
            text: "hidden".to_string(),
        });
        assert_eq!(session.output(), "visible");
        assert_eq!(session.thoughts(), "hidden");
    }

    #[test]
    fn test_tool_call_then_update_yields_single_updated_record() {
        let mut session = Session::default();
        session.apply(SessionUpdate::ToolCall {
            id: "tc-1".to_string(),
            kind: Some("edit".to_string()),
            status: ToolCallStatus::Pending,
        });
        session.apply(SessionUpdate::ToolCallUpdate {
            id: "tc-1".to_string(),
            status: Some(ToolCallStatus::Completed),
            result: Some(json!("done")),
        });

        assert_eq!(session.tool_call_count(), 1);
        let call = session.tool_call("tc-1").unwrap();
        assert_eq!(call.status, ToolCallStatus::Completed);
        assert_eq!(call.kind.as_deref(), Some("edit"));
        assert_eq!(call.result, Some(json!("done")));
    }

    #[test]
    fn test_orphan_tool_call_update_synthesizes_record() {
        let mut session = Session::default();
        session.apply(SessionUpdate::ToolCallUpdate {
            id: "tc-9".to_string(),
            status: Some(ToolCallStatus::Running),
            result: None,
        });

        assert_eq!(session.tool_call_count(), 1);
        assert_eq!(
            session.tool_call("tc-9").unwrap().status,
            ToolCallStatus::Running
        );
    }

    #[test]
    fn test_update_without_status_keeps_existing_status() {
        let mut session = Session::default();
        session.apply(SessionUpdate::ToolCall {
            id: "tc-1".to_string(),
            kind: None,
            status: ToolCallStatus::Running,
        });
        session.apply(SessionUpdate::ToolCallUpdate {
            id: "tc-1".to_string(),
            status: None,
            result: Some(json!({"lines": 3})),
        });

        let call = session.tool_call("tc-1").unwrap();
        assert_eq!(call.status, ToolCallStatus::Running);
        assert!(call.result.is_some());
    }

    #[test]
    fn test_plan_recorded_without_touching_output() {
        let mut session = Session::default();
        session.apply(SessionUpdate::Plan {
            entries: vec!["step one".to_string()],
        });
        assert_eq!(session.plan(), ["step one".to_string()]);
        assert_eq!(session.output(), "");
    }

    #[test]
    fn test_reset_clears_turn_state_but_keeps_session_id() {
        let mut session = Session {
            session_id: "s-42".to_string(),
            ..Default::default()
        };
        session.apply(chunk("leftover"));
        session.apply(SessionUpdate::ToolCall {
            id: "tc-1".to_string(),
            kind: None,
            status: ToolCallStatus::Pending,
        });
        session.last_stop_reason = Some(StopReason::EndTurn);

        session.reset();

        assert_eq!(session.session_id, "s-42");
        assert_eq!(session.output(), "");
        assert_eq!(session.tool_call_count(), 0);
        assert!(session.last_stop_reason.is_none());
    }

    // --- engine tests against scripted agents ---

    fn engine_for(script: &str) -> SessionEngine {
        SessionEngine::new(AdapterConfig {
            agent_command: "sh".to_string(),
            agent_args: vec!["-c".to_string(), script.to_string()],
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
    }

    const HANDSHAKE: &str = r#"IFS= read -r line
printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-01"}}\n'
IFS= read -r line
printf '{"jsonrpc":"2.0","id":2,"result":{"sessionId":"sess-1"}}\n'"#;

    #[tokio::test]
    async fn test_initialize_handshake_stores_session_id() {
        let mut engine = engine_for(&format!("{HANDSHAKE}\nsleep 2"));
        let mut router = Router::new();
        register_update_handler(&mut router, engine.session());

        engine.initialize(router).await.unwrap();

        assert_eq!(engine.state(), EngineState::Ready);
        assert_eq!(lock(&engine.session()).session_id, "sess-1");
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Terminated);
    }

    #[tokio::test]
    async fn test_initialize_while_ready_is_noop() {
        let mut engine = engine_for(&format!("{HANDSHAKE}\nsleep 2"));
        engine.initialize(Router::new()).await.unwrap();
        // A second handshake would hang (the script only answers twice);
        // idempotency means it never reaches the wire.
        engine.initialize(Router::new()).await.unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_initialize_rejects_missing_protocol_version() {
        let mut engine = engine_for(
            r#"IFS= read -r line
printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'
sleep 2"#,
        );
        let err = engine.initialize(Router::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Rpc(_)), "got: {err:?}");
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }

    #[tokio::test]
    async fn test_prompt_turn_accumulates_chunks_and_stop_reason() {
        let script = format!(
            r#"{HANDSHAKE}
IFS= read -r line
printf '{{"jsonrpc":"2.0","method":"session/update","params":{{"sessionId":"sess-1","update":{{"sessionUpdate":"agent_message_chunk","content":{{"type":"text","text":"Hello "}}}}}}}}\n'
printf '{{"jsonrpc":"2.0","method":"session/update","params":{{"sessionId":"sess-1","update":{{"sessionUpdate":"agent_message_chunk","content":{{"type":"text","text":"world"}}}}}}}}\n'
printf '{{"jsonrpc":"2.0","id":3,"result":{{"stopReason":"end_turn"}}}}\n'
sleep 1"#
        );
        let mut engine = engine_for(&script);
        let mut router = Router::new();
        register_update_handler(&mut router, engine.session());
        engine.initialize(router).await.unwrap();

        let result = engine.prompt("say hello").await.unwrap();

        assert!(result.success);
        assert_eq!(result.output, "Hello world");
        assert_eq!(result.metadata.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(result.metadata.session_id, "sess-1");
        assert!(!result.metadata.had_thoughts);
        assert_eq!(engine.state(), EngineState::Ready);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_prompt_timeout_leaves_session_ready() {
        let script = format!("{HANDSHAKE}\nIFS= read -r line\nsleep 10");
        let mut engine = SessionEngine::new(AdapterConfig {
            agent_command: "sh".to_string(),
            agent_args: vec!["-c".to_string(), script],
            timeout: Duration::from_secs(1),
            ..Default::default()
        });
        let mut router = Router::new();
        register_update_handler(&mut router, engine.session());
        engine.initialize(router).await.unwrap();

        let result = engine.prompt("slow").await.unwrap();

        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
        assert_eq!(engine.state(), EngineState::Ready);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_prompt_error_stop_reason_is_failure_with_partial_output() {
        let script = format!(
            r#"{HANDSHAKE}
IFS= read -r line
printf '{{"jsonrpc":"2.0","method":"session/update","params":{{"sessionId":"sess-1","update":{{"sessionUpdate":"agent_message_chunk","content":{{"type":"text","text":"partial"}}}}}}}}\n'
printf '{{"jsonrpc":"2.0","id":3,"result":{{"stopReason":"refusal"}}}}\n'
sleep 1"#
        );
        let mut engine = engine_for(&script);
        let mut router = Router::new();
        register_update_handler(&mut router, engine.session());
        engine.initialize(router).await.unwrap();

        let result = engine.prompt("do bad thing").await.unwrap();

        assert!(!result.success);
        assert_eq!(result.output, "partial");
        assert!(result.error.unwrap().contains("refusal"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut engine = engine_for("sleep 2");
        engine.shutdown().await;
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Terminated);
    }
}
