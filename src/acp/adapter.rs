//! Adapter facade
//!
//! [`AcpAdapter`] is the single entry point callers use: it owns the session
//! engine, the permission policy, and the terminal registry, wires all the
//! agent-to-host handlers into the transport router, and exposes a
//! turn-oriented API that never panics the caller's loop.

use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};

use super::client::{KillHandle, Router, TransportError};
use super::fs;
use super::models::{AdapterConfig, TurnMetadata, TurnResult};
use super::permissions::{ApprovalChannel, PermissionPolicy, PermissionRecord, PermissionStats};
use super::session::{register_update_handler, EngineState, SessionEngine};
use super::terminal::TerminalManager;

/// High-level adapter over an ACP agent subprocess.
///
/// Turns are serialized: concurrent `run_turn` callers queue on an internal
/// lock. All failure modes surface as failed [`TurnResult`]s so an
/// orchestration loop can keep iterating.
pub struct AcpAdapter {
    engine: tokio::sync::Mutex<SessionEngine>,
    policy: Arc<PermissionPolicy>,
    terminals: Arc<TerminalManager>,
    kill_handle: StdMutex<Option<KillHandle>>,
}

impl std::fmt::Debug for AcpAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcpAdapter").finish_non_exhaustive()
    }
}

impl AcpAdapter {
    /// Build an adapter, validating the configuration and checking that the
    /// agent command resolves on PATH.
    pub fn new(config: AdapterConfig) -> Result<Self> {
        Self::with_channel(config, None)
    }

    /// Like [`AcpAdapter::new`], with an approval channel for
    /// `interactive` permission mode.
    pub fn with_channel(
        config: AdapterConfig,
        channel: Option<Box<dyn ApprovalChannel>>,
    ) -> Result<Self> {
        config.validate()?;
        which::which(&config.agent_command).with_context(|| {
            format!("Agent command '{}' not found on PATH", config.agent_command)
        })?;

        let mut policy = PermissionPolicy::new(config.permission_mode, &config.allowlist);
        if let Some(channel) = channel {
            policy = policy.with_channel(channel);
        }
        Ok(Self {
            engine: tokio::sync::Mutex::new(SessionEngine::new(config)),
            policy: Arc::new(policy),
            terminals: Arc::new(TerminalManager::new()),
            kill_handle: StdMutex::new(None),
        })
    }

    fn build_router(&self, engine: &SessionEngine) -> Router {
        let mut router = Router::new();
        register_update_handler(&mut router, engine.session());

        let policy = Arc::clone(&self.policy);
        router.on_request("session/request_permission", move |params| {
            let approved = policy.decide_request(&params);
            async move { Ok(json!({"approved": approved})) }
        });

        router.on_request("fs/read_text_file", fs::read_text_file);
        router.on_request("fs/write_text_file", fs::write_text_file);

        let terminals = Arc::clone(&self.terminals);
        router.on_request("terminal/create", move |params| {
            let terminals = Arc::clone(&terminals);
            async move { terminals.create(&params) }
        });
        let terminals = Arc::clone(&self.terminals);
        router.on_request("terminal/output", move |params| {
            let terminals = Arc::clone(&terminals);
            async move { terminals.output(&params) }
        });
        let terminals = Arc::clone(&self.terminals);
        router.on_request("terminal/wait_for_exit", move |params| {
            let terminals = Arc::clone(&terminals);
            async move { terminals.wait_for_exit(&params).await }
        });
        let terminals = Arc::clone(&self.terminals);
        router.on_request("terminal/kill", move |params| {
            let terminals = Arc::clone(&terminals);
            async move { terminals.kill(&params).await }
        });
        let terminals = Arc::clone(&self.terminals);
        router.on_request("terminal/release", move |params| {
            let terminals = Arc::clone(&terminals);
            async move { terminals.release(&params) }
        });

        router
    }

    async fn ensure_initialized(&self, engine: &mut SessionEngine) -> Result<(), TransportError> {
        if matches!(engine.state(), EngineState::Ready | EngineState::Prompting) {
            return Ok(());
        }
        let router = self.build_router(engine);
        engine.initialize(router).await?;
        if let Some(client) = engine.client() {
            *lock(&self.kill_handle) = Some(client.kill_handle());
        }
        info!("Agent session initialized");
        Ok(())
    }

    /// Run one prompt turn end to end. Initialization happens lazily, and
    /// re-initialization happens automatically after a transport failure.
    /// Never returns an error: every failure mode becomes a failed
    /// [`TurnResult`].
    pub async fn run_turn(&self, prompt: &str) -> TurnResult {
        let mut engine = self.engine.lock().await;
        if let Err(e) = self.ensure_initialized(&mut engine).await {
            warn!("Agent initialization failed: {e}");
            return failed_turn(format!("Failed to initialize agent: {e}"));
        }
        match engine.prompt(prompt).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Turn failed on transport error: {e}");
                failed_turn(format!("Transport failure: {e}"))
            }
        }
    }

    /// Stop the agent gracefully and kill any terminals it left behind.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let mut engine = self.engine.lock().await;
        engine.shutdown().await;
        self.terminals.kill_all().await;
        info!("Adapter shut down");
    }

    /// Kill the agent process immediately, bypassing the graceful ladder.
    /// Takes no async locks, so it is safe to call from a signal task while
    /// a turn is in flight.
    pub fn kill_now(&self) {
        if let Some(handle) = lock(&self.kill_handle).as_ref() {
            handle.kill();
        }
    }

    /// Permission decisions made so far, oldest first.
    #[must_use]
    pub fn permission_history(&self) -> Vec<PermissionRecord> {
        self.policy.history()
    }

    /// Aggregate permission counts.
    #[must_use]
    pub fn permission_stats(&self) -> PermissionStats {
        self.policy.stats()
    }
}

fn failed_turn(error: String) -> TurnResult {
    TurnResult {
        success: false,
        output: String::new(),
        error: Some(error),
        metadata: TurnMetadata::default(),
    }
}

fn lock(handle: &StdMutex<Option<KillHandle>>) -> std::sync::MutexGuard<'_, Option<KillHandle>> {
    handle.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
