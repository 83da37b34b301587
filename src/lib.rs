//! Relay - Orchestration loop for ACP-compliant coding agents
//!
//! Relay drives an AI coding agent over the Agent Client Protocol: it
//! spawns the agent as a subprocess, speaks JSON-RPC 2.0 over its stdio,
//! services the agent's permission, filesystem, and terminal requests, and
//! loops prompt turns until the task completes.

// Allow multiple crate versions from dependencies (can't easily control)
#![allow(clippy::multiple_crate_versions)]

pub mod acp;
pub mod config;
pub mod log;
pub mod orchestrator;

// Re-export commonly used types
pub use acp::adapter::AcpAdapter;
pub use acp::client::{AcpClient, KillHandle, Router, TransportError};
pub use acp::models::{AdapterConfig, PermissionMode, StopReason, TurnResult};
pub use acp::permissions::{ApprovalChannel, PermissionPolicy};
pub use acp::session::{Session, SessionEngine};
pub use acp::terminal::TerminalManager;
pub use config::RelayConfig;
pub use log::{JsonlLogger, TurnRecord};
pub use orchestrator::RunOutcome;
