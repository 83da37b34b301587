//! Typed message models for the ACP adapter
//!
//! Structured representations of session update payloads, tool-call records,
//! stop reasons, turn results, and adapter configuration. Wire payloads are
//! parsed leniently from `serde_json::Value` — unknown update kinds are
//! preserved as `Unknown` for forward compatibility, never errors.

use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version this adapter speaks.
pub const PROTOCOL_VERSION: &str = "2024-01";

/// How the host answers `session/request_permission` requests from the agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Approve every request.
    #[default]
    AutoApprove,
    /// Deny every request.
    DenyAll,
    /// Approve iff the requested operation matches a configured pattern.
    Allowlist,
    /// Ask an attached approval channel; deny if none is attached.
    Interactive,
}

impl std::str::FromStr for PermissionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto_approve" => Ok(Self::AutoApprove),
            "deny_all" => Ok(Self::DenyAll),
            "allowlist" => Ok(Self::Allowlist),
            "interactive" => Ok(Self::Interactive),
            other => bail!(
                "Invalid permission mode '{other}' \
                 (expected auto_approve, deny_all, allowlist, or interactive)"
            ),
        }
    }
}

/// Adapter configuration, immutable after construction.
///
/// Values are validated by [`AdapterConfig::validate`] at load time, not at
/// use time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Command to spawn the agent (e.g. `gemini`).
    pub agent_command: String,
    /// Additional command-line arguments.
    pub agent_args: Vec<String>,
    /// Per-request and per-turn deadline.
    pub timeout: Duration,
    /// Permission handling mode.
    pub permission_mode: PermissionMode,
    /// Allowlist patterns (only consulted in `Allowlist` mode).
    pub allowlist: Vec<String>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            agent_command: "gemini".to_string(),
            agent_args: vec![],
            timeout: Duration::from_secs(300),
            permission_mode: PermissionMode::AutoApprove,
            allowlist: vec![],
        }
    }
}

impl AdapterConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.agent_command.trim().is_empty() {
            bail!("Agent command cannot be empty");
        }
        if self.timeout.is_zero() {
            bail!("Timeout must be greater than zero");
        }
        for pattern in &self.allowlist {
            if pattern.trim().is_empty() {
                bail!("Allowlist patterns cannot be empty");
            }
        }
        Ok(())
    }
}

/// Lifecycle status of a tool call reported by the agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Announced but not yet started.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl ToolCallStatus {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" | "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A tool call announced during a turn. Created on the first `tool_call`
/// update, mutated in place by `tool_call_update` notifications, retained
/// for the turn's metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Agent-assigned tool call id.
    pub id: String,
    /// Tool kind (e.g. "read", "edit", "execute") when reported.
    pub kind: Option<String>,
    /// Current lifecycle status.
    pub status: ToolCallStatus,
    /// Raw result content, if any has been reported.
    pub result: Option<Value>,
}

/// Terminal classification of a `session/prompt` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The agent finished the turn normally.
    EndTurn,
    /// The agent hit its token limit.
    MaxTokens,
    /// The agent hit its per-turn request limit.
    MaxTurnRequests,
    /// The agent refused to continue.
    Refusal,
    /// The turn was cancelled.
    Cancelled,
    /// Unrecognized stop reason, preserved verbatim.
    #[serde(untagged)]
    Other(String),
}

impl StopReason {
    /// Parse a stop reason string from a prompt response.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "end_turn" => Self::EndTurn,
            "max_tokens" => Self::MaxTokens,
            "max_turn_requests" => Self::MaxTurnRequests,
            "refusal" => Self::Refusal,
            "cancelled" => Self::Cancelled,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether this stop reason indicates the turn failed.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Refusal | Self::Cancelled)
    }

    /// Canonical wire string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::EndTurn => "end_turn",
            Self::MaxTokens => "max_tokens",
            Self::MaxTurnRequests => "max_turn_requests",
            Self::Refusal => "refusal",
            Self::Cancelled => "cancelled",
            Self::Other(s) => s,
        }
    }
}

/// A parsed `session/update` notification payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// A fragment of agent output text.
    AgentMessageChunk {
        /// The text fragment.
        text: String,
    },
    /// A fragment of agent reasoning, kept separate from output.
    AgentThoughtChunk {
        /// The text fragment.
        text: String,
    },
    /// A new tool call was announced.
    ToolCall {
        /// Agent-assigned tool call id.
        id: String,
        /// Tool kind, when reported.
        kind: Option<String>,
        /// Initial status (defaults to pending).
        status: ToolCallStatus,
    },
    /// An existing tool call changed status or produced a result.
    ToolCallUpdate {
        /// Agent-assigned tool call id.
        id: String,
        /// New status, if reported.
        status: Option<ToolCallStatus>,
        /// Result content, if reported.
        result: Option<Value>,
    },
    /// A plan notice, recorded for diagnostics only.
    Plan {
        /// Plan entry texts.
        entries: Vec<String>,
    },
    /// Unrecognized update kind — ignored, not an error.
    Unknown {
        /// The raw `sessionUpdate` value.
        kind: String,
    },
}

impl SessionUpdate {
    /// Parse a `session/update` notification's params.
    ///
    /// Returns `None` when the params carry no recognizable update object at
    /// all (malformed notifications are dropped by the caller).
    #[must_use]
    pub fn from_params(params: &Value) -> Option<Self> {
        // The update object nests under "update"; tolerate flat params too.
        let update = params.get("update").unwrap_or(params);
        let kind = update.get("sessionUpdate")?.as_str()?;

        match kind {
            "agent_message_chunk" => Some(Self::AgentMessageChunk {
                text: content_text(update),
            }),
            "agent_thought_chunk" => Some(Self::AgentThoughtChunk {
                text: content_text(update),
            }),
            "tool_call" => {
                let id = update.get("toolCallId")?.as_str()?.to_string();
                let kind = update
                    .get("kind")
                    .and_then(Value::as_str)
                    .map(String::from);
                let status = update
                    .get("status")
                    .and_then(Value::as_str)
                    .and_then(ToolCallStatus::parse)
                    .unwrap_or(ToolCallStatus::Pending);
                Some(Self::ToolCall { id, kind, status })
            }
            "tool_call_update" => {
                let id = update.get("toolCallId")?.as_str()?.to_string();
                let status = update
                    .get("status")
                    .and_then(Value::as_str)
                    .and_then(ToolCallStatus::parse);
                let result = update.get("content").cloned().filter(|v| !v.is_null());
                Some(Self::ToolCallUpdate { id, status, result })
            }
            "plan" => {
                let entries = update
                    .get("entries")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|e| {
                                e.get("content")
                                    .and_then(Value::as_str)
                                    .or_else(|| e.as_str())
                                    .map(String::from)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Some(Self::Plan { entries })
            }
            other => Some(Self::Unknown {
                kind: other.to_string(),
            }),
        }
    }
}

/// Extract the text of a `content` block (`{type: "text", text: ...}`),
/// tolerating a bare string.
fn content_text(update: &Value) -> String {
    match update.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(content) => content
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        None => String::new(),
    }
}

/// Metadata attached to a turn result.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnMetadata {
    /// The agent-side session id for this conversation.
    pub session_id: String,
    /// The stop reason reported by the agent, if the turn completed.
    pub stop_reason: Option<StopReason>,
    /// Number of tool calls observed during the turn.
    pub tool_call_count: usize,
    /// Whether any thought chunks were streamed.
    pub had_thoughts: bool,
}

/// The structured result of one prompt turn, as consumed by the
/// orchestration loop. Failures carry the output accumulated before the
/// failure plus a descriptive error — they are never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnResult {
    /// Whether the turn completed without error.
    pub success: bool,
    /// Accumulated agent output for the turn.
    pub output: String,
    /// Error detail when `success` is false.
    pub error: Option<String>,
    /// Turn metadata.
    pub metadata: TurnMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_permission_mode_from_str() {
        assert_eq!(
            "auto_approve".parse::<PermissionMode>().unwrap(),
            PermissionMode::AutoApprove
        );
        assert_eq!(
            "deny_all".parse::<PermissionMode>().unwrap(),
            PermissionMode::DenyAll
        );
        assert_eq!(
            "allowlist".parse::<PermissionMode>().unwrap(),
            PermissionMode::Allowlist
        );
        assert_eq!(
            "interactive".parse::<PermissionMode>().unwrap(),
            PermissionMode::Interactive
        );
    }

    #[test]
    fn test_permission_mode_rejects_unknown() {
        let err = "yolo".parse::<PermissionMode>().unwrap_err();
        assert!(err.to_string().contains("Invalid permission mode"));
    }

    #[test]
    fn test_config_validate_rejects_empty_command() {
        let config = AdapterConfig {
            agent_command: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validate_rejects_zero_timeout() {
        let config = AdapterConfig {
            timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validate_rejects_blank_allowlist_pattern() {
        let config = AdapterConfig {
            allowlist: vec!["fs/*".to_string(), String::new()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_default_passes_validation() {
        assert!(AdapterConfig::default().validate().is_ok());
    }

    #[test]
    fn test_stop_reason_parse_known_values() {
        assert_eq!(StopReason::parse("end_turn"), StopReason::EndTurn);
        assert_eq!(StopReason::parse("max_tokens"), StopReason::MaxTokens);
        assert_eq!(StopReason::parse("cancelled"), StopReason::Cancelled);
    }

    #[test]
    fn test_stop_reason_parse_unknown_preserved() {
        let reason = StopReason::parse("model_overloaded");
        assert_eq!(reason, StopReason::Other("model_overloaded".to_string()));
        assert_eq!(reason.as_str(), "model_overloaded");
    }

    #[test]
    fn test_stop_reason_error_classification() {
        assert!(!StopReason::EndTurn.is_error());
        assert!(!StopReason::MaxTokens.is_error());
        assert!(StopReason::Refusal.is_error());
        assert!(StopReason::Cancelled.is_error());
    }

    #[test]
    fn test_parse_agent_message_chunk() {
        let params = json!({
            "sessionId": "s1",
            "update": {
                "sessionUpdate": "agent_message_chunk",
                "content": {"type": "text", "text": "Hello"}
            }
        });
        let update = SessionUpdate::from_params(&params).unwrap();
        assert_eq!(
            update,
            SessionUpdate::AgentMessageChunk {
                text: "Hello".to_string()
            }
        );
    }

    #[test]
    fn test_parse_thought_chunk_with_bare_string_content() {
        let params = json!({
            "update": {
                "sessionUpdate": "agent_thought_chunk",
                "content": "thinking..."
            }
        });
        let update = SessionUpdate::from_params(&params).unwrap();
        assert_eq!(
            update,
            SessionUpdate::AgentThoughtChunk {
                text: "thinking...".to_string()
            }
        );
    }

    #[test]
    fn test_parse_tool_call_defaults_to_pending() {
        let params = json!({
            "update": {
                "sessionUpdate": "tool_call",
                "toolCallId": "tc-1",
                "kind": "edit"
            }
        });
        let update = SessionUpdate::from_params(&params).unwrap();
        assert_eq!(
            update,
            SessionUpdate::ToolCall {
                id: "tc-1".to_string(),
                kind: Some("edit".to_string()),
                status: ToolCallStatus::Pending,
            }
        );
    }

    #[test]
    fn test_parse_tool_call_update_with_status_and_content() {
        let params = json!({
            "update": {
                "sessionUpdate": "tool_call_update",
                "toolCallId": "tc-1",
                "status": "completed",
                "content": [{"type": "text", "text": "done"}]
            }
        });
        let update = SessionUpdate::from_params(&params).unwrap();
        match update {
            SessionUpdate::ToolCallUpdate { id, status, result } => {
                assert_eq!(id, "tc-1");
                assert_eq!(status, Some(ToolCallStatus::Completed));
                assert!(result.is_some());
            }
            other => panic!("Expected ToolCallUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_in_progress_status_maps_to_running() {
        let params = json!({
            "update": {
                "sessionUpdate": "tool_call_update",
                "toolCallId": "tc-1",
                "status": "in_progress"
            }
        });
        match SessionUpdate::from_params(&params).unwrap() {
            SessionUpdate::ToolCallUpdate { status, .. } => {
                assert_eq!(status, Some(ToolCallStatus::Running));
            }
            other => panic!("Expected ToolCallUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_plan_entries() {
        let params = json!({
            "update": {
                "sessionUpdate": "plan",
                "entries": [
                    {"content": "Read the code", "status": "pending"},
                    {"content": "Fix the bug", "status": "pending"}
                ]
            }
        });
        let update = SessionUpdate::from_params(&params).unwrap();
        assert_eq!(
            update,
            SessionUpdate::Plan {
                entries: vec!["Read the code".to_string(), "Fix the bug".to_string()]
            }
        );
    }

    #[test]
    fn test_parse_unknown_update_kind_tolerated() {
        let params = json!({
            "update": {"sessionUpdate": "usage_report", "tokens": 42}
        });
        let update = SessionUpdate::from_params(&params).unwrap();
        assert_eq!(
            update,
            SessionUpdate::Unknown {
                kind: "usage_report".to_string()
            }
        );
    }

    #[test]
    fn test_parse_flat_params_without_update_wrapper() {
        let params = json!({
            "sessionUpdate": "agent_message_chunk",
            "content": {"type": "text", "text": "flat"}
        });
        let update = SessionUpdate::from_params(&params).unwrap();
        assert_eq!(
            update,
            SessionUpdate::AgentMessageChunk {
                text: "flat".to_string()
            }
        );
    }

    #[test]
    fn test_parse_missing_update_kind_returns_none() {
        assert!(SessionUpdate::from_params(&json!({"sessionId": "s1"})).is_none());
        assert!(SessionUpdate::from_params(&json!(null)).is_none());
    }
}
