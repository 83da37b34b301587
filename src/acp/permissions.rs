//! Permission policy for agent tool-use requests
//!
//! The agent asks the host for permission before running tools; the policy
//! decides synchronously from the configured mode. Allowlist patterns are
//! compiled once at construction so per-request matching never re-parses.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::models::PermissionMode;

/// Decisions kept in the rolling history.
const HISTORY_CAP: usize = 256;

/// A single pattern from the allowlist, classified at construction.
///
/// Slash-delimited patterns (`/re/`) are regular expressions, patterns
/// containing `*` or `?` are globs, everything else matches exactly.
#[derive(Debug)]
enum CompiledPattern {
    Exact(String),
    Glob(Regex),
    Regex(Regex),
}

impl CompiledPattern {
    fn compile(pattern: &str) -> Option<Self> {
        if pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/') {
            let body = &pattern[1..pattern.len() - 1];
            return match Regex::new(body) {
                Ok(re) => Some(Self::Regex(re)),
                Err(e) => {
                    // An unparseable pattern must never approve anything.
                    warn!("Ignoring invalid allowlist regex '{pattern}': {e}");
                    None
                }
            };
        }
        if pattern.contains('*') || pattern.contains('?') {
            let mut re = String::from("^");
            for ch in pattern.chars() {
                match ch {
                    '*' => re.push_str(".*"),
                    '?' => re.push('.'),
                    other => re.push_str(&regex::escape(&other.to_string())),
                }
            }
            re.push('$');
            return match Regex::new(&re) {
                Ok(re) => Some(Self::Glob(re)),
                Err(e) => {
                    warn!("Ignoring unusable allowlist glob '{pattern}': {e}");
                    None
                }
            };
        }
        Some(Self::Exact(pattern.to_string()))
    }

    fn matches(&self, tool: &str) -> bool {
        match self {
            Self::Exact(name) => name == tool,
            Self::Glob(re) | Self::Regex(re) => re.is_match(tool),
        }
    }
}

/// One recorded permission decision.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionRecord {
    /// Tool name the agent asked about.
    pub tool: String,
    /// Whether the request was approved.
    pub approved: bool,
    /// Which mode produced the decision.
    pub mode: PermissionMode,
    /// When the decision was made.
    pub decided_at: DateTime<Utc>,
}

/// Aggregate counts over all decisions made by a policy.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PermissionStats {
    /// Requests approved.
    pub approved: usize,
    /// Requests denied.
    pub denied: usize,
}

/// Callback used by `interactive` mode to ask a human.
///
/// Implementations must answer promptly; the agent is blocked on the reply.
pub trait ApprovalChannel: Send + Sync {
    /// Return whether the named tool may run.
    fn approve(&self, tool: &str) -> bool;
}

struct PolicyState {
    history: VecDeque<PermissionRecord>,
    stats: PermissionStats,
}

/// Synchronous permission decider with a rolling decision history.
pub struct PermissionPolicy {
    mode: PermissionMode,
    allowlist: Vec<CompiledPattern>,
    channel: Option<Box<dyn ApprovalChannel>>,
    state: StdMutex<PolicyState>,
}

impl PermissionPolicy {
    /// Build a policy for the given mode, compiling allowlist patterns
    /// up front. Invalid patterns are dropped (and can therefore never
    /// match).
    #[must_use]
    pub fn new(mode: PermissionMode, allowlist: &[String]) -> Self {
        let allowlist = allowlist
            .iter()
            .filter_map(|p| CompiledPattern::compile(p))
            .collect();
        Self {
            mode,
            allowlist,
            channel: None,
            state: StdMutex::new(PolicyState {
                history: VecDeque::new(),
                stats: PermissionStats::default(),
            }),
        }
    }

    /// Attach the channel consulted in `interactive` mode. Without one,
    /// interactive requests are denied.
    #[must_use]
    pub fn with_channel(mut self, channel: Box<dyn ApprovalChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Decide whether `tool` may run, recording the outcome.
    pub fn decide(&self, tool: &str) -> bool {
        let approved = match self.mode {
            PermissionMode::AutoApprove => true,
            PermissionMode::DenyAll => false,
            PermissionMode::Allowlist => self.allowlist.iter().any(|p| p.matches(tool)),
            PermissionMode::Interactive => match &self.channel {
                Some(channel) => channel.approve(tool),
                None => {
                    warn!("Interactive mode with no approval channel; denying '{tool}'");
                    false
                }
            },
        };
        debug!(
            "Permission {} for tool '{tool}' ({:?})",
            if approved { "granted" } else { "denied" },
            self.mode
        );

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if approved {
            state.stats.approved += 1;
        } else {
            state.stats.denied += 1;
        }
        if state.history.len() >= HISTORY_CAP {
            state.history.pop_front();
        }
        state.history.push_back(PermissionRecord {
            tool: tool.to_string(),
            approved,
            mode: self.mode,
            decided_at: Utc::now(),
        });
        approved
    }

    /// Decide from a raw `session/request_permission` params payload.
    ///
    /// The `operation` string (e.g. `fs/read_text_file`) is what allowlist
    /// patterns match against; the tool-call description is the fallback for
    /// agents that only report a kind or title.
    pub fn decide_request(&self, params: &Value) -> bool {
        let tool = params
            .get("operation")
            .filter(|v| v.is_string())
            .or_else(|| {
                params
                    .get("toolCall")
                    .and_then(|tc| tc.get("kind").or_else(|| tc.get("title")))
            })
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        self.decide(tool)
    }

    /// Snapshot of the rolling decision history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<PermissionRecord> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// Aggregate approved/denied counts.
    #[must_use]
    pub fn stats(&self) -> PermissionStats {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .stats
    }
}
