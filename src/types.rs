//! Core types for the a3s-beacon system
//!
//! All wire types use camelCase JSON serialization so other components of
//! the suite (launcher, browser extension, board) can read them unchanged.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canonical status of an agent session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Nothing is running and nobody is being asked anything
    #[default]
    Idle,
    /// The agent is executing tools or generating
    Working,
    /// The agent is blocked on a human decision
    Waiting,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Working => "working",
            SessionStatus::Waiting => "waiting",
        }
    }

    /// Whether the session occupies a concurrency slot
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionStatus::Idle)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters accumulated over one logical session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    /// Completed executions per tool name
    pub tools_used: BTreeMap<String, u64>,

    /// Completed `write`/`edit` executions
    pub files_edited: u64,

    /// Completed `bash` executions
    pub commands_run: u64,
}

impl SessionMetrics {
    /// Record one completed tool execution
    pub fn record_tool(&mut self, tool: &str) {
        let tool = tool.to_ascii_lowercase();
        match tool.as_str() {
            "write" | "edit" => self.files_edited += 1,
            "bash" => self.commands_run += 1,
            _ => {}
        }
        *self.tools_used.entry(tool).or_insert(0) += 1;
    }

    /// Total completed tool executions
    pub fn total_tools(&self) -> u64 {
        self.tools_used.values().sum()
    }
}

/// Presence record for one running instance
///
/// Leased in the broker with a short TTL; a crashed instance disappears once
/// the lease runs out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    /// Port of the instance-local status server
    pub port: u16,

    /// Workspace the instance is attached to
    pub workspace_path: String,

    /// OS process id of the instance
    pub process_id: u32,

    /// Unix milliseconds of the first registration
    pub registered_at: u64,
}

/// Authoritative in-memory status, as served by `GET /status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub session_id: Option<String>,
    pub workspace_path: String,
    pub project_name: String,
    pub pid: u32,
    pub status: SessionStatus,
    pub is_working: bool,
    pub is_waiting: bool,
    pub is_idle: bool,
    pub last_activity_time: u64,
    pub work_started_at: Option<u64>,
    pub metrics: SessionMetrics,
}

/// Reachability report served by `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub ok: bool,
    pub workspace_path: String,
    pub pid: u32,
    pub port: u16,
    /// Seconds since the server started
    pub uptime: u64,
}

/// Domain event kinds broadcast through the fanout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A status transition (always immediate)
    StatusChanged,
    /// Periodic liveness re-publish of the current status
    Heartbeat,
    /// A working stretch began
    SessionActive,
    /// A working stretch ended and stayed idle past the debounce window
    SessionIdle,
    /// The host created a new session
    SessionStarted,
    /// The host deleted the session
    SessionDeleted,
    /// The host reported a session error
    SessionError,
    /// The host compacted the session context
    SessionCompacted,
    /// The agent asked for a human decision
    PermissionRequested,
    /// A block-severity safety rule failed
    SafetyBlocked,
    /// A warning-severity safety rule failed
    SafetyWarning,
}

impl EventKind {
    /// Wire name used in the `type`/`event_type` fields
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StatusChanged => "status.changed",
            EventKind::Heartbeat => "session.heartbeat",
            EventKind::SessionActive => "session.active",
            EventKind::SessionIdle => "session.idle",
            EventKind::SessionStarted => "session.started",
            EventKind::SessionDeleted => "session.deleted",
            EventKind::SessionError => "session.error",
            EventKind::SessionCompacted => "session.compacted",
            EventKind::PermissionRequested => "permission.requested",
            EventKind::SafetyBlocked => "safety.blocked",
            EventKind::SafetyWarning => "safety.warning",
        }
    }

    /// Event name understood by legacy consumers, if this kind is translated
    pub fn legacy_name(&self) -> Option<&'static str> {
        match self {
            EventKind::SessionActive => Some("work_started"),
            EventKind::SessionIdle => Some("work_stopped"),
            EventKind::SessionDeleted => Some("session_ended"),
            EventKind::PermissionRequested => Some("waiting_for_input"),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a human-facing notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    WorkStarted,
    WorkStopped,
    Permission,
    Safety,
    Error,
}

/// Presentation hint for a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStyle {
    Info,
    Success,
    Warning,
    Error,
}

/// Display name of a workspace: its last path segment
pub fn project_name(workspace_path: &str) -> String {
    workspace_path
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(workspace_path)
        .to_string()
}
