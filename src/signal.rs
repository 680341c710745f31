//! Host lifecycle signals
//!
//! The agent host delivers these as JSON objects tagged by `type`. Every
//! field other than the tag is optional: a payload missing what a handler
//! needs turns into a no-op for that handler, never an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Host-reported session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Busy,
    Idle,
    Retry,
    #[serde(other)]
    Unknown,
}

/// A raw callback from the agent host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostSignal {
    SessionCreated {
        #[serde(default)]
        session_id: Option<String>,
    },
    SessionStatus {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        status: Option<HostStatus>,
    },
    /// Deprecated duplicate of `SessionStatus { status: idle }`
    SessionIdle {
        #[serde(default)]
        session_id: Option<String>,
    },
    SessionError {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    SessionCompacted {
        #[serde(default)]
        session_id: Option<String>,
    },
    SessionDeleted {
        #[serde(default)]
        session_id: Option<String>,
    },
    ToolBefore {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        tool: Option<String>,
        #[serde(default)]
        args: Value,
    },
    ToolAfter {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        tool: Option<String>,
    },
    PermissionAsked {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        permission: Value,
    },
    PermissionUpdated {
        #[serde(default)]
        session_id: Option<String>,
    },
}

/// Canonical transition request derived from a host signal
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// A session began; metrics reset
    Begin,
    /// Work is happening (tool start or host busy)
    Work,
    /// The host went idle (both idle signals land here, guarded once)
    Idle,
    /// The agent asked for a human decision
    PermissionAsked { title: Option<String>, permission: Value },
    /// Permission state changed without a new ask
    PermissionUpdated,
    /// The session is gone
    End,
    /// A tool finished; counts toward metrics
    ToolCompleted { tool: String },
    Error { message: Option<String> },
    Compacted,
    /// Nothing to do for this signal
    Ignore,
}

impl HostSignal {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            HostSignal::SessionCreated { session_id }
            | HostSignal::SessionStatus { session_id, .. }
            | HostSignal::SessionIdle { session_id }
            | HostSignal::SessionError { session_id, .. }
            | HostSignal::SessionCompacted { session_id }
            | HostSignal::SessionDeleted { session_id }
            | HostSignal::ToolBefore { session_id, .. }
            | HostSignal::ToolAfter { session_id, .. }
            | HostSignal::PermissionAsked { session_id, .. }
            | HostSignal::PermissionUpdated { session_id } => session_id.as_deref(),
        }
    }

    /// Collapse host-specific signals into one canonical transition
    pub fn normalize(&self) -> Transition {
        match self {
            HostSignal::SessionCreated { .. } => Transition::Begin,
            HostSignal::SessionStatus { status, .. } => match status {
                Some(HostStatus::Busy) | Some(HostStatus::Retry) => Transition::Work,
                Some(HostStatus::Idle) => Transition::Idle,
                Some(HostStatus::Unknown) | None => Transition::Ignore,
            },
            HostSignal::SessionIdle { .. } => Transition::Idle,
            HostSignal::SessionError { error, .. } => Transition::Error {
                message: error.clone(),
            },
            HostSignal::SessionCompacted { .. } => Transition::Compacted,
            HostSignal::SessionDeleted { .. } => Transition::End,
            HostSignal::ToolBefore { .. } => Transition::Work,
            HostSignal::ToolAfter { tool, .. } => match tool {
                Some(tool) if !tool.is_empty() => Transition::ToolCompleted { tool: tool.clone() },
                _ => Transition::Ignore,
            },
            HostSignal::PermissionAsked {
                title, permission, ..
            } => Transition::PermissionAsked {
                title: title.clone(),
                permission: permission.clone(),
            },
            HostSignal::PermissionUpdated { .. } => Transition::PermissionUpdated,
        }
    }
}

/// A tool invocation about to run, as seen by the safety engine
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool: String,
    /// Shell command, for `bash`
    pub command: Option<String>,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            command: None,
        }
    }

    pub fn bash(command: impl Into<String>) -> Self {
        Self {
            tool: "bash".to_string(),
            command: Some(command.into()),
        }
    }

    /// Extract a tool call from a `tool_before` signal, if it names a tool
    pub fn from_signal(signal: &HostSignal) -> Option<Self> {
        let HostSignal::ToolBefore { tool, args, .. } = signal else {
            return None;
        };
        let tool = tool.as_deref().filter(|t| !t.is_empty())?;
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self {
            tool: tool.to_string(),
            command,
        })
    }
}
