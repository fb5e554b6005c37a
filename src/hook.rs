//! Hook payload parsing and validation.
//!
//! The agent's hook forwarder POSTs one JSON object per lifecycle event.
//! Only `hookEventName` and `sessionId` are required; every other field is
//! optional and unknown extra fields are accepted without error. This module
//! turns the raw payload into the typed [`IncomingHook`] the registry
//! dispatches on.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Errors produced while validating a hook payload. All of them map to a
/// `400` response; none of them touch session state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    /// A required field is absent or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// `sessionId` does not match `[A-Za-z0-9_-]+`.
    #[error("invalid sessionId: must match [A-Za-z0-9_-]+")]
    InvalidSessionId,

    /// `hookEventName` is not a recognized hook.
    #[error("unknown hookEventName: {0}")]
    UnknownEventName(String),
}

/// Raw hook POST body. Field names are camelCase on the wire; unrecognized
/// fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookPayload {
    pub hook_event_name: Option<String>,
    pub session_id: Option<String>,
    pub transcript_path: Option<String>,
    pub cwd: Option<String>,
    pub tool_name: Option<String>,
    pub tool_use_id: Option<String>,
    pub tool_input: Option<Value>,
    pub permission_mode: Option<String>,
    pub reason: Option<String>,
    pub prompt: Option<String>,
    pub source: Option<String>,
    pub agent_id: Option<String>,
    pub agent_type: Option<String>,
}

/// The recognized hook event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEventName {
    SessionStart,
    UserPromptSubmit,
    PreToolUse,
    PermissionRequest,
    PostToolUse,
    PostToolUseFailure,
    Stop,
    SessionEnd,
    PreCompact,
    Notification,
    SubagentStart,
    SubagentStop,
    TeammateIdle,
    TaskCompleted,
}

impl HookEventName {
    /// Parses the wire name of a hook event.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "SessionStart" => Some(Self::SessionStart),
            "UserPromptSubmit" => Some(Self::UserPromptSubmit),
            "PreToolUse" => Some(Self::PreToolUse),
            "PermissionRequest" => Some(Self::PermissionRequest),
            "PostToolUse" => Some(Self::PostToolUse),
            "PostToolUseFailure" => Some(Self::PostToolUseFailure),
            "Stop" => Some(Self::Stop),
            "SessionEnd" => Some(Self::SessionEnd),
            "PreCompact" => Some(Self::PreCompact),
            "Notification" => Some(Self::Notification),
            "SubagentStart" => Some(Self::SubagentStart),
            "SubagentStop" => Some(Self::SubagentStop),
            "TeammateIdle" => Some(Self::TeammateIdle),
            "TaskCompleted" => Some(Self::TaskCompleted),
            _ => None,
        }
    }

    /// Returns the wire name, as recorded in audit `[hook]` lines.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStart => "SessionStart",
            Self::UserPromptSubmit => "UserPromptSubmit",
            Self::PreToolUse => "PreToolUse",
            Self::PermissionRequest => "PermissionRequest",
            Self::PostToolUse => "PostToolUse",
            Self::PostToolUseFailure => "PostToolUseFailure",
            Self::Stop => "Stop",
            Self::SessionEnd => "SessionEnd",
            Self::PreCompact => "PreCompact",
            Self::Notification => "Notification",
            Self::SubagentStart => "SubagentStart",
            Self::SubagentStop => "SubagentStop",
            Self::TeammateIdle => "TeammateIdle",
            Self::TaskCompleted => "TaskCompleted",
        }
    }
}

/// A validated hook, ready for dispatch.
#[derive(Debug, Clone)]
pub struct IncomingHook {
    /// The session this hook belongs to.
    pub session_id: String,
    /// The hook name, for audit logging.
    pub name: HookEventName,
    /// The typed event.
    pub event: HookEvent,
}

/// Typed hook events. Variants that only feed the audit log collapse into
/// [`HookEvent::LoggingOnly`].
#[derive(Debug, Clone)]
pub enum HookEvent {
    UserPromptSubmit {
        transcript_path: Option<String>,
        cwd: Option<String>,
        prompt: Option<String>,
    },
    PermissionRequest {
        tool_name: String,
        tool_use_id: Option<String>,
        tool_input: Option<Value>,
    },
    PreToolUse {
        tool_name: String,
        tool_use_id: Option<String>,
        tool_input: Option<Value>,
    },
    PostToolUse {
        tool_name: Option<String>,
        tool_use_id: Option<String>,
    },
    PostToolUseFailure {
        tool_name: Option<String>,
        tool_use_id: Option<String>,
    },
    Stop,
    SessionEnd {
        reason: Option<String>,
    },
    PreCompact,
    LoggingOnly,
}

/// Checks the `[A-Za-z0-9_-]+` session-id shape. The same predicate guards
/// the audit log route, so a session id can never name a path outside the
/// log directory.
#[must_use]
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl TryFrom<HookPayload> for IncomingHook {
    type Error = HookError;

    fn try_from(payload: HookPayload) -> Result<Self, HookError> {
        let name_raw = payload
            .hook_event_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(HookError::MissingField("hookEventName"))?;
        let name = HookEventName::parse(name_raw)
            .ok_or_else(|| HookError::UnknownEventName(name_raw.to_string()))?;

        let session_id = payload
            .session_id
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(HookError::MissingField("sessionId"))?;
        if !is_valid_session_id(&session_id) {
            return Err(HookError::InvalidSessionId);
        }

        let event = match name {
            HookEventName::UserPromptSubmit => HookEvent::UserPromptSubmit {
                transcript_path: payload.transcript_path,
                cwd: payload.cwd,
                prompt: payload.prompt,
            },
            HookEventName::PermissionRequest => HookEvent::PermissionRequest {
                tool_name: payload.tool_name.unwrap_or_else(|| "unknown".to_string()),
                tool_use_id: payload.tool_use_id,
                tool_input: payload.tool_input,
            },
            HookEventName::PreToolUse => HookEvent::PreToolUse {
                tool_name: payload.tool_name.unwrap_or_else(|| "unknown".to_string()),
                tool_use_id: payload.tool_use_id,
                tool_input: payload.tool_input,
            },
            HookEventName::PostToolUse => HookEvent::PostToolUse {
                tool_name: payload.tool_name,
                tool_use_id: payload.tool_use_id,
            },
            HookEventName::PostToolUseFailure => HookEvent::PostToolUseFailure {
                tool_name: payload.tool_name,
                tool_use_id: payload.tool_use_id,
            },
            HookEventName::Stop => HookEvent::Stop,
            HookEventName::SessionEnd => HookEvent::SessionEnd {
                reason: payload.reason,
            },
            HookEventName::PreCompact => HookEvent::PreCompact,
            HookEventName::SessionStart
            | HookEventName::Notification
            | HookEventName::SubagentStart
            | HookEventName::SubagentStop
            | HookEventName::TeammateIdle
            | HookEventName::TaskCompleted => HookEvent::LoggingOnly,
        };

        Ok(IncomingHook {
            session_id,
            name,
            event,
        })
    }
}
