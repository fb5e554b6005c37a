//! The per-session record owned by the registry.
//!
//! A `Session` exists iff a hook has been received for it or its log file
//! has been parsed. All mutation happens under the registry's per-session
//! mutex; nothing outside the registry ever holds a `Session` reference.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::gitinfo::GitInfo;
use crate::machine::MachineState;

/// A still-running tool, keyed by tool-use id in [`Session::active_tools`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTool {
    /// Tool name (e.g. "Bash", "Read", "Task").
    pub tool_name: String,
    /// Raw tool input, as supplied by the hook.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    /// When the tool started.
    pub started_at: DateTime<Utc>,
}

/// A still-running sub-agent task, keyed by tool-use id in
/// [`Session::active_tasks`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTask {
    /// Sub-agent type, from the Task tool input.
    pub agent_type: String,
    /// Human-readable task description.
    pub description: String,
    /// When the task started.
    pub started_at: DateTime<Utc>,
}

/// Todo-list progress extracted from the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoProgress {
    /// Total number of todo entries.
    pub total: u32,
    /// Number of completed entries.
    pub completed: u32,
}

/// A permission request that survived its debounce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPermission {
    /// The tool awaiting approval.
    pub tool_name: String,
    /// Raw tool input, if the request carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    /// When the underlying hook arrived.
    pub requested_at: DateTime<Utc>,
}

/// An armed permission debounce. At most one per session; replaced on a new
/// `PermissionRequest`, aborted when the session leaves the active region,
/// when the matching tool completes, or on `Stop`/`SessionEnd`.
///
/// The timer task carries only the session id and `seq`; `seq` mismatch on
/// fire means the timer was replaced while the callback was already running,
/// and the fire is dropped.
#[derive(Debug)]
pub struct PermissionTimer {
    /// Generation number; a fired callback must match it to take effect.
    pub seq: u64,
    /// The resolved tool-use id, when one could be resolved. Drives the
    /// selective cancel on tool completion.
    pub tool_use_id: Option<String>,
    /// Tool name captured from the request.
    pub tool_name: String,
    /// Tool input captured from the request.
    pub tool_input: Option<Value>,
    /// When the request arrived.
    pub requested_at: DateTime<Utc>,
    /// Handle of the sleeping timer task.
    pub handle: JoinHandle<()>,
}

impl PermissionTimer {
    /// Aborts the timer task. A callback that already started will bail on
    /// the `seq` check.
    pub fn cancel(self) {
        self.handle.abort();
    }
}

/// One session's complete mutable state.
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    /// Path of the session's transcript, once known.
    pub log_file_path: Option<String>,
    pub cwd: Option<String>,
    pub started_at: DateTime<Utc>,
    /// First user prompt, for the summarizer and the dashboard.
    pub original_prompt: Option<String>,

    pub machine_state: MachineState,
    pub pending_permission: Option<PendingPermission>,
    pub permission_timer: Option<PermissionTimer>,

    pub last_activity_at: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub todo_progress: Option<TodoProgress>,
    /// Byte offset up to which the transcript has been consumed. Monotone.
    pub log_tail_offset: u64,

    pub active_tasks: HashMap<String, ActiveTask>,
    pub active_tools: HashMap<String, ActiveTool>,
    pub compacting_since: Option<DateTime<Utc>>,

    pub git: Option<GitInfo>,

    pub goal: Option<String>,
    pub summary: Option<String>,
    /// At most one summarizer call in flight per session.
    pub summarize_in_flight: bool,
}

impl Session {
    /// Creates a session from its first hook.
    #[must_use]
    pub fn from_hook(
        session_id: String,
        transcript_path: Option<String>,
        cwd: Option<String>,
        prompt: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            log_file_path: transcript_path,
            cwd,
            started_at: now,
            original_prompt: prompt,
            machine_state: MachineState::Working,
            pending_permission: None,
            permission_timer: None,
            last_activity_at: Some(now),
            message_count: 0,
            todo_progress: None,
            log_tail_offset: 0,
            active_tasks: HashMap::new(),
            active_tools: HashMap::new(),
            compacting_since: None,
            git: None,
            goal: None,
            summary: None,
            summarize_in_flight: false,
        }
    }

    /// Creates a session bootstrapped from an existing log file that no hook
    /// has ever mentioned. It starts in `waiting` and lets hook signals
    /// correct it.
    #[must_use]
    pub fn from_log_file(session_id: String, log_file_path: String, now: DateTime<Utc>) -> Self {
        let mut session = Self::from_hook(session_id, Some(log_file_path), None, None, now);
        session.machine_state = MachineState::Waiting;
        session.last_activity_at = None;
        session
    }

    /// Whether this session lives in a git worktree. Feeds the transition
    /// function on every event.
    #[must_use]
    pub fn is_worktree(&self) -> bool {
        self.git.as_ref().is_some_and(|g| g.is_worktree)
    }

    /// Finds the youngest active tool with the given name, used to resolve a
    /// `PermissionRequest` that did not carry a tool-use id.
    #[must_use]
    pub fn youngest_active_tool(&self, tool_name: &str) -> Option<String> {
        self.active_tools
            .iter()
            .filter(|(_, tool)| tool.tool_name == tool_name)
            .max_by_key(|(id, tool)| (tool.started_at, (*id).clone()))
            .map(|(id, _)| id.clone())
    }

    /// Cancels the armed permission debounce, if any.
    pub fn cancel_permission_timer(&mut self) {
        if let Some(timer) = self.permission_timer.take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn tool(name: &str, started: DateTime<Utc>) -> ActiveTool {
        ActiveTool {
            tool_name: name.to_string(),
            tool_input: None,
            started_at: started,
        }
    }

    #[test]
    fn hook_created_session_starts_working() {
        let s = Session::from_hook("s1".into(), None, Some("/repo".into()), None, ts(100));
        assert_eq!(s.machine_state, MachineState::Working);
        assert_eq!(s.last_activity_at, Some(ts(100)));
        assert_eq!(s.log_tail_offset, 0);
    }

    #[test]
    fn log_bootstrapped_session_starts_waiting() {
        let s = Session::from_log_file("s1".into(), "/tmp/s1.jsonl".into(), ts(100));
        assert_eq!(s.machine_state, MachineState::Waiting);
        assert!(s.last_activity_at.is_none());
        assert_eq!(s.log_file_path.as_deref(), Some("/tmp/s1.jsonl"));
    }

    #[test]
    fn youngest_active_tool_prefers_latest_start() {
        let mut s = Session::from_hook("s1".into(), None, None, None, ts(0));
        s.active_tools.insert("old".into(), tool("Bash", ts(10)));
        s.active_tools.insert("new".into(), tool("Bash", ts(20)));
        s.active_tools.insert("other".into(), tool("Read", ts(30)));
        assert_eq!(s.youngest_active_tool("Bash"), Some("new".to_string()));
        assert_eq!(s.youngest_active_tool("Read"), Some("other".to_string()));
        assert_eq!(s.youngest_active_tool("Edit"), None);
    }

    #[test]
    fn is_worktree_defaults_false() {
        let s = Session::from_hook("s1".into(), None, None, None, ts(0));
        assert!(!s.is_worktree());
    }
}
