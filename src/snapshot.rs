//! Published session snapshots.
//!
//! A [`Snapshot`] is the flat, immutable DTO the publisher hands to
//! subscribers — the sole contract with the outside. Derivation from a
//! [`Session`] happens under the session's mutex and is pure; delivery
//! happens outside it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::machine::PublishedStatus;
use crate::session::{PendingPermission, Session, TodoProgress};

/// Tool-use id of the synthetic compaction task.
const COMPACTING_TASK_ID: &str = "compacting";

/// A running sub-agent task as published.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEntry {
    pub tool_use_id: String,
    pub agent_type: String,
    pub description: String,
    pub started_at: DateTime<Utc>,
}

/// A running tool as published. `Task` invocations are surfaced through
/// [`Snapshot::active_tasks`] instead.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEntry {
    pub tool_use_id: String,
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    pub started_at: DateTime<Utc>,
}

/// The published view of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub session_id: String,
    pub status: PublishedStatus,
    pub has_pending_tool_use: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_prompt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_root_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    pub is_worktree: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_root: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
    pub message_count: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_tool: Option<PendingPermission>,
    pub active_tasks: Vec<TaskEntry>,
    pub active_tools: Vec<ToolEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub todo_progress: Option<TodoProgress>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Snapshot {
    /// Derives the published view from a session record.
    #[must_use]
    pub fn from_session(session: &Session) -> Self {
        let mut active_tasks: Vec<TaskEntry> = session
            .active_tasks
            .iter()
            .map(|(id, task)| TaskEntry {
                tool_use_id: id.clone(),
                agent_type: task.agent_type.clone(),
                description: task.description.clone(),
                started_at: task.started_at,
            })
            .collect();
        if let Some(since) = session.compacting_since {
            active_tasks.push(TaskEntry {
                tool_use_id: COMPACTING_TASK_ID.to_string(),
                agent_type: "System".to_string(),
                description: "Compacting context".to_string(),
                started_at: since,
            });
        }
        active_tasks.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.tool_use_id.cmp(&b.tool_use_id))
        });

        let mut active_tools: Vec<ToolEntry> = session
            .active_tools
            .iter()
            .filter(|(_, tool)| tool.tool_name != "Task")
            .map(|(id, tool)| ToolEntry {
                tool_use_id: id.clone(),
                tool_name: tool.tool_name.clone(),
                tool_input: tool.tool_input.clone(),
                started_at: tool.started_at,
            })
            .collect();
        active_tools.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.tool_use_id.cmp(&b.tool_use_id))
        });

        let git = session.git.as_ref();

        Self {
            session_id: session.session_id.clone(),
            status: session.machine_state.published(),
            has_pending_tool_use: session.machine_state.has_pending_tool_use(),
            cwd: session.cwd.clone(),
            started_at: session.started_at,
            original_prompt: session.original_prompt.clone(),
            repo_root_path: git.and_then(|g| g.repo_root_path.clone()),
            repo_url: git.and_then(|g| g.repo_url.clone()),
            repo_id: git.and_then(|g| g.repo_id.clone()),
            git_branch: git.and_then(|g| g.branch.clone()),
            is_worktree: session.is_worktree(),
            worktree_root: git.and_then(|g| g.worktree_root.clone()),
            last_activity_at: session.last_activity_at,
            message_count: session.message_count,
            pending_tool: session.pending_permission.clone(),
            active_tasks,
            active_tools,
            todo_progress: session.todo_progress,
            goal: session.goal.clone(),
            summary: session.summary.clone(),
        }
    }
}

/// The change-detection predicate: an `update` is emitted iff at least one
/// of these fields differs from the last emitted snapshot. Everything else
/// (summaries, timestamps, pending-tool detail) rides along without forcing
/// an emission.
#[must_use]
pub fn should_emit_update(prev: &Snapshot, next: &Snapshot) -> bool {
    next.status != prev.status
        || next.has_pending_tool_use != prev.has_pending_tool_use
        || next.message_count > prev.message_count
        || next.git_branch != prev.git_branch
        || next.active_tasks != prev.active_tasks
        || next.active_tools != prev.active_tools
        || next.todo_progress != prev.todo_progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineState;
    use crate::session::{ActiveTask, ActiveTool};
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn session() -> Session {
        Session::from_hook("s1".into(), None, Some("/repo".into()), None, ts(100))
    }

    #[test]
    fn pending_flag_tracks_needs_approval() {
        let mut s = session();
        let snap = Snapshot::from_session(&s);
        assert_eq!(snap.status, PublishedStatus::Working);
        assert!(!snap.has_pending_tool_use);

        s.machine_state = MachineState::NeedsApproval;
        s.pending_permission = Some(PendingPermission {
            tool_name: "Bash".into(),
            tool_input: None,
            requested_at: ts(101),
        });
        let snap = Snapshot::from_session(&s);
        assert_eq!(snap.status, PublishedStatus::Waiting);
        assert!(snap.has_pending_tool_use);
        assert_eq!(snap.pending_tool.unwrap().tool_name, "Bash");
    }

    #[test]
    fn compaction_adds_synthetic_task() {
        let mut s = session();
        s.compacting_since = Some(ts(200));
        let snap = Snapshot::from_session(&s);
        assert_eq!(snap.active_tasks.len(), 1);
        let task = &snap.active_tasks[0];
        assert_eq!(task.tool_use_id, "compacting");
        assert_eq!(task.agent_type, "System");
        assert_eq!(task.description, "Compacting context");
    }

    #[test]
    fn task_invocations_are_excluded_from_tools() {
        let mut s = session();
        s.active_tools.insert(
            "t1".into(),
            ActiveTool {
                tool_name: "Task".into(),
                tool_input: None,
                started_at: ts(10),
            },
        );
        s.active_tools.insert(
            "t2".into(),
            ActiveTool {
                tool_name: "Bash".into(),
                tool_input: None,
                started_at: ts(11),
            },
        );
        s.active_tasks.insert(
            "t1".into(),
            ActiveTask {
                agent_type: "Explore".into(),
                description: "scan".into(),
                started_at: ts(10),
            },
        );
        let snap = Snapshot::from_session(&s);
        assert_eq!(snap.active_tools.len(), 1);
        assert_eq!(snap.active_tools[0].tool_name, "Bash");
        assert_eq!(snap.active_tasks.len(), 1);
        assert_eq!(snap.active_tasks[0].agent_type, "Explore");
    }

    #[test]
    fn ledger_ordering_is_deterministic() {
        let mut s = session();
        for (id, at) in [("b", 5), ("a", 5), ("c", 3)] {
            s.active_tools.insert(
                id.into(),
                ActiveTool {
                    tool_name: "Read".into(),
                    tool_input: None,
                    started_at: ts(at),
                },
            );
        }
        let snap = Snapshot::from_session(&s);
        let ids: Vec<_> = snap
            .active_tools
            .iter()
            .map(|t| t.tool_use_id.as_str())
            .collect();
        assert_eq!(ids, ["c", "a", "b"]);
    }

    #[test]
    fn identical_snapshots_do_not_emit() {
        let snap = Snapshot::from_session(&session());
        assert!(!should_emit_update(&snap, &snap.clone()));
    }

    #[test]
    fn status_change_emits() {
        let mut s = session();
        let prev = Snapshot::from_session(&s);
        s.machine_state = MachineState::Waiting;
        assert!(should_emit_update(&prev, &Snapshot::from_session(&s)));
    }

    #[test]
    fn message_count_increase_emits_decrease_does_not() {
        let mut s = session();
        s.message_count = 5;
        let prev = Snapshot::from_session(&s);
        s.message_count = 6;
        assert!(should_emit_update(&prev, &Snapshot::from_session(&s)));
        s.message_count = 4;
        assert!(!should_emit_update(&prev, &Snapshot::from_session(&s)));
    }

    #[test]
    fn branch_change_emits() {
        let mut s = session();
        s.git = Some(crate::gitinfo::GitInfo {
            repo_root_path: Some("/repo".into()),
            repo_url: None,
            repo_id: None,
            branch: Some("main".into()),
            is_worktree: false,
            worktree_root: None,
        });
        let prev = Snapshot::from_session(&s);
        s.git.as_mut().unwrap().branch = Some("feature".into());
        assert!(should_emit_update(&prev, &Snapshot::from_session(&s)));
    }

    #[test]
    fn todo_change_emits() {
        let mut s = session();
        let prev = Snapshot::from_session(&s);
        s.todo_progress = Some(TodoProgress {
            total: 4,
            completed: 1,
        });
        assert!(should_emit_update(&prev, &Snapshot::from_session(&s)));
    }

    #[test]
    fn ledger_change_emits() {
        let mut s = session();
        let prev = Snapshot::from_session(&s);
        s.active_tools.insert(
            "t1".into(),
            ActiveTool {
                tool_name: "Bash".into(),
                tool_input: None,
                started_at: ts(1),
            },
        );
        assert!(should_emit_update(&prev, &Snapshot::from_session(&s)));
    }

    #[test]
    fn summary_arrival_alone_does_not_emit() {
        let mut s = session();
        let prev = Snapshot::from_session(&s);
        s.summary = Some("Fixing the flaky test".into());
        s.goal = Some("Make CI green".into());
        assert!(!should_emit_update(&prev, &Snapshot::from_session(&s)));
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let snap = Snapshot::from_session(&session());
        let json = serde_json::to_value(&snap).unwrap();
        assert!(json.get("sessionId").is_some());
        assert!(json.get("hasPendingToolUse").is_some());
        assert!(json.get("messageCount").is_some());
        assert!(json.get("activeTasks").is_some());
    }
}
