//! The session state machine.
//!
//! [`transition`] is the single piece of state-selection logic in the
//! daemon: a pure, total function from `(state, event, is_worktree)` to the
//! next state. Everything else — timers, ledgers, hook dispatch — only
//! decides *which* events to feed it.
//!
//! # States
//!
//! | State | Meaning |
//! |-------|---------|
//! | `working` | The agent is actively processing a turn |
//! | `tasking` | One or more sub-agent tasks (or a compaction) are running |
//! | `needs_approval` | A permission request survived its debounce |
//! | `waiting` | The turn ended; the agent waits for the user |
//! | `review` | A worktree session stopped; its work is reviewable |
//! | `idle` | The session ended (or its worktree vanished) |
//!
//! `needs_approval` is internal only: it publishes as `waiting` with the
//! pending-tool flag set.
//!
//! # Worktree asymmetry
//!
//! Worktree sessions never reach `idle` through `STOP`/`ENDED` — they park
//! in `review` until the worktree itself disappears. A checked-out worktree
//! with unreviewed work should stay visible even after its session ends.

use serde::{Deserialize, Serialize};

/// Internal machine state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Working,
    Tasking,
    NeedsApproval,
    Waiting,
    Review,
    Idle,
}

impl MachineState {
    /// Returns the snake_case string representation of this state, as it
    /// appears in audit log lines.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Working => "working",
            MachineState::Tasking => "tasking",
            MachineState::NeedsApproval => "needs_approval",
            MachineState::Waiting => "waiting",
            MachineState::Review => "review",
            MachineState::Idle => "idle",
        }
    }

    /// Maps the internal state to its published status.
    ///
    /// `needs_approval` is absorbed into `waiting`; the pending-tool flag
    /// carries the distinction (see [`MachineState::has_pending_tool_use`]).
    #[must_use]
    pub fn published(&self) -> PublishedStatus {
        match self {
            MachineState::Working => PublishedStatus::Working,
            MachineState::Tasking => PublishedStatus::Tasking,
            MachineState::NeedsApproval | MachineState::Waiting => PublishedStatus::Waiting,
            MachineState::Review => PublishedStatus::Review,
            MachineState::Idle => PublishedStatus::Idle,
        }
    }

    /// True iff the published snapshot must carry `hasPendingToolUse`.
    #[must_use]
    pub fn has_pending_tool_use(&self) -> bool {
        matches!(self, MachineState::NeedsApproval)
    }

    /// True iff the state is in the active region `{working, tasking,
    /// needs_approval}`. Leaving this region invalidates any pending
    /// permission debounce.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            MachineState::Working | MachineState::Tasking | MachineState::NeedsApproval
        )
    }
}

/// Externally visible session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishedStatus {
    Working,
    Tasking,
    Waiting,
    Review,
    Idle,
}

impl PublishedStatus {
    /// Returns the snake_case string representation of this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishedStatus::Working => "working",
            PublishedStatus::Tasking => "tasking",
            PublishedStatus::Waiting => "waiting",
            PublishedStatus::Review => "review",
            PublishedStatus::Idle => "idle",
        }
    }
}

/// Events consumed by the transition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineEvent {
    /// The agent produced activity (prompt submitted, tool resumed).
    Working,
    /// The turn ended.
    Stop,
    /// The session ended.
    Ended,
    /// A permission request survived its debounce.
    PermissionRequest,
    /// The session's worktree directory no longer exists.
    WorktreeDeleted,
    /// A sub-agent task started.
    TaskStarted,
    /// The last sub-agent task finished.
    TasksDone,
}

impl MachineEvent {
    /// Returns the SCREAMING_SNAKE_CASE event name used in audit log lines.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineEvent::Working => "WORKING",
            MachineEvent::Stop => "STOP",
            MachineEvent::Ended => "ENDED",
            MachineEvent::PermissionRequest => "PERMISSION_REQUEST",
            MachineEvent::WorktreeDeleted => "WORKTREE_DELETED",
            MachineEvent::TaskStarted => "TASK_STARTED",
            MachineEvent::TasksDone => "TASKS_DONE",
        }
    }
}

/// Computes the next state for a session.
///
/// Pure and total: no I/O, no clock, no hidden inputs. Unlisted
/// `(state, event)` pairs keep the current state.
///
/// | from \ event | WORKING | STOP | ENDED | PERM_REQ | TASK_STARTED | TASKS_DONE | WT_DELETED |
/// |---|---|---|---|---|---|---|---|
/// | working | · | review/waiting | review/idle | needs_approval | tasking | · | · |
/// | tasking | · | review/waiting | review/idle | needs_approval | · | working | · |
/// | needs_approval | working | review/waiting | review/idle | · | · | · | · |
/// | waiting | working | · | review/idle | needs_approval | · | · | · |
/// | review | working | · | · | · | · | · | idle |
/// | idle | working | · | · | · | · | · | · |
///
/// (`a/b` reads: `a` when `is_worktree`, else `b`.)
#[must_use]
pub fn transition(state: MachineState, event: MachineEvent, is_worktree: bool) -> MachineState {
    use MachineEvent as E;
    use MachineState as S;

    let parked = if is_worktree { S::Review } else { S::Waiting };
    let ended = if is_worktree { S::Review } else { S::Idle };

    match (state, event) {
        (S::Working, E::Stop) => parked,
        (S::Working, E::Ended) => ended,
        (S::Working, E::PermissionRequest) => S::NeedsApproval,
        (S::Working, E::TaskStarted) => S::Tasking,

        (S::Tasking, E::Stop) => parked,
        (S::Tasking, E::Ended) => ended,
        (S::Tasking, E::PermissionRequest) => S::NeedsApproval,
        (S::Tasking, E::TasksDone) => S::Working,

        (S::NeedsApproval, E::Working) => S::Working,
        (S::NeedsApproval, E::Stop) => parked,
        (S::NeedsApproval, E::Ended) => ended,

        (S::Waiting, E::Working) => S::Working,
        (S::Waiting, E::Ended) => ended,
        (S::Waiting, E::PermissionRequest) => S::NeedsApproval,

        (S::Review, E::Working) => S::Working,
        (S::Review, E::WorktreeDeleted) => S::Idle,

        (S::Idle, E::Working) => S::Working,

        (state, _) => state,
    }
}
