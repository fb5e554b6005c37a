//! The session registry and its side-effect layer.
//!
//! The registry owns every [`Session`] record. Hook dispatch, permission
//! debounce callbacks, log-tail ingestion, and the stale check all funnel
//! through here, each serializing on the session's own mutex. The registry
//! map itself is guarded separately and only for membership changes.
//!
//! All machine transitions commit through [`Registry::apply_locked`]: it
//! calls the pure [`transition`] function, runs the on-exit side effects,
//! writes the audit line, and reconciles the task ledger (landing on
//! `working` while tasks are still running immediately escalates to
//! `tasking`). No other code decides what the next state is.
//!
//! Locking discipline: git probes, summarizer calls, and subscriber
//! delivery all happen outside any session mutex.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::audit::AuditLog;
use crate::broadcast::SnapshotPublisher;
use crate::config::Config;
use crate::gitinfo::GitProber;
use crate::hook::{HookEvent, IncomingHook};
use crate::machine::{transition, MachineEvent, MachineState};
use crate::parser::{self, ParsedEntry};
use crate::session::{ActiveTask, ActiveTool, PendingPermission, PermissionTimer, Session};
use crate::snapshot::Snapshot;
use crate::summarizer::{Summarizer, RECENT_ENTRY_LIMIT};

/// The `SessionEnd` reason that is honored even while `waiting`.
const PROMPT_INPUT_EXIT: &str = "prompt_input_exit";

/// How many trailing bytes of a transcript feed the summarizer.
const RECENT_TAIL_BYTES: u64 = 64 * 1024;

/// Process-wide session registry. Cheap to clone; all clones share state.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: Config,
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    publisher: SnapshotPublisher,
    audit: AuditLog,
    git: GitProber,
    summarizer: Option<Summarizer>,
    timer_seq: AtomicU64,
}

impl Registry {
    /// Creates the registry and its collaborators from the configuration.
    /// Must run inside a tokio runtime (the audit writer task is spawned
    /// here).
    #[must_use]
    pub fn new(config: Config) -> Self {
        let audit = AuditLog::new(config.audit_dir());
        let git = GitProber::new(config.repo_cache_path());
        let summarizer = config.summarizer_url.clone().map(Summarizer::new);
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: RwLock::new(HashMap::new()),
                publisher: SnapshotPublisher::new(),
                audit,
                git,
                summarizer,
                timer_seq: AtomicU64::new(0),
            }),
        }
    }

    /// The snapshot publisher, for subscribing and health reporting.
    #[must_use]
    pub fn publisher(&self) -> &SnapshotPublisher {
        &self.inner.publisher
    }

    /// The daemon configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The audit log handle (the log server reads files through it).
    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.inner.audit
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Current snapshot of one session, if it exists. Mainly for tests and
    /// the health endpoint.
    pub async fn snapshot_of(&self, session_id: &str) -> Option<Snapshot> {
        let arc = self.get_session(session_id).await?;
        let session = arc.lock().await;
        Some(Snapshot::from_session(&session))
    }

    // ------------------------------------------------------------------
    // Hook dispatch
    // ------------------------------------------------------------------

    /// Dispatches one validated hook. Per-session errors are swallowed
    /// here; nothing a single hook does can fail the daemon.
    pub async fn handle_hook(&self, hook: IncomingHook) {
        self.inner
            .audit
            .append(&hook.session_id, format!("[hook] {}", hook.name.as_str()));

        let session_id = hook.session_id;
        match hook.event {
            HookEvent::UserPromptSubmit {
                transcript_path,
                cwd,
                prompt,
            } => {
                self.on_prompt_submit(session_id, transcript_path, cwd, prompt)
                    .await;
            }
            HookEvent::PermissionRequest {
                tool_name,
                tool_use_id,
                tool_input,
            } => {
                self.on_permission_request(&session_id, tool_name, tool_use_id, tool_input)
                    .await;
            }
            HookEvent::PreToolUse {
                tool_name,
                tool_use_id,
                tool_input,
            } => {
                self.on_pre_tool_use(&session_id, tool_name, tool_use_id, tool_input)
                    .await;
            }
            HookEvent::PostToolUse { tool_use_id, .. } => {
                self.on_post_tool_use(&session_id, tool_use_id).await;
            }
            HookEvent::PostToolUseFailure { tool_use_id, .. } => {
                self.on_post_tool_use(&session_id, tool_use_id).await;
            }
            HookEvent::Stop => self.on_stop(&session_id).await,
            HookEvent::SessionEnd { reason } => self.on_session_end(&session_id, reason).await,
            HookEvent::PreCompact => self.on_pre_compact(&session_id).await,
            HookEvent::LoggingOnly => {}
        }
    }

    async fn on_prompt_submit(
        &self,
        session_id: String,
        transcript_path: Option<String>,
        cwd: Option<String>,
        prompt: Option<String>,
    ) {
        if let Some(arc) = self.get_session(&session_id).await {
            {
                let mut session = arc.lock().await;
                session.last_activity_at = Some(Utc::now());
                if session.original_prompt.is_none() {
                    session.original_prompt = prompt;
                }
                if session.cwd.is_none() {
                    session.cwd = cwd;
                }
                if session.log_file_path.is_none() {
                    session.log_file_path = transcript_path;
                }
                self.apply_locked(&mut session, MachineEvent::Working, "hook");
                self.publish(&session);
            }
            self.maybe_summarize(&session_id).await;
            return;
        }

        // New session: probe git before taking any lock.
        let git = match cwd.as_deref() {
            Some(cwd) => self.inner.git.probe(Path::new(cwd)).await,
            None => None,
        };

        let now = Utc::now();
        let mut session = Session::from_hook(session_id.clone(), transcript_path, cwd, prompt, now);
        session.git = git;

        let arc = Arc::new(Mutex::new(session));
        let raced = {
            let mut sessions = self.inner.sessions.write().await;
            if let Some(existing) = sessions.get(&session_id) {
                Some(Arc::clone(existing))
            } else {
                sessions.insert(session_id.clone(), Arc::clone(&arc));
                None
            }
        };
        if let Some(existing) = raced {
            // Lost a creation race; treat the hook as activity instead.
            let mut current = existing.lock().await;
            self.apply_locked(&mut current, MachineEvent::Working, "hook");
            self.publish(&current);
            return;
        }

        self.inner.audit.append(&session_id, "[init] working");
        info!(session_id = %session_id, "session created from hook");
        {
            let session = arc.lock().await;
            self.publish(&session);
        }
        self.maybe_summarize(&session_id).await;
    }

    async fn on_permission_request(
        &self,
        session_id: &str,
        tool_name: String,
        tool_use_id: Option<String>,
        tool_input: Option<Value>,
    ) {
        let Some(arc) = self.get_session(session_id).await else {
            return;
        };
        let mut session = arc.lock().await;

        let resolved = tool_use_id.or_else(|| session.youngest_active_tool(&tool_name));

        // Replace any previously armed debounce: at most one outstanding.
        session.cancel_permission_timer();

        let seq = self.inner.timer_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = self.inner.config.permission_delay;
        let registry = self.clone();
        let sid = session_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.permission_elapsed(&sid, seq).await;
        });

        trace!(
            session_id,
            tool = %tool_name,
            tool_use_id = ?resolved,
            delay_ms = delay.as_millis() as u64,
            "armed permission debounce"
        );
        session.permission_timer = Some(PermissionTimer {
            seq,
            tool_use_id: resolved,
            tool_name,
            tool_input,
            requested_at: Utc::now(),
            handle,
        });
    }

    /// Timer callback: the permission request survived its debounce.
    async fn permission_elapsed(&self, session_id: &str, seq: u64) {
        let Some(arc) = self.get_session(session_id).await else {
            return;
        };
        let mut session = arc.lock().await;

        // A mismatched generation means this timer was replaced or cancelled
        // while the callback was already scheduled.
        if session.permission_timer.as_ref().map(|t| t.seq) != Some(seq) {
            return;
        }
        let Some(timer) = session.permission_timer.take() else {
            return;
        };

        session.pending_permission = Some(PendingPermission {
            tool_name: timer.tool_name,
            tool_input: timer.tool_input,
            requested_at: timer.requested_at,
        });
        self.apply_locked(&mut session, MachineEvent::PermissionRequest, "debounce");
        if session.machine_state != MachineState::NeedsApproval {
            // The machine absorbed the event (e.g. parked in review); a
            // pending permission must only exist in needs_approval.
            session.pending_permission = None;
        }
        self.publish(&session);
    }

    async fn on_pre_tool_use(
        &self,
        session_id: &str,
        tool_name: String,
        tool_use_id: Option<String>,
        tool_input: Option<Value>,
    ) {
        let Some(arc) = self.get_session(session_id).await else {
            return;
        };
        let mut session = arc.lock().await;

        if let Some(id) = tool_use_id {
            let now = Utc::now();
            let is_task = tool_name == "Task";
            session.active_tools.insert(
                id.clone(),
                ActiveTool {
                    tool_name,
                    tool_input: tool_input.clone(),
                    started_at: now,
                },
            );
            if is_task {
                let (agent_type, description) = task_fields(tool_input.as_ref());
                session.active_tasks.insert(
                    id,
                    ActiveTask {
                        agent_type,
                        description,
                        started_at: now,
                    },
                );
                self.apply_locked(&mut session, MachineEvent::TaskStarted, "hook");
            }
        }

        self.publish(&session);
    }

    async fn on_post_tool_use(&self, session_id: &str, tool_use_id: Option<String>) {
        let Some(arc) = self.get_session(session_id).await else {
            return;
        };
        let mut session = arc.lock().await;

        // Selective cancel: only when the armed debounce resolved to no
        // tool-use id, or to exactly this one. A sibling tool completing
        // must not cancel another tool's permission debounce.
        let cancels = match (&session.permission_timer, &tool_use_id) {
            (Some(timer), _) if timer.tool_use_id.is_none() => true,
            (Some(timer), Some(id)) => timer.tool_use_id.as_deref() == Some(id.as_str()),
            _ => false,
        };
        if cancels {
            session.cancel_permission_timer();
        }

        if session.machine_state == MachineState::NeedsApproval {
            self.apply_locked(&mut session, MachineEvent::Working, "hook");
        }

        if let Some(id) = tool_use_id {
            let removed = session.active_tools.remove(&id);
            let was_task = removed
                .as_ref()
                .is_some_and(|tool| tool.tool_name == "Task")
                || session.active_tasks.contains_key(&id);
            if was_task {
                session.active_tasks.remove(&id);
                if session.active_tasks.is_empty() {
                    self.apply_locked(&mut session, MachineEvent::TasksDone, "hook");
                }
            }
        }

        self.publish(&session);
    }

    async fn on_stop(&self, session_id: &str) {
        let Some(arc) = self.get_session(session_id).await else {
            return;
        };
        let mut session = arc.lock().await;
        session.cancel_permission_timer();
        session.compacting_since = None;
        self.apply_locked(&mut session, MachineEvent::Stop, "hook");
        self.publish(&session);
    }

    async fn on_session_end(&self, session_id: &str, reason: Option<String>) {
        let Some(arc) = self.get_session(session_id).await else {
            return;
        };
        let mut session = arc.lock().await;

        // A resumed editor session sends SessionEnd with its own reason
        // while the machine is already waiting; honoring it would collapse
        // the session to idle. A bare SessionEnd and an explicit prompt
        // input exit are honored.
        if session.machine_state == MachineState::Waiting {
            if let Some(reason) = reason.as_deref() {
                if reason != PROMPT_INPUT_EXIT {
                    debug!(session_id, reason, "ignoring SessionEnd while waiting");
                    return;
                }
            }
        }

        session.cancel_permission_timer();
        self.apply_locked(&mut session, MachineEvent::Ended, "hook");
        self.publish(&session);
    }

    async fn on_pre_compact(&self, session_id: &str) {
        let Some(arc) = self.get_session(session_id).await else {
            return;
        };
        let mut session = arc.lock().await;
        session.compacting_since = Some(Utc::now());
        self.publish(&session);
    }

    // ------------------------------------------------------------------
    // Transition commit
    // ------------------------------------------------------------------

    /// Commits machine events for a locked session. Returns true when the
    /// state changed.
    ///
    /// On-exit effects: leaving the active region cancels the permission
    /// debounce; leaving `needs_approval` clears the pending permission.
    /// After landing on `working` with a non-empty task ledger, the ledger
    /// wins and a `TASK_STARTED` is applied in the same commit.
    fn apply_locked(&self, session: &mut Session, event: MachineEvent, source: &str) -> bool {
        let mut changed = false;
        let mut queued = Some(event);

        while let Some(event) = queued.take() {
            let prev = session.machine_state;
            let next = transition(prev, event, session.is_worktree());
            if next == prev {
                break;
            }

            if prev.is_active() && !next.is_active() {
                session.cancel_permission_timer();
            }
            if prev == MachineState::NeedsApproval && next != MachineState::NeedsApproval {
                session.pending_permission = None;
            }

            session.machine_state = next;
            changed = true;

            debug!(
                session_id = %session.session_id,
                from = prev.as_str(),
                to = next.as_str(),
                event = event.as_str(),
                source,
                "state transition"
            );
            self.inner.audit.append(
                &session.session_id,
                format!(
                    "{} -> {} event:{} source:{}",
                    prev.as_str(),
                    next.as_str(),
                    event.as_str(),
                    source
                ),
            );

            // Reconciliation: hooks can land a session on `working` while
            // sub-agents are still running.
            if next == MachineState::Working && !session.active_tasks.is_empty() {
                queued = Some(MachineEvent::TaskStarted);
            }
        }

        changed
    }

    fn publish(&self, session: &Session) {
        self.inner.publisher.upsert(Snapshot::from_session(session));
    }

    async fn get_session(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.inner.sessions.read().await.get(session_id).cloned()
    }

    // ------------------------------------------------------------------
    // Log tail ingestion
    // ------------------------------------------------------------------

    /// Ingests new bytes of one transcript file. Creates the session if no
    /// hook has ever mentioned it (bootstrap path). Content parsing updates
    /// metadata only; it never drives transitions.
    pub async fn ingest_log_file(&self, path: &Path, session_id: &str) {
        let arc = match self.get_session(session_id).await {
            Some(arc) => arc,
            None => {
                if !path.exists() {
                    return;
                }
                let session = Session::from_log_file(
                    session_id.to_string(),
                    path.to_string_lossy().to_string(),
                    Utc::now(),
                );
                let arc = Arc::new(Mutex::new(session));
                let raced = {
                    let mut sessions = self.inner.sessions.write().await;
                    if let Some(existing) = sessions.get(session_id) {
                        Some(Arc::clone(existing))
                    } else {
                        sessions.insert(session_id.to_string(), Arc::clone(&arc));
                        None
                    }
                };
                match raced {
                    Some(existing) => existing,
                    None => {
                        self.inner.audit.append(session_id, "[init] waiting");
                        info!(session_id, path = %path.display(), "session bootstrapped from log");
                        arc
                    }
                }
            }
        };

        let (cwd_for_git, needs_git) = {
            let mut session = arc.lock().await;
            if session.log_file_path.is_none() {
                session.log_file_path = Some(path.to_string_lossy().to_string());
            }

            match read_new_entries(path, session.log_tail_offset).await {
                Ok((entries, new_offset)) => {
                    for entry in &entries {
                        apply_entry(&mut session, entry);
                    }
                    debug_assert!(new_offset >= session.log_tail_offset);
                    session.log_tail_offset = new_offset;
                }
                Err(err) => {
                    // The file may have been unlinked between the event and
                    // the read; the session keeps its last known metadata.
                    warn!(path = %path.display(), error = %err, "transcript read failed");
                }
            }

            self.publish(&session);
            (
                session.cwd.clone(),
                session.git.is_none() && session.cwd.is_some(),
            )
        };

        if needs_git {
            if let Some(cwd) = cwd_for_git {
                if let Some(info) = self.inner.git.probe(Path::new(&cwd)).await {
                    let mut session = arc.lock().await;
                    session.git = Some(info);
                    self.publish(&session);
                }
            }
        }

        self.maybe_summarize(session_id).await;
    }

    /// Handles a transcript unlink: the session is destroyed and a single
    /// `delete` is published.
    pub async fn remove_session_for_log(&self, session_id: &str) {
        let removed = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.remove(session_id)
        };
        if let Some(arc) = removed {
            {
                let mut session = arc.lock().await;
                session.cancel_permission_timer();
            }
            self.inner.publisher.remove(session_id);
            info!(session_id, "session removed (log file deleted)");
        }
    }

    // ------------------------------------------------------------------
    // Stale check
    // ------------------------------------------------------------------

    /// Spawns the global periodic stale check.
    pub fn spawn_stale_check(&self) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.inner.config.stale_check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                registry.run_stale_check().await;
            }
        })
    }

    /// One pass of the stale check. Public so tests can drive it directly.
    ///
    /// `working` sessions silent beyond the threshold are stopped;
    /// `tasking` is exempt because sub-agents legitimately keep the primary
    /// session silent. `review` sessions whose worktree directory vanished
    /// move to `idle`.
    pub async fn run_stale_check(&self) {
        let sessions: Vec<(String, Arc<Mutex<Session>>)> = {
            let map = self.inner.sessions.read().await;
            map.iter()
                .map(|(id, arc)| (id.clone(), Arc::clone(arc)))
                .collect()
        };
        let threshold = chrono::Duration::from_std(self.inner.config.stale_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        for (session_id, arc) in sessions {
            let mut session = arc.lock().await;
            match session.machine_state {
                MachineState::Working => {
                    let last = session.last_activity_at.unwrap_or(session.started_at);
                    if Utc::now() - last > threshold {
                        info!(session_id = %session_id, "working session went silent, stopping");
                        if self.apply_locked(&mut session, MachineEvent::Stop, "stale-check") {
                            self.publish(&session);
                        }
                    }
                }
                MachineState::Review => {
                    let gone = session
                        .git
                        .as_ref()
                        .and_then(|g| g.worktree_root.as_deref())
                        .is_some_and(|root| !Path::new(root).is_dir());
                    if gone {
                        info!(session_id = %session_id, "worktree vanished, idling session");
                        if self.apply_locked(
                            &mut session,
                            MachineEvent::WorktreeDeleted,
                            "stale-check",
                        ) {
                            self.publish(&session);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Summarizer coupling
    // ------------------------------------------------------------------

    /// Kicks off a summarizer call for the session unless one is already in
    /// flight. Runs entirely outside the session mutex.
    async fn maybe_summarize(&self, session_id: &str) {
        let Some(summarizer) = self.inner.summarizer.clone() else {
            return;
        };
        let Some(arc) = self.get_session(session_id).await else {
            return;
        };

        let (prompt, log_path) = {
            let mut session = arc.lock().await;
            if session.summarize_in_flight {
                return;
            }
            let Some(prompt) = session.original_prompt.clone() else {
                return;
            };
            session.summarize_in_flight = true;
            (prompt, session.log_file_path.clone())
        };

        let registry = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let recent = match &log_path {
                Some(path) => recent_lines(Path::new(path)).await,
                None => Vec::new(),
            };
            let result = summarizer.summarize(&session_id, &prompt, &recent).await;
            registry.apply_summary(&session_id, result).await;
        });
    }

    async fn apply_summary(
        &self,
        session_id: &str,
        result: Result<crate::summarizer::SummaryOutcome, crate::summarizer::SummarizerError>,
    ) {
        let Some(arc) = self.get_session(session_id).await else {
            return;
        };
        let mut session = arc.lock().await;
        session.summarize_in_flight = false;
        match result {
            Ok(outcome) => {
                if outcome.goal.is_some() {
                    session.goal = outcome.goal;
                }
                if outcome.summary.is_some() {
                    session.summary = outcome.summary;
                }
                self.publish(&session);
            }
            Err(err) => {
                warn!(session_id, error = %err, "summarizer call failed");
            }
        }
    }
}

/// Pulls `subagentType` and `description` out of a Task tool input.
fn task_fields(tool_input: Option<&Value>) -> (String, String) {
    let agent_type = tool_input
        .and_then(|input| input.get("subagentType"))
        .and_then(Value::as_str)
        .unwrap_or("Task")
        .to_string();
    let description = tool_input
        .and_then(|input| input.get("description"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    (agent_type, description)
}

/// Applies one parsed transcript entry to the session's content metadata.
fn apply_entry(session: &mut Session, entry: &ParsedEntry) {
    if let Some(ts) = entry.timestamp {
        session.last_activity_at = Some(ts);
    }
    if entry.counts_as_message {
        session.message_count += 1;
    }
    if let Some(todos) = entry.todos {
        session.todo_progress = Some(todos);
    }
    if session.original_prompt.is_none() {
        if let Some(text) = &entry.user_text {
            session.original_prompt = Some(text.clone());
        }
    }
    if session.cwd.is_none() {
        if let Some(cwd) = &entry.cwd {
            session.cwd = Some(cwd.clone());
        }
    }
}

/// Reads and parses `[offset, EOF)` of a transcript. Returns the parsed
/// entries and the new offset, which only advances over complete lines; a
/// trailing partial line is left for the next pass. An unparseable complete
/// line is consumed with a warning so the tail cannot wedge.
async fn read_new_entries(path: &Path, offset: u64) -> std::io::Result<(Vec<ParsedEntry>, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();

    if size < offset {
        // Transcripts are append-only; a shrinking file means something
        // rewrote it. The offset stays monotone and the tail waits for the
        // file to grow past it again.
        warn!(path = %path.display(), offset, size, "transcript shrank, holding offset");
        return Ok((Vec::new(), offset));
    }
    if size == offset {
        return Ok((Vec::new(), offset));
    }

    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity((size - offset) as usize);
    file.take(size - offset).read_to_end(&mut buf).await?;

    let mut consumed = 0u64;
    let mut entries = Vec::new();
    for chunk in buf.split_inclusive(|b| *b == b'\n') {
        if chunk.last() != Some(&b'\n') {
            break;
        }
        consumed += chunk.len() as u64;
        let line = String::from_utf8_lossy(chunk);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parser::parse_line(line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping malformed transcript line");
            }
        }
    }

    Ok((entries, offset + consumed))
}

/// Reads the last few complete lines of a transcript for the summarizer.
async fn recent_lines(path: &Path) -> Vec<String> {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return Vec::new();
    };
    let Ok(meta) = file.metadata().await else {
        return Vec::new();
    };
    let size = meta.len();
    let start = size.saturating_sub(RECENT_TAIL_BYTES);
    if file.seek(std::io::SeekFrom::Start(start)).await.is_err() {
        return Vec::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).await.is_err() {
        return Vec::new();
    }
    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<String> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect();
    if start > 0 && !lines.is_empty() {
        // The first line is almost certainly cut mid-record.
        lines.remove(0);
    }
    let keep = lines.len().saturating_sub(RECENT_ENTRY_LIMIT);
    lines.split_off(keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn test_registry(dir: &TempDir) -> Registry {
        let config = Config::for_dirs(
            dir.path().join("logs-tree"),
            dir.path().join("data"),
        );
        Registry::new(config)
    }

    fn prompt_hook(sid: &str) -> IncomingHook {
        IncomingHook {
            session_id: sid.to_string(),
            name: crate::hook::HookEventName::UserPromptSubmit,
            event: HookEvent::UserPromptSubmit {
                transcript_path: None,
                cwd: None,
                prompt: Some("do the thing".to_string()),
            },
        }
    }

    #[tokio::test]
    async fn task_fields_read_subagent_type_and_description() {
        let input = serde_json::json!({"subagentType": "Explore", "description": "scan files"});
        let (agent, desc) = task_fields(Some(&input));
        assert_eq!(agent, "Explore");
        assert_eq!(desc, "scan files");

        let (agent, desc) = task_fields(None);
        assert_eq!(agent, "Task");
        assert_eq!(desc, "");
    }

    #[tokio::test]
    async fn prompt_submit_creates_session_working() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(&dir);
        registry.handle_hook(prompt_hook("s1")).await;

        let snap = registry.snapshot_of("s1").await.unwrap();
        assert_eq!(snap.status, crate::machine::PublishedStatus::Working);
        assert_eq!(snap.original_prompt.as_deref(), Some("do the thing"));
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn hooks_for_unknown_sessions_are_ignored() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(&dir);
        registry
            .handle_hook(IncomingHook {
                session_id: "ghost".to_string(),
                name: crate::hook::HookEventName::Stop,
                event: HookEvent::Stop,
            })
            .await;
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn read_new_entries_leaves_partial_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.jsonl");
        let complete = r#"{"type":"user","message":{"content":"hi"}}"#;
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{complete}").unwrap();
        write!(file, r#"{{"type":"assistant""#).unwrap();
        drop(file);

        let (entries, offset) = read_new_entries(&path, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(offset, complete.len() as u64 + 1);

        // Nothing new: the partial tail stays unconsumed.
        let (entries, offset2) = read_new_entries(&path, offset).await.unwrap();
        assert!(entries.is_empty());
        assert_eq!(offset2, offset);
    }

    #[tokio::test]
    async fn read_new_entries_holds_offset_on_shrink() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, "{\"type\":\"user\",\"message\":{\"content\":\"x\"}}\n").unwrap();
        let (_, offset) = read_new_entries(&path, 0).await.unwrap();
        std::fs::write(&path, "").unwrap();
        let (entries, held) = read_new_entries(&path, offset).await.unwrap();
        assert!(entries.is_empty());
        assert_eq!(held, offset);
    }

    #[tokio::test]
    async fn malformed_lines_are_consumed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, "not json at all\n{\"type\":\"user\",\"message\":{\"content\":\"ok\"}}\n")
            .unwrap();
        let (entries, offset) = read_new_entries(&path, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(offset, std::fs::metadata(&path).unwrap().len());
    }
}
