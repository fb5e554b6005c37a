//! The transcript log tailer.
//!
//! Watches the log directory tree for `.jsonl` session transcripts and
//! feeds the registry: modified files are re-read from their session's
//! byte offset, removed files destroy their session. The notify callback
//! stays lightweight — it only filters paths and forwards events over an
//! internal channel to one async task, which owns the coalescing state and
//! all registry calls.
//!
//! Bursts of writes to the same file coalesce behind a quiet period
//! (latest-wins, default 200 ms); removals take effect immediately.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{
    event::{CreateKind, ModifyKind, RemoveKind},
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::error::{DaemonError, Result};
use crate::hook::is_valid_session_id;
use crate::registry::Registry;

/// Maximum directory depth below the watch root that is scanned on startup
/// (`<slug>/<session>.jsonl` is depth 1).
const SCAN_DEPTH: usize = 2;

/// Filesystem events after path filtering.
#[derive(Debug)]
enum FsEvent {
    /// The file was created or written to.
    Touched(PathBuf),
    /// The file was unlinked.
    Removed(PathBuf),
}

/// Owns the notify watcher and the coalescing task.
#[derive(Debug)]
pub struct LogTailer {
    /// Kept alive for the watch subscription; dropping it stops the tailer.
    #[allow(dead_code)]
    watcher: RecommendedWatcher,
    watch_dir: PathBuf,
}

impl LogTailer {
    /// Starts watching the configured log directory and ingests every
    /// existing transcript once (the bootstrap pass).
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be created or the watcher cannot be
    /// initialized; both are fatal at startup.
    pub async fn start(registry: Registry) -> Result<Self> {
        let watch_dir = registry.config().log_dir.clone();
        let coalesce_delay = registry.config().coalesce_delay;

        if !watch_dir.exists() {
            std::fs::create_dir_all(&watch_dir).map_err(DaemonError::Io)?;
        }

        let (tx, rx) = mpsc::channel::<FsEvent>(1024);
        let watcher = create_watcher(tx, watch_dir.clone())?;
        tokio::spawn(run_tailer(registry.clone(), rx, coalesce_delay));

        let existing = scan_log_tree(&watch_dir);
        info!(
            watch_dir = %watch_dir.display(),
            file_count = existing.len(),
            "log tailer started"
        );
        for path in existing {
            if let Some(session_id) = log_file_session_id(&path) {
                registry.ingest_log_file(&path, &session_id).await;
            }
        }

        Ok(Self { watcher, watch_dir })
    }

    /// The directory being watched.
    #[must_use]
    pub fn watch_dir(&self) -> &Path {
        &self.watch_dir
    }
}

/// Derives the session id from a transcript path. Returns `None` for
/// non-`.jsonl` files, ids outside `[A-Za-z0-9_-]+`, and sub-agent
/// sidechain files, which must never become sessions of their own.
#[must_use]
pub fn log_file_session_id(path: &Path) -> Option<String> {
    if path.extension()?.to_str()? != "jsonl" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if !is_valid_session_id(stem) || is_sidechain_stem(stem) {
        return None;
    }
    Some(stem.to_string())
}

/// Sidechain transcripts carry an `agent` marker in their filename.
fn is_sidechain_stem(stem: &str) -> bool {
    stem.starts_with("agent-") || stem.contains("-agent-")
}

/// Builds the notify watcher with a callback that only filters and
/// forwards.
fn create_watcher(tx: mpsc::Sender<FsEvent>, watch_dir: PathBuf) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| {
            forward_notify_event(result, &tx);
        },
        NotifyConfig::default(),
    )?;
    watcher.watch(&watch_dir, RecursiveMode::Recursive)?;
    debug!(watch_dir = %watch_dir.display(), "recursive watch started");
    Ok(watcher)
}

/// Notify callback body. Runs on the watcher thread; must not block.
fn forward_notify_event(
    result: std::result::Result<Event, notify::Error>,
    tx: &mpsc::Sender<FsEvent>,
) {
    let event = match result {
        Ok(event) => event,
        Err(err) => {
            error!(error = %err, "file watcher error");
            return;
        }
    };

    for path in &event.paths {
        if log_file_session_id(path).is_none() {
            continue;
        }
        let fs_event = match event.kind {
            EventKind::Create(CreateKind::File)
            | EventKind::Create(CreateKind::Any)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any) => Some(FsEvent::Touched(path.clone())),
            EventKind::Remove(RemoveKind::File) | EventKind::Remove(RemoveKind::Any) => {
                Some(FsEvent::Removed(path.clone()))
            }
            _ => {
                trace!(kind = ?event.kind, path = %path.display(), "ignoring event kind");
                None
            }
        };
        if let Some(fs_event) = fs_event {
            // try_send: losing a coalesced touch under backpressure is
            // recovered by the next write; blocking the watcher thread is
            // not recoverable.
            if let Err(err) = tx.try_send(fs_event) {
                warn!(error = %err, "tailer channel full, dropping event");
            }
        }
    }
}

/// The coalescing loop: touches wait out a quiet period (replacing any
/// pending deadline for the same file), removals act immediately.
async fn run_tailer(registry: Registry, mut rx: mpsc::Receiver<FsEvent>, delay: Duration) {
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        let next_deadline = pending.values().min().copied();

        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(FsEvent::Touched(path)) => {
                        pending.insert(path, Instant::now() + delay);
                    }
                    Some(FsEvent::Removed(path)) => {
                        pending.remove(&path);
                        if let Some(session_id) = log_file_session_id(&path) {
                            registry.remove_session_for_log(&session_id).await;
                        }
                    }
                    None => break,
                }
            }
            () = wait_until(next_deadline) => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    pending.remove(&path);
                    if let Some(session_id) = log_file_session_id(&path) {
                        registry.ingest_log_file(&path, &session_id).await;
                    }
                }
            }
        }
    }

    debug!("tailer loop terminated");
}

/// Sleeps until the deadline, or forever when there is none.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Collects existing transcripts up to [`SCAN_DEPTH`] below the root.
fn scan_log_tree(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    scan_dir(root, 0, &mut files);
    files.sort();
    files
}

fn scan_dir(dir: &Path, depth: usize, files: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "skipping unreadable directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if depth < SCAN_DEPTH {
                scan_dir(&path, depth + 1, files);
            }
        } else if log_file_session_id(&path).is_some() {
            files.push(path);
        }
    }
}
