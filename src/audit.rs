//! Per-session audit logs.
//!
//! Every accepted hook and every committed transition appends one line to
//! `<data_dir>/logs/<sessionId>.log`. Appends are fire-and-forget: they flow
//! through an unbounded channel into a single writer task, which keeps
//! per-session ordering while the hook path never waits on disk. Write
//! failures are logged and dropped — losing audit lines is acceptable,
//! stalling ingest is not.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Handle for appending audit lines.
#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
    tx: mpsc::UnboundedSender<(String, String)>,
}

impl AuditLog {
    /// Creates the audit log rooted at `dir` and spawns its writer task.
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        if let Err(err) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %err, "Failed to create audit log directory");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let writer_dir = dir.clone();
        tokio::spawn(async move {
            run_writer(writer_dir, rx).await;
        });

        Self { dir, tx }
    }

    /// Queues one line for the session's audit file. Never blocks.
    pub fn append(&self, session_id: &str, line: impl Into<String>) {
        // Send fails only after the writer task died; nothing to do then.
        let _ = self.tx.send((session_id.to_string(), line.into()));
    }

    /// Path of a session's audit file. Callers must have validated the id
    /// (see [`crate::hook::is_valid_session_id`]).
    #[must_use]
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.log"))
    }
}

/// Drains the append queue sequentially, preserving order.
async fn run_writer(dir: PathBuf, mut rx: mpsc::UnboundedReceiver<(String, String)>) {
    while let Some((session_id, line)) = rx.recv().await {
        let path = dir.join(format!("{session_id}.log"));
        if let Err(err) = append_line(&path, &line).await {
            warn!(path = %path.display(), error = %err, "Audit append failed");
        }
    }
    debug!("Audit writer shutting down");
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Polls until the audit file holds the expected content.
    async fn wait_for_content(path: &Path, expected: &str) -> String {
        for _ in 0..100 {
            if let Ok(content) = tokio::fs::read_to_string(path).await {
                if content == expected {
                    return content;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::fs::read_to_string(path).await.unwrap_or_default()
    }

    #[tokio::test]
    async fn appends_preserve_order() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::new(dir.path().to_path_buf());

        audit.append("s1", "[init] working");
        audit.append("s1", "[hook] Stop");
        audit.append("s1", "working -> waiting event:STOP source:hook");

        let expected = "[init] working\n[hook] Stop\nworking -> waiting event:STOP source:hook\n";
        let content = wait_for_content(&audit.path_for("s1"), expected).await;
        assert_eq!(content, expected);
    }

    #[tokio::test]
    async fn sessions_get_separate_files() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::new(dir.path().to_path_buf());

        audit.append("alpha", "[init] working");
        audit.append("beta", "[init] waiting");

        let a = wait_for_content(&audit.path_for("alpha"), "[init] working\n").await;
        let b = wait_for_content(&audit.path_for("beta"), "[init] waiting\n").await;
        assert_eq!(a, "[init] working\n");
        assert_eq!(b, "[init] waiting\n");
    }

    #[test]
    fn path_for_stays_inside_dir() {
        let dir = TempDir::new().unwrap();
        // Construction needs a runtime for the writer task.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let audit = AuditLog::new(dir.path().to_path_buf());
        let path = audit.path_for("abc-DEF_123");
        assert!(path.starts_with(dir.path()));
        assert_eq!(path.extension().unwrap(), "log");
    }
}
