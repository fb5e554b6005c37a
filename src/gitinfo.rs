//! Git metadata probing.
//!
//! Resolves a session's working directory to repository metadata by shelling
//! out to `git`. Two caches sit in front of the probe:
//!
//! - an in-memory cache with a short TTL, so a burst of hooks for the same
//!   cwd does not trigger a filesystem-walk storm;
//! - a persistent JSON cache on disk, so sessions whose worktree has been
//!   deleted can still be grouped under their repository root. Reads
//!   tolerate a missing or corrupt file; writes are fire-and-forget.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// How long an in-memory probe result stays fresh.
const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Repository metadata for one working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitInfo {
    /// Root of the repository (the shared root for worktrees).
    pub repo_root_path: Option<String>,
    /// `remote.origin.url`, when configured.
    pub repo_url: Option<String>,
    /// Stable identifier derived from the remote URL or the root path.
    pub repo_id: Option<String>,
    /// Current branch; `None` on detached HEAD.
    pub branch: Option<String>,
    /// Whether the cwd is a linked worktree.
    #[serde(default)]
    pub is_worktree: bool,
    /// Root of the worktree checkout, when `is_worktree`.
    pub worktree_root: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedProbe {
    at: Instant,
    info: Option<GitInfo>,
}

/// Probes working directories for git metadata.
#[derive(Debug)]
pub struct GitProber {
    ttl: Duration,
    memory: Mutex<HashMap<PathBuf, CachedProbe>>,
    disk_path: PathBuf,
    disk: Mutex<HashMap<String, GitInfo>>,
}

impl GitProber {
    /// Creates a prober backed by the persistent cache at `disk_path`. The
    /// cache is loaded eagerly; a missing or corrupt file is an empty cache.
    #[must_use]
    pub fn new(disk_path: PathBuf) -> Self {
        let disk = load_disk_cache(&disk_path);
        Self {
            ttl: DEFAULT_TTL,
            memory: Mutex::new(HashMap::new()),
            disk_path,
            disk: Mutex::new(disk),
        }
    }

    /// Resolves metadata for `cwd`.
    ///
    /// Returns `None` when the directory is not inside a git repository and
    /// the persistent cache has never seen it either. Never holds any
    /// session lock; callers probe before locking.
    pub async fn probe(&self, cwd: &Path) -> Option<GitInfo> {
        {
            let memory = self.memory.lock().await;
            if let Some(cached) = memory.get(cwd) {
                if cached.at.elapsed() < self.ttl {
                    trace!(cwd = %cwd.display(), "git probe cache hit");
                    return cached.info.clone();
                }
            }
        }

        let probed = probe_git(cwd).await;

        let info = match probed {
            Some(info) => {
                self.remember(cwd, &info).await;
                Some(info)
            }
            None => {
                // The directory may be a deleted worktree; fall back to the
                // persistent cache so the session keeps its repo grouping.
                let disk = self.disk.lock().await;
                disk.get(&cwd.to_string_lossy().to_string()).cloned()
            }
        };

        let mut memory = self.memory.lock().await;
        memory.insert(
            cwd.to_path_buf(),
            CachedProbe {
                at: Instant::now(),
                info: info.clone(),
            },
        );
        info
    }

    /// Records a successful probe in the persistent cache and schedules a
    /// best-effort write-back.
    async fn remember(&self, cwd: &Path, info: &GitInfo) {
        let snapshot = {
            let mut disk = self.disk.lock().await;
            disk.insert(cwd.to_string_lossy().to_string(), info.clone());
            disk.clone()
        };
        let path = self.disk_path.clone();
        tokio::spawn(async move {
            if let Err(err) = write_disk_cache(&path, &snapshot).await {
                warn!(path = %path.display(), error = %err, "Failed to persist repo cache");
            }
        });
    }
}

/// Loads the persistent cache, treating any failure as empty.
fn load_disk_cache(path: &Path) -> HashMap<String, GitInfo> {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(map) => map,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Corrupt repo cache, starting empty");
                HashMap::new()
            }
        },
        Err(_) => HashMap::new(),
    }
}

async fn write_disk_cache(
    path: &Path,
    cache: &HashMap<String, GitInfo>,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(cache).unwrap_or_default();
    tokio::fs::write(path, bytes).await
}

/// Runs the actual git commands. Any failure means "not a repository".
async fn probe_git(cwd: &Path) -> Option<GitInfo> {
    let toplevel = run_git(cwd, &["rev-parse", "--show-toplevel"]).await?;

    let git_dir = run_git(cwd, &["rev-parse", "--git-dir"]).await;
    let common_dir = run_git(cwd, &["rev-parse", "--git-common-dir"]).await;
    let is_worktree = match (&git_dir, &common_dir) {
        (Some(git_dir), Some(common_dir)) => git_dir != common_dir,
        _ => false,
    };

    // For a linked worktree the shared repository root is the parent of the
    // common dir (<root>/.git); the checkout itself is the worktree root.
    let (repo_root, worktree_root) = if is_worktree {
        let shared_root = common_dir
            .as_deref()
            .map(Path::new)
            .and_then(Path::parent)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| toplevel.clone());
        (shared_root, Some(toplevel.clone()))
    } else {
        (toplevel.clone(), None)
    };

    let repo_url = run_git(cwd, &["config", "--get", "remote.origin.url"]).await;
    let branch = run_git(cwd, &["branch", "--show-current"]).await;
    let repo_id = repo_url
        .as_deref()
        .and_then(repo_id_from_url)
        .or_else(|| {
            Path::new(&repo_root)
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
        });

    debug!(
        cwd = %cwd.display(),
        repo_root = %repo_root,
        is_worktree,
        "git probe resolved"
    );

    Some(GitInfo {
        repo_root_path: Some(repo_root),
        repo_url,
        repo_id,
        branch,
        is_worktree,
        worktree_root,
    })
}

/// Runs one git command, returning trimmed non-empty stdout on success.
async fn run_git(cwd: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(cwd)
        .args(args)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Derives a stable repo id from a remote URL.
///
/// `git@github.com:acme/widget.git` and `https://github.com/acme/widget`
/// both map to `github.com/acme/widget`.
fn repo_id_from_url(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .or_else(|| url.strip_prefix("ssh://"))
        .unwrap_or(url);
    let without_user = match without_scheme.strip_prefix("git@") {
        Some(rest) => rest.replacen(':', "/", 1),
        None => without_scheme.to_string(),
    };
    let cleaned = without_user
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}
