// # Workspace
//
// Per-job scratch directory (`carat_<job-id>` under the configured root) holding
// ripped titles, the merged master and downloaded cover art.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

pub const WORKSPACE_PREFIX: &str = "carat_";

const NUKE_ATTEMPTS: u32 = 5;
const NUKE_BACKOFF: Duration = Duration::from_millis(200);

/// Workspace path for a job id (not created)
pub fn path_for(root: &Path, job_id: &str) -> PathBuf {
    root.join(format!("{}{}", WORKSPACE_PREFIX, job_id))
}

/// Create the workspace directory along with its `raw/` subdirectory
pub fn create(root: &Path, job_id: &str) -> io::Result<PathBuf> {
    let path = path_for(root, job_id);
    fs::create_dir_all(raw_dir(&path))?;
    debug!("Created workspace {:?}", path);
    Ok(path)
}

/// Where the ripping tool writes its titles
pub fn raw_dir(workspace: &Path) -> PathBuf {
    workspace.join("raw")
}

/// Downloaded, validated cover art
pub fn cover_path(workspace: &Path) -> PathBuf {
    workspace.join("cover.jpg")
}

/// Whether a directory name looks like one of ours
pub fn is_workspace_name(name: &str) -> bool {
    name.strip_prefix(WORKSPACE_PREFIX)
        .map(|rest| !rest.is_empty())
        .unwrap_or(false)
}

/// Delete a directory tree, retrying while the OS still holds file handles
/// (a just-killed tool can keep its output open for a moment).
///
/// A missing directory counts as success.
pub async fn nuke_dir(path: &Path) -> io::Result<()> {
    let mut last_error = None;
    for attempt in 1..=NUKE_ATTEMPTS {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                debug!("Removed workspace {:?}", path);
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                debug!(
                    "Removing {:?} failed (attempt {}/{}): {}",
                    path, attempt, NUKE_ATTEMPTS, e
                );
                last_error = Some(e);
                tokio::time::sleep(NUKE_BACKOFF).await;
            }
        }
    }

    let error = last_error.unwrap_or_else(|| io::Error::other("remove_dir_all failed"));
    warn!("Giving up on removing {:?}: {}", path, error);
    Err(error)
}

/// Most recent modification time of the directory or anything inside it
pub fn last_modified(path: &Path) -> io::Result<SystemTime> {
    let mut newest = fs::metadata(path)?.modified()?;
    let mut pending = vec![path.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            if let Ok(modified) = metadata.modified() {
                if modified > newest {
                    newest = modified;
                }
            }
            if metadata.is_dir() {
                pending.push(entry.path());
            }
        }
    }

    Ok(newest)
}

/// How long ago the workspace was last touched; zero when the clock runs backwards
pub fn idle_for(path: &Path) -> io::Result<Duration> {
    let modified = last_modified(path)?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO))
}
