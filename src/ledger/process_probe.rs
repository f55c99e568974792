// # Ownership probes for recorded pids
//
// A recorded pid may since have exited, may still be our tool (reparented to
// init after carat died), or may have been recycled by an unrelated process.
// Only the second case may be signalled.

use crate::process::signal::{self, Signal};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const STOP_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// No process has this pid
    Dead,
    /// Still the tool we started: it works inside the job's workspace, or
    /// leads its own group under the recorded tool name
    Ours,
    /// Alive, but nothing ties it to the job
    Foreign,
}

/// Classify a recorded tool pid against the job's workspace
pub fn classify(pid: u32, tool: &str, workspace: &Path) -> Ownership {
    if !signal::is_alive(pid) {
        return Ownership::Dead;
    }

    if let Some(cwd) = signal::process_cwd(pid) {
        let inside = workspace
            .canonicalize()
            .map(|ws| cwd.starts_with(ws))
            .unwrap_or(false);
        debug!("pid {} cwd {:?}, inside workspace: {}", pid, cwd, inside);
        return if inside { Ownership::Ours } else { Ownership::Foreign };
    }

    // No cwd to compare: fall back to name and group leadership
    let leads_group = signal::process_group_of(pid) == Some(pid);
    let same_name = signal::process_name(pid)
        .map(|name| names_match(&name, tool))
        .unwrap_or(false);
    if leads_group && same_name {
        Ownership::Ours
    } else {
        Ownership::Foreign
    }
}

/// SIGTERM a leftover tool, SIGKILL it if still there after the grace period.
///
/// A group leader is signalled with its whole group; a helper that was
/// reparented out of its group is signalled alone.
pub async fn stop_tool(pid: u32) {
    let leads_group = signal::process_group_of(pid) == Some(pid);
    let send = |sig: Signal| {
        if leads_group {
            signal::signal_group(pid, sig)
        } else {
            signal::signal_process(pid, sig)
        }
    };

    if !send(Signal::Terminate) {
        debug!("pid {} is already gone", pid);
        return;
    }

    let deadline = Instant::now() + STOP_GRACE;
    while signal::is_alive(pid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if signal::is_alive(pid) {
        warn!("pid {} ignored SIGTERM, killing it", pid);
        send(Signal::Kill);
    } else if leads_group {
        // Helpers that outlived the leader
        signal::signal_group(pid, Signal::Kill);
    }
}

/// Whether `pid` is another running carat instance (not this one)
pub fn is_live_instance(pid: u32) -> bool {
    if pid == std::process::id() || !signal::is_alive(pid) {
        return false;
    }
    let Some(name) = signal::process_name(pid) else {
        return false;
    };
    let own_name = signal::process_name(std::process::id()).unwrap_or_else(|| "carat".to_string());
    names_match(&name, &own_name)
}

/// `comm` is truncated to 15 bytes on Linux
fn names_match(reported: &str, expected: &str) -> bool {
    let reported = reported.trim_end_matches(".exe");
    let expected = expected.trim_end_matches(".exe");
    if reported == expected {
        return true;
    }
    reported.len() >= 15 && expected.starts_with(reported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_match() {
        assert!(names_match("makemkvcon", "makemkvcon"));
        assert!(names_match("makemkvcon64.exe", "makemkvcon64"));
        assert!(names_match("carat-integrati", "carat-integration_test"));
        assert!(!names_match("ffmpeg", "ffprobe"));
        assert!(!names_match("ff", "ffmpeg"));
    }

    #[test]
    fn test_dead_pid() {
        // pid_max on Linux is at most 2^22
        assert_eq!(classify(4_194_304 + 1, "sleep", Path::new("/tmp")), Ownership::Dead);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_outside_workspace_is_foreign() {
        let workspace = tempfile::tempdir().unwrap();
        // This test process works elsewhere
        assert_eq!(
            classify(std::process::id(), "carat", workspace.path()),
            Ownership::Foreign
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_tool_inside_workspace_is_ours() {
        let workspace = tempfile::tempdir().unwrap();
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .current_dir(workspace.path())
            .spawn()
            .unwrap();
        assert_eq!(classify(child.id(), "sleep", workspace.path()), Ownership::Ours);
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
