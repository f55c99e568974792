// # Process-tree signalling and liveness probes
//
// Every tool is started as the leader of its own process group, so the group id
// equals the recorded pid and one signal reaches any helpers it spawned.

use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// Send a signal to a whole process group. Returns false if no such group exists.
#[cfg(unix)]
pub fn signal_group(pgid: u32, signal: Signal) -> bool {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    if pgid == 0 || pgid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: killpg has no memory-safety preconditions
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, sig) };
    debug!("killpg({}, {:?}) -> {}", pgid, signal, rc);
    rc == 0
}

#[cfg(not(unix))]
pub fn signal_group(pgid: u32, signal: Signal) -> bool {
    // taskkill /T walks the child tree, the closest equivalent of a group signal
    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/T", "/PID", &pgid.to_string()]);
    if signal == Signal::Kill {
        cmd.arg("/F");
    }
    let ok = cmd
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false);
    debug!("taskkill {} ({:?}) -> {}", pgid, signal, ok);
    ok
}

/// Send a signal to one process. Returns false if it does not exist.
#[cfg(unix)]
pub fn signal_process(pid: u32, signal: Signal) -> bool {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: kill has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    debug!("kill({}, {:?}) -> {}", pid, signal, rc);
    rc == 0
}

#[cfg(not(unix))]
pub fn signal_process(pid: u32, signal: Signal) -> bool {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/PID", &pid.to_string()]);
    if signal == Signal::Kill {
        cmd.arg("/F");
    }
    cmd.stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Whether any process currently has this pid
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence/permission check
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: it exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

/// Process group of a live pid
#[cfg(unix)]
pub fn process_group_of(pid: u32) -> Option<u32> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    // SAFETY: getpgid has no memory-safety preconditions
    let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
    if pgid < 0 {
        None
    } else {
        Some(pgid as u32)
    }
}

#[cfg(not(unix))]
pub fn process_group_of(pid: u32) -> Option<u32> {
    is_alive(pid).then_some(pid)
}

/// Short command name of a live pid (`comm`)
pub fn process_name(pid: u32) -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string(format!("/proc/{}/comm", pid))
            .ok()
            .map(|name| name.trim().to_string())
    }
    #[cfg(not(target_os = "linux"))]
    {
        let out = std::process::Command::new("ps")
            .args(["-o", "comm=", "-p", &pid.to_string()])
            .output()
            .ok()?;
        let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if name.is_empty() {
            None
        } else {
            Path::new(&name)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        }
    }
}

/// Working directory of a live pid, where the platform exposes it
pub fn process_cwd(pid: u32) -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_link(format!("/proc/{}/cwd", pid)).ok()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        None
    }
}

/// Pids whose working directory lies inside `dir`.
///
/// Tools run with the workspace as their cwd, so this finds a tool that was
/// spawned but never made it into the ledger.
pub fn processes_working_in(dir: &Path) -> Vec<u32> {
    #[cfg(target_os = "linux")]
    {
        let Ok(canonical) = dir.canonicalize() else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|pid| {
                std::fs::read_link(format!("/proc/{}/cwd", pid))
                    .map(|cwd| cwd.starts_with(&canonical))
                    .unwrap_or(false)
            })
            .collect()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = dir;
        Vec::new()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        let me = std::process::id();
        assert!(is_alive(me));
        assert!(process_group_of(me).is_some());
        assert!(process_name(me).is_some());
    }

    #[test]
    fn test_absent_pid() {
        assert!(!is_alive(0));
        assert!(!signal_group(0, Signal::Kill));
    }

    #[test]
    fn test_kill_group() {
        use std::os::unix::process::CommandExt;

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        assert_eq!(process_group_of(pid), Some(pid));
        assert!(signal_group(pid, Signal::Kill));
        child.wait().unwrap();
        assert!(!is_alive(pid));
    }
}
