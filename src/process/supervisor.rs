use crate::process::signal::{self, Signal};
use crate::tools::ToolError;
use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Time a tool gets to exit after SIGTERM before the group is killed
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// How long output may stay open after the leader exited. A helper that
/// inherited stdout would otherwise hold the stage until it exits.
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// A running tool, leader of its own process group.
///
/// stdout and stderr are merged into one line stream. Lines are split on `\n`
/// and `\r` since ffmpeg rewrites its stats line in place.
///
/// Dropping an unreaped child kills its whole group.
pub struct SupervisedChild {
    tool: String,
    child: Child,
    pid: u32,
    lines: mpsc::UnboundedReceiver<String>,
    reaped: bool,
    /// Exit status collected while reading output
    status: Option<ExitStatus>,
    drain_deadline: Option<Instant>,
}

impl SupervisedChild {
    pub fn spawn(
        tool: &str,
        program: &Path,
        args: &[OsString],
        cwd: &Path,
    ) -> Result<Self, ToolError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ToolError::Spawn {
            tool: tool.to_string(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| ToolError::Spawn {
            tool: tool.to_string(),
            source: std::io::Error::other("child exited before its pid was read"),
        })?;

        let (tx, lines) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, tx));
        }

        debug!("Spawned {} (pid {}): {:?} {:?}", tool, pid, program, args);

        Ok(Self {
            tool: tool.to_string(),
            child,
            pid,
            lines,
            reaped: false,
            status: None,
            drain_deadline: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Next output line, or None once both streams are closed.
    ///
    /// Once the leader has exited, output still open after `OUTPUT_DRAIN`
    /// belongs to leftover helpers: they are killed and the stream ends.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(deadline) = self.drain_deadline {
                return match tokio::time::timeout_at(deadline, self.lines.recv()).await {
                    Ok(line) => line,
                    Err(_) => {
                        warn!(
                            "{} (pid {}) exited but its output is still open, killing leftover helpers",
                            self.tool, self.pid
                        );
                        signal::signal_group(self.pid, Signal::Kill);
                        self.lines.close();
                        None
                    }
                };
            }

            tokio::select! {
                line = self.lines.recv() => return line,
                status = self.child.wait() => {
                    match status {
                        Ok(status) => {
                            debug!("{} (pid {}) exited with {}", self.tool, self.pid, status);
                            self.status = Some(status);
                            self.reaped = true;
                        }
                        Err(e) => warn!("Waiting for {} (pid {}) failed: {}", self.tool, self.pid, e),
                    }
                    self.drain_deadline = Some(Instant::now() + OUTPUT_DRAIN);
                }
            }
        }
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, ToolError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.reaped = true;
        debug!("{} (pid {}) exited with {}", self.tool, self.pid, status);
        Ok(status)
    }

    /// Ask the process group to stop, then kill it if it lingers
    pub async fn terminate(&mut self) {
        if self.reaped {
            if self.drain_deadline.is_some() {
                signal::signal_group(self.pid, Signal::Kill);
            }
            return;
        }
        signal::signal_group(self.pid, Signal::Terminate);

        match tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Waiting for {} (pid {}) failed: {}", self.tool, self.pid, e),
            Err(_) => {
                warn!(
                    "{} (pid {}) ignored SIGTERM, killing its process group",
                    self.tool, self.pid
                );
                signal::signal_group(self.pid, Signal::Kill);
                if let Err(e) = self.child.wait().await {
                    warn!("Waiting for {} (pid {}) failed: {}", self.tool, self.pid, e);
                }
            }
        }
        // Helpers that outlived the leader
        signal::signal_group(self.pid, Signal::Kill);
        self.reaped = true;
    }
}

impl Drop for SupervisedChild {
    fn drop(&mut self) {
        if !self.reaped {
            signal::signal_group(self.pid, Signal::Kill);
        }
    }
}

async fn pump_lines<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut chunk = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &byte in &chunk[..n] {
            if byte == b'\n' || byte == b'\r' {
                if !pending.is_empty() {
                    let line = String::from_utf8_lossy(&pending).to_string();
                    pending.clear();
                    if tx.send(line).is_err() {
                        return;
                    }
                }
            } else {
                pending.push(byte);
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).to_string());
    }
}
