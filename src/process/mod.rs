//! Subprocess supervision.
//!
//! Stages run tools through a [`ToolRunner`]: it spawns the tool in the job's
//! workspace, books the pid before reading any output, feeds output lines to an
//! [`OutputParser`] and forwards the resulting [`ToolEvent`]s upstream. What the
//! caller gets back is an exit status and, optionally, the captured lines.

pub mod output;
pub mod signal;
mod supervisor;

pub use output::{
    FfmpegParser, MakeMkvParser, MkvmergeParser, OutputParser, SilentParser, ToolEvent,
};
pub use supervisor::SupervisedChild;

use crate::tools::ToolError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Lines kept for the error message of a failed tool
const DIAGNOSTIC_TAIL: usize = 20;

/// Durable record of which tools a job has running
#[async_trait]
pub trait ProcessBook: Send + Sync {
    async fn child_started(&self, tool: &str, pid: u32) -> Result<(), String>;
    async fn child_exited(&self, pid: u32);
}

/// Book that remembers nothing, for callers outside a job
pub struct NoBook;

#[async_trait]
impl ProcessBook for NoBook {
    async fn child_started(&self, _tool: &str, _pid: u32) -> Result<(), String> {
        Ok(())
    }
    async fn child_exited(&self, _pid: u32) {}
}

/// One tool invocation
pub struct Invocation {
    pub tool: String,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Keep every output line in `ToolOutput::lines`
    pub capture: bool,
}

impl Invocation {
    pub fn new(tool: &str, program: &Path) -> Self {
        Self {
            tool: tool.to_string(),
            program: program.to_path_buf(),
            args: Vec::new(),
            capture: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn capture(mut self) -> Self {
        self.capture = true;
        self
    }
}

#[derive(Debug, Default)]
pub struct ToolOutput {
    pub lines: Vec<String>,
    pub elapsed: Duration,
}

/// Runs tools on behalf of one job
#[derive(Clone)]
pub struct ToolRunner {
    workspace: PathBuf,
    book: Arc<dyn ProcessBook>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<ToolEvent>,
}

impl ToolRunner {
    pub fn new(
        workspace: PathBuf,
        book: Arc<dyn ProcessBook>,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<ToolEvent>,
    ) -> Self {
        Self {
            workspace,
            book,
            cancel,
            events,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Forward an event that did not come from a tool's output
    pub fn report(&self, event: ToolEvent) {
        let _ = self.events.send(event);
    }

    pub fn message(&self, text: impl Into<String>) {
        self.report(ToolEvent::Message(text.into()));
    }

    /// Run a tool to completion.
    ///
    /// Non-zero exit becomes `ToolError::NonZeroExit` carrying the last output
    /// lines; cancellation terminates the tool's process group and returns
    /// `ToolError::Cancelled`.
    pub async fn run(
        &self,
        invocation: Invocation,
        parser: &mut dyn OutputParser,
    ) -> Result<ToolOutput, ToolError> {
        if self.cancel.is_cancelled() {
            return Err(ToolError::Cancelled {
                tool: invocation.tool,
            });
        }

        let started = Instant::now();
        info!("Running {}: {:?} {:?}", invocation.tool, invocation.program, invocation.args);

        let mut child = SupervisedChild::spawn(
            &invocation.tool,
            &invocation.program,
            &invocation.args,
            &self.workspace,
        )?;
        let pid = child.pid();

        if let Err(reason) = self.book.child_started(&invocation.tool, pid).await {
            child.terminate().await;
            return Err(ToolError::Bookkeeping {
                tool: invocation.tool,
                pid,
                reason,
            });
        }

        let result = self
            .drive(&mut child, &invocation, parser, started)
            .await;
        self.book.child_exited(pid).await;
        result
    }

    async fn drive(
        &self,
        child: &mut SupervisedChild,
        invocation: &Invocation,
        parser: &mut dyn OutputParser,
        started: Instant,
    ) -> Result<ToolOutput, ToolError> {
        let mut output = ToolOutput::default();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_TAIL);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Cancelling {} (pid {})", invocation.tool, child.pid());
                    child.terminate().await;
                    return Err(ToolError::Cancelled { tool: invocation.tool.clone() });
                }
                line = child.next_line() => {
                    let Some(line) = line else { break };
                    if let Some(event) = parser.parse_line(&line) {
                        let _ = self.events.send(event);
                    }
                    if tail.len() == DIAGNOSTIC_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                    if invocation.capture {
                        output.lines.push(line);
                    }
                }
            }
        }

        let status = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                child.terminate().await;
                return Err(ToolError::Cancelled { tool: invocation.tool.clone() });
            }
            status = child.wait() => status?,
        };

        output.elapsed = started.elapsed();
        if !status.success() {
            return Err(ToolError::NonZeroExit {
                tool: invocation.tool.clone(),
                code: status.code(),
                diagnostics: tail.into_iter().collect::<Vec<_>>().join("\n"),
            });
        }

        debug!(
            "{} finished in {:.1}s",
            invocation.tool,
            output.elapsed.as_secs_f64()
        );
        Ok(output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBook {
        started: Mutex<Vec<u32>>,
        exited: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl ProcessBook for RecordingBook {
        async fn child_started(&self, _tool: &str, pid: u32) -> Result<(), String> {
            self.started.lock().unwrap().push(pid);
            Ok(())
        }
        async fn child_exited(&self, pid: u32) {
            self.exited.lock().unwrap().push(pid);
        }
    }

    fn runner(
        dir: &Path,
        book: Arc<RecordingBook>,
        cancel: CancellationToken,
    ) -> (ToolRunner, mpsc::UnboundedReceiver<ToolEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ToolRunner::new(dir.to_path_buf(), book, cancel, tx), rx)
    }

    #[tokio::test]
    async fn test_run_reports_progress_and_books_pid() {
        let dir = tempfile::tempdir().unwrap();
        let book = Arc::new(RecordingBook::default());
        let (runner, mut events) = runner(dir.path(), book.clone(), CancellationToken::new());

        let output = runner
            .run(
                Invocation::new("sh", Path::new("/bin/sh"))
                    .args(["-c", "echo 'Progress: 10%'; echo done"])
                    .capture(),
                &mut MkvmergeParser,
            )
            .await
            .unwrap();

        assert_eq!(output.lines, vec!["Progress: 10%", "done"]);
        assert_eq!(
            events.recv().await,
            Some(ToolEvent::Progress {
                percent: 10.0,
                detail: None
            })
        );
        assert_eq!(book.started.lock().unwrap().len(), 1);
        assert_eq!(*book.started.lock().unwrap(), *book.exited.lock().unwrap());
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let book = Arc::new(RecordingBook::default());
        let (runner, _events) = runner(dir.path(), book, CancellationToken::new());

        let err = runner
            .run(
                Invocation::new("sh", Path::new("/bin/sh")).args(["-c", "echo 'read error' 1>&2; exit 3"]),
                &mut SilentParser,
            )
            .await
            .unwrap_err();

        match err {
            ToolError::NonZeroExit {
                code, diagnostics, ..
            } => {
                assert_eq!(code, Some(3));
                assert!(diagnostics.contains("read error"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_terminates_tool() {
        let dir = tempfile::tempdir().unwrap();
        let book = Arc::new(RecordingBook::default());
        let cancel = CancellationToken::new();
        let (runner, _events) = runner(dir.path(), book.clone(), cancel.clone());

        let task = tokio::spawn(async move {
            runner
                .run(
                    Invocation::new("sleep", Path::new("sleep")).arg("30"),
                    &mut SilentParser,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ToolError::Cancelled { .. })));

        let pid = book.started.lock().unwrap()[0];
        assert!(!signal::is_alive(pid));
        assert_eq!(*book.exited.lock().unwrap(), vec![pid]);
    }
}
