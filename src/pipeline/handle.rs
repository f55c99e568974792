// # Pipeline Handle
//
// Public API of the orchestrator. Submission validates and books the job
// synchronously (detection, ledger entry) and only then queues it, so a job the
// caller got an id for is always observable to its terminal state.

use crate::format_detector;
use crate::ledger::{process_probe, JobRegistration};
use crate::models::ResolvedMetadata;
use crate::pipeline::job::{JobPlan, JobRun};
use crate::pipeline::progress::JobEventHandle;
use crate::pipeline::service::{PipelineCommand, RunningJob, Shared};
use crate::pipeline::types::{JobEvent, JobId, JobRequest, JobStatus, PipelineError};
use crate::workspace;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Handle for submitting jobs and following their progress
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<Shared>,
    commands_tx: mpsc::UnboundedSender<PipelineCommand>,
    events: JobEventHandle,
}

impl PipelineHandle {
    pub(crate) fn new(
        shared: Arc<Shared>,
        commands_tx: mpsc::UnboundedSender<PipelineCommand>,
        events: JobEventHandle,
    ) -> Self {
        Self {
            shared,
            commands_tx,
            events,
        }
    }

    /// Classify, book and queue a job.
    ///
    /// An unrecognized input fails here, before anything is recorded. Events
    /// start flowing immediately; subscribe with `subscribe_all` beforehand to
    /// see all of them, or read `status` for the latest snapshot.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId, PipelineError> {
        let variant = format_detector::detect(&request.input)?;
        let job_id = uuid::Uuid::new_v4().to_string();
        let workspace = workspace::path_for(&self.shared.workspace_root, &job_id);

        // The entry exists before the workspace or any tool does
        self.shared
            .ledger
            .register(&JobRegistration {
                job_id: job_id.clone(),
                input: request.input.clone(),
                variant: variant.clone(),
                artist_hint: request.artist.clone(),
                album_hint: request.album.clone(),
                library_root: request.library_root.clone(),
                workspace: workspace.clone(),
            })
            .await?;

        self.events
            .track(JobStatus::new(&job_id, &request.input, variant.clone()));
        let _ = self.shared.events.send(JobEvent::Queued {
            job_id: job_id.clone(),
            variant: variant.clone(),
        });
        info!(
            "Queued job {} ({} from {:?})",
            job_id,
            variant.name(),
            request.input
        );

        if let Err(e) = self.launch(&job_id, workspace, JobPlan::Full { request, variant }) {
            self.shared.ledger.remove(&job_id).await?;
            return Err(e);
        }
        Ok(job_id)
    }

    /// Events of one job. Dropping the receiver unsubscribes.
    pub fn subscribe(&self, job_id: &str) -> mpsc::UnboundedReceiver<JobEvent> {
        self.events.subscribe_job(job_id)
    }

    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        self.events.subscribe_all()
    }

    /// Copy-on-read snapshot of a job submitted through this handle
    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.events.status(job_id)
    }

    pub fn jobs(&self) -> Vec<JobStatus> {
        self.events.statuses()
    }

    /// Cancel a job and wait until its tools are stopped, its workspace is
    /// deleted and its ledger entry is gone.
    ///
    /// A job that is not running (a parked one) is discarded.
    pub async fn cancel(&self, job_id: &str) -> Result<(), PipelineError> {
        let Some((cancel, mut done)) = self.shared.running_job(job_id) else {
            return self.discard(job_id).await;
        };

        info!("Cancelling job {}", job_id);
        cancel.cancel();
        // An Err means the task is gone, which is just as final
        let _ = done.wait_for(|finished| *finished).await;
        Ok(())
    }

    /// Re-enter TranscodeStage for a job parked after a transcode failure,
    /// using the extraction result and metadata recorded in its ledger entry
    pub async fn retry_transcode(&self, job_id: &str) -> Result<(), PipelineError> {
        if self.shared.is_running(job_id) {
            return Err(PipelineError::Busy(job_id.to_string()));
        }

        let entry = self
            .shared
            .ledger
            .entry(job_id)
            .await?
            .ok_or_else(|| PipelineError::UnknownJob(job_id.to_string()))?;

        let not_retryable = |reason: String| PipelineError::NotRetryable {
            job_id: job_id.to_string(),
            reason,
        };
        if process_probe::is_live_instance(entry.owner_pid) {
            return Err(PipelineError::Busy(job_id.to_string()));
        }
        if !entry.is_parked() {
            return Err(not_retryable(format!("stage is {}", entry.stage)));
        }
        let Some(release) = entry.release.clone() else {
            return Err(not_retryable("no extraction result recorded".to_string()));
        };
        if !entry.workspace.is_dir() {
            return Err(not_retryable(format!(
                "workspace {:?} is gone",
                entry.workspace
            )));
        }

        let metadata = entry
            .metadata
            .clone()
            .unwrap_or_else(|| ResolvedMetadata::from_hints(&entry.artist_hint, &entry.album_hint));

        // The parking instance has usually exited; take the entry over so
        // another carat's startup reconciliation sees a live owner
        self.shared.ledger.claim(job_id).await?;

        self.events
            .track(JobStatus::new(job_id, &entry.input, entry.variant.clone()));
        info!("Retrying transcode of job {}", job_id);
        self.launch(
            job_id,
            entry.workspace,
            JobPlan::RetryTranscode {
                release,
                metadata,
                library_root: entry.library_root,
            },
        )
    }

    /// Delete a job that is not running (typically parked): workspace first,
    /// then the ledger entry
    pub async fn discard(&self, job_id: &str) -> Result<(), PipelineError> {
        if self.shared.is_running(job_id) {
            return Err(PipelineError::Busy(job_id.to_string()));
        }
        let Some(entry) = self.shared.ledger.entry(job_id).await? else {
            return Err(PipelineError::UnknownJob(job_id.to_string()));
        };
        if process_probe::is_live_instance(entry.owner_pid) {
            return Err(PipelineError::Busy(job_id.to_string()));
        }

        self.shared.ledger.complete(job_id).await?;
        info!("Discarded job {}", job_id);
        let _ = self.shared.events.send(JobEvent::Cancelled {
            job_id: job_id.to_string(),
        });
        Ok(())
    }

    /// Cancel every running job and stop the worker
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands_tx
            .send(PipelineCommand::Shutdown(reply_tx))
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    fn launch(&self, job_id: &str, workspace: PathBuf, plan: JobPlan) -> Result<(), PipelineError> {
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut running = self
                .shared
                .running
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if running.contains_key(job_id) {
                return Err(PipelineError::Busy(job_id.to_string()));
            }
            running.insert(
                job_id.to_string(),
                RunningJob {
                    cancel: cancel.clone(),
                    done: done_rx,
                },
            );
        }

        let run = JobRun {
            job_id: job_id.to_string(),
            workspace,
            plan,
            cancel,
            done: done_tx,
        };
        if self.commands_tx.send(PipelineCommand::Start(run)).is_err() {
            self.shared.forget(job_id);
            return Err(PipelineError::ShutDown);
        }
        Ok(())
    }
}
