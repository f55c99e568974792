// # Job execution
//
// One task per job. Extraction and metadata resolution run side by side and are
// joined before the transcode. Whatever the outcome, the ledger entry is settled
// (removed, or parked after a transcode failure) before the terminal event is
// sent.

use crate::format_detector::InputVariant;
use crate::ledger::{JobBook, JobLedger, Stage};
use crate::metadata::ResolverOutcome;
use crate::models::{ExtractedRelease, OutputPaths, ResolvedMetadata};
use crate::pipeline::service::Shared;
use crate::pipeline::types::{
    ErrorClass, JobError, JobEvent, JobId, JobRequest, JobStage, StageResult,
};
use crate::process::{ToolEvent, ToolRunner};
use crate::transcode::TranscodeInput;
use crate::workspace;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Minimum spacing of ledger heartbeats driven by tool progress
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// What a job task has to do
pub(crate) enum JobPlan {
    /// Every stage, from a fresh submission
    Full {
        request: JobRequest,
        variant: InputVariant,
    },
    /// Re-enter TranscodeStage for a parked job
    RetryTranscode {
        release: ExtractedRelease,
        metadata: ResolvedMetadata,
        library_root: PathBuf,
    },
}

pub(crate) struct JobRun {
    pub job_id: JobId,
    pub workspace: PathBuf,
    pub plan: JobPlan,
    pub cancel: CancellationToken,
    /// Flipped once the ledger entry is settled and the terminal event is out
    pub done: watch::Sender<bool>,
}

/// Drive one job to a terminal state
pub(crate) async fn run(shared: Arc<Shared>, run: JobRun) {
    let JobRun {
        job_id,
        workspace,
        plan,
        cancel,
        done,
    } = run;

    let (tool_tx, tool_rx) = mpsc::unbounded_channel();
    let forwarder = tokio::spawn(forward_tool_events(
        job_id.clone(),
        tool_rx,
        shared.events.clone(),
        shared.ledger.clone(),
    ));

    let outcome = {
        let runner = ToolRunner::new(
            workspace.clone(),
            Arc::new(JobBook::new(shared.ledger.clone(), &job_id)),
            cancel.clone(),
            tool_tx,
        );
        let job = Job {
            shared: &shared,
            job_id: &job_id,
            workspace: &workspace,
            cancel: &cancel,
            runner,
        };
        if cancel.is_cancelled() {
            Err(JobError::cancelled())
        } else {
            match plan {
                JobPlan::Full { request, variant } => job.run_full(&request, &variant).await,
                JobPlan::RetryTranscode {
                    release,
                    metadata,
                    library_root,
                } => {
                    let cover = existing_cover(&workspace);
                    job.transcode(&release, &metadata, cover.as_deref(), &library_root)
                        .await
                }
            }
        }
    };

    // The runner is gone, so the forwarder drains and stops; its events must
    // precede the terminal one
    if let Err(e) = forwarder.await {
        warn!("Job {}: tool event forwarder failed: {}", job_id, e);
    }

    let event = settle(&shared.ledger, &job_id, outcome).await;
    shared.forget(&job_id);
    let _ = shared.events.send(event);
    let _ = done.send(true);
}

struct Job<'a> {
    shared: &'a Shared,
    job_id: &'a str,
    workspace: &'a Path,
    cancel: &'a CancellationToken,
    runner: ToolRunner,
}

impl Job<'_> {
    fn emit(&self, event: JobEvent) {
        let _ = self.shared.events.send(event);
    }

    fn enter(&self, stage: JobStage) {
        debug!("Job {} -> {}", self.job_id, stage);
        self.emit(JobEvent::StageChanged {
            job_id: self.job_id.to_string(),
            stage,
        });
    }

    async fn run_full(&self, request: &JobRequest, variant: &InputVariant) -> StageResult<OutputPaths> {
        workspace::create(&self.shared.workspace_root, self.job_id)?;

        let resolve = async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(JobError::cancelled()),
                outcome = self.shared.resolver.resolve(&request.artist, &request.album) => Ok(outcome),
            }
        };
        let (release, outcome) = tokio::try_join!(self.extract(variant), resolve)?;

        let (metadata, cover) = self.adopt_metadata(outcome).await;
        self.transcode(&release, &metadata, cover.as_deref(), &request.library_root)
            .await
    }

    async fn extract(&self, variant: &InputVariant) -> StageResult<ExtractedRelease> {
        let _drive = if variant.uses_optical_drive() {
            self.enter(JobStage::WaitingForDrive);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(JobError::cancelled()),
                guard = self.shared.drive_lock.lock() => Some(guard),
            }
        } else {
            None
        };

        self.shared
            .ledger
            .advance_stage(self.job_id, Stage::Extracting)
            .await?;
        self.enter(JobStage::Extracting);
        info!("Job {}: extracting {}", self.job_id, variant.name());

        let release = self.shared.extractor.extract(variant, &self.runner).await?;
        self.shared.ledger.save_release(self.job_id, &release).await?;
        info!(
            "Job {}: extracted {} track(s) from {} source(s)",
            self.job_id,
            release.tracks.len(),
            release.sources.len()
        );
        Ok(release)
    }

    /// Persist what the resolver chose and stage its art in the workspace.
    /// Nothing in here fails the job.
    async fn adopt_metadata(&self, outcome: ResolverOutcome) -> (ResolvedMetadata, Option<PathBuf>) {
        let ResolverOutcome {
            metadata,
            art,
            degraded,
        } = outcome;

        if let Some(reason) = degraded {
            self.emit(JobEvent::MetadataDegraded {
                job_id: self.job_id.to_string(),
                reason,
            });
        }

        if let Err(e) = self.shared.ledger.save_metadata(self.job_id, &metadata).await {
            warn!("Job {}: resolved metadata not persisted: {}", self.job_id, e);
        }

        let cover = match art {
            Some(art) => {
                let path = workspace::cover_path(self.workspace);
                match art.write_to(&path).await {
                    Ok(()) => Some(path),
                    Err(e) => {
                        warn!("Job {}: cover art not saved: {}", self.job_id, e);
                        None
                    }
                }
            }
            None => None,
        };
        (metadata, cover)
    }

    async fn transcode(
        &self,
        release: &ExtractedRelease,
        metadata: &ResolvedMetadata,
        cover: Option<&Path>,
        library_root: &Path,
    ) -> StageResult<OutputPaths> {
        self.enter(JobStage::WaitingForTranscodeSlot);
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(JobError::cancelled()),
            permit = self.shared.transcode_slots.acquire() => permit
                .map_err(|_| JobError::new(ErrorClass::Internal, "transcode slots closed"))?,
        };

        self.shared
            .ledger
            .advance_stage(self.job_id, Stage::Transcoding)
            .await?;
        self.enter(JobStage::Transcoding);

        let input = TranscodeInput {
            release,
            metadata,
            cover,
            library_root,
        };
        Ok(self.shared.transcoder.transcode(&input, &self.runner).await?)
    }
}

fn existing_cover(workspace: &Path) -> Option<PathBuf> {
    let path = workspace::cover_path(workspace);
    path.is_file().then_some(path)
}

/// Close the ledger entry according to the outcome and build the terminal event
async fn settle(ledger: &JobLedger, job_id: &str, outcome: StageResult<OutputPaths>) -> JobEvent {
    let job_id = job_id.to_string();
    match outcome {
        Ok(outputs) => {
            if let Err(e) = ledger.complete(&job_id).await {
                error!("Job {}: finished but not closed in the ledger: {}", job_id, e);
            }
            info!("Job {} completed: {:?}", job_id, outputs.audio);
            JobEvent::Completed { job_id, outputs }
        }
        Err(e) if e.class == ErrorClass::TranscodeFailed => {
            if let Err(le) = ledger.park(&job_id, &e.message).await {
                error!("Job {}: could not park after transcode failure: {}", job_id, le);
            }
            JobEvent::Failed {
                job_id,
                class: e.class,
                message: e.message,
            }
        }
        Err(e) => {
            if let Err(le) = ledger.complete(&job_id).await {
                error!(
                    "Job {}: cleanup failed, leaving it to startup reconciliation: {}",
                    job_id, le
                );
            }
            if e.is_cancelled() {
                info!("Job {} cancelled", job_id);
                JobEvent::Cancelled { job_id }
            } else {
                error!("Job {} failed: {}", job_id, e);
                JobEvent::Failed {
                    job_id,
                    class: e.class,
                    message: e.message,
                }
            }
        }
    }
}

/// Turn a job's tool events into job events, refreshing the ledger heartbeat
/// as progress comes in
async fn forward_tool_events(
    job_id: JobId,
    mut tool_rx: mpsc::UnboundedReceiver<ToolEvent>,
    events: mpsc::UnboundedSender<JobEvent>,
    ledger: JobLedger,
) {
    let mut last_beat = Instant::now();
    while let Some(event) = tool_rx.recv().await {
        let job_event = match event {
            ToolEvent::Progress { percent, detail } => JobEvent::Progress {
                job_id: job_id.clone(),
                percent,
                detail,
            },
            ToolEvent::Message(text) => JobEvent::Message {
                job_id: job_id.clone(),
                text,
            },
        };
        let _ = events.send(job_event);

        if last_beat.elapsed() >= HEARTBEAT_INTERVAL {
            last_beat = Instant::now();
            if let Err(e) = ledger.heartbeat(&job_id).await {
                debug!("Job {}: heartbeat failed: {}", job_id, e);
            }
        }
    }
}
