// # Pipeline Service
//
// The orchestrator worker: receives job runs from the handle and spawns one task
// per job on the shared runtime. Exclusive and bounded resources (the optical
// drive, transcode slots) live in `Shared`, which every job task borrows.

use crate::config::Config;
use crate::extraction::Extractor;
use crate::ledger::JobLedger;
use crate::metadata::MetadataResolver;
use crate::pipeline::handle::PipelineHandle;
use crate::pipeline::job::{self, JobRun};
use crate::pipeline::progress::JobEventHandle;
use crate::pipeline::types::{JobEvent, JobId};
use crate::transcode::Transcoder;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A job task that has not settled yet
pub(crate) struct RunningJob {
    pub cancel: CancellationToken,
    pub done: watch::Receiver<bool>,
}

/// State shared by the handle, the worker and every job task
pub(crate) struct Shared {
    pub ledger: JobLedger,
    pub extractor: Arc<dyn Extractor>,
    pub transcoder: Arc<dyn Transcoder>,
    pub resolver: Arc<MetadataResolver>,
    pub workspace_root: PathBuf,
    /// Held for the whole ExtractionStage of a PhysicalDisc job. Waiters are
    /// served in arrival order.
    pub drive_lock: Mutex<()>,
    pub transcode_slots: Semaphore,
    pub events: mpsc::UnboundedSender<JobEvent>,
    pub running: std::sync::Mutex<HashMap<JobId, RunningJob>>,
}

impl Shared {
    pub fn is_running(&self, job_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(job_id)
    }

    /// Cancellation token and completion watch of a running job
    pub fn running_job(&self, job_id: &str) -> Option<(CancellationToken, watch::Receiver<bool>)> {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .map(|job| (job.cancel.clone(), job.done.clone()))
    }

    pub fn forget(&self, job_id: &str) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
    }
}

pub(crate) enum PipelineCommand {
    Start(JobRun),
    /// Cancel everything, then stop accepting runs
    Shutdown(oneshot::Sender<()>),
}

/// Orchestrator for ingestion jobs
pub struct PipelineService {
    shared: Arc<Shared>,
    commands_rx: mpsc::UnboundedReceiver<PipelineCommand>,
}

impl PipelineService {
    /// Start the worker, returning the handle for submitting and observing jobs.
    ///
    /// Must be called from within a tokio runtime. Run startup reconciliation on
    /// `ledger` before starting.
    pub fn start(
        config: &Config,
        ledger: JobLedger,
        extractor: Arc<dyn Extractor>,
        transcoder: Arc<dyn Transcoder>,
        resolver: Arc<MetadataResolver>,
    ) -> PipelineHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            ledger,
            extractor,
            transcoder,
            resolver,
            workspace_root: config.workspace_root.clone(),
            drive_lock: Mutex::new(()),
            transcode_slots: Semaphore::new(config.transcode_slots.max(1)),
            events: events_tx,
            running: std::sync::Mutex::new(HashMap::new()),
        });

        let service = PipelineService {
            shared: shared.clone(),
            commands_rx,
        };
        tokio::spawn(service.listen_for_commands());

        let events = JobEventHandle::new(events_rx);
        PipelineHandle::new(shared, commands_tx, events)
    }

    async fn listen_for_commands(mut self) {
        info!(
            "Pipeline: worker started ({} transcode slot(s))",
            self.shared.transcode_slots.available_permits()
        );

        while let Some(command) = self.commands_rx.recv().await {
            match command {
                PipelineCommand::Start(run) => self.spawn_job(run),
                PipelineCommand::Shutdown(reply) => {
                    // Runs queued behind the shutdown still start, so they
                    // settle as cancelled instead of lingering in the ledger
                    self.commands_rx.close();
                    while let Ok(command) = self.commands_rx.try_recv() {
                        if let PipelineCommand::Start(run) = command {
                            self.spawn_job(run);
                        }
                    }
                    self.stop_all().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
        info!("Pipeline: worker stopped");
    }

    fn spawn_job(&self, run: JobRun) {
        debug!("Pipeline: starting job {}", run.job_id);
        tokio::spawn(job::run(self.shared.clone(), run));
    }

    async fn stop_all(&self) {
        let running: Vec<(JobId, CancellationToken, watch::Receiver<bool>)> = self
            .shared
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, job)| (id.clone(), job.cancel.clone(), job.done.clone()))
            .collect();

        info!("Pipeline: shutting down, cancelling {} job(s)", running.len());
        for (_, cancel, _) in &running {
            cancel.cancel();
        }
        for (job_id, _, mut done) in running {
            if done.wait_for(|finished| *finished).await.is_err() {
                debug!("Pipeline: job {} ended without reporting", job_id);
            }
        }
    }
}
