use crate::extraction::ExtractionError;
use crate::format_detector::{DetectError, InputVariant};
use crate::ledger::LedgerError;
use crate::models::OutputPaths;
use crate::transcode::TranscodeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type JobId = String;

/// One ingestion request as the user states it
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    /// Drive reference, disc image, BDMV folder, track folder or container file
    pub input: String,
    pub artist: String,
    pub album: String,
    pub library_root: PathBuf,
}

/// Where a job is, as reported upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    WaitingForDrive,
    Extracting,
    WaitingForTranscodeSlot,
    Transcoding,
    /// Transcode failed; workspace kept for a retry
    Parked,
    Completed,
    Failed,
    Cancelled,
}

impl JobStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStage::Completed | JobStage::Failed | JobStage::Cancelled
        )
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStage::Queued => "queued",
            JobStage::WaitingForDrive => "waiting for drive",
            JobStage::Extracting => "extracting",
            JobStage::WaitingForTranscodeSlot => "waiting for transcode slot",
            JobStage::Transcoding => "transcoding",
            JobStage::Parked => "parked (transcode failed)",
            JobStage::Completed => "completed",
            JobStage::Failed => "failed",
            JobStage::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Failure classes surfaced upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    UnrecognizedInput,
    ExtractionFailed,
    MetadataResolutionFailed,
    TranscodeFailed,
    LedgerCorruption,
    Cancelled,
    Internal,
}

impl ErrorClass {
    /// What the user should do about it
    pub fn hint(&self) -> &'static str {
        match self {
            ErrorClass::UnrecognizedInput => "fix your input",
            ErrorClass::ExtractionFailed => "check your hardware/disc",
            ErrorClass::MetadataResolutionFailed => "cosmetic, tags may be wrong",
            ErrorClass::TranscodeFailed => "retry possible",
            ErrorClass::LedgerCorruption => "a ledger entry was unreadable and skipped",
            ErrorClass::Cancelled => "cancelled on request",
            ErrorClass::Internal => "unexpected error, see the log",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A classified stage failure
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{class}: {message}")]
pub struct JobError {
    pub class: ErrorClass,
    pub message: String,
}

impl JobError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorClass::Cancelled, "job cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.class == ErrorClass::Cancelled
    }
}

impl From<ExtractionError> for JobError {
    fn from(e: ExtractionError) -> Self {
        if e.is_cancelled() {
            return JobError::cancelled();
        }
        JobError::new(ErrorClass::ExtractionFailed, e.to_string())
    }
}

impl From<TranscodeError> for JobError {
    fn from(e: TranscodeError) -> Self {
        if e.is_cancelled() {
            return JobError::cancelled();
        }
        JobError::new(ErrorClass::TranscodeFailed, e.to_string())
    }
}

impl From<LedgerError> for JobError {
    fn from(e: LedgerError) -> Self {
        let class = match e {
            LedgerError::Corrupt { .. } => ErrorClass::LedgerCorruption,
            _ => ErrorClass::Internal,
        };
        JobError::new(class, e.to_string())
    }
}

impl From<std::io::Error> for JobError {
    fn from(e: std::io::Error) -> Self {
        JobError::new(ErrorClass::Internal, e.to_string())
    }
}

/// Outcome of one pipeline stage
pub type StageResult<T> = Result<T, JobError>;

/// Status stream items
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Queued {
        job_id: JobId,
        variant: InputVariant,
    },
    StageChanged {
        job_id: JobId,
        stage: JobStage,
    },
    Progress {
        job_id: JobId,
        percent: f32,
        detail: Option<String>,
    },
    Message {
        job_id: JobId,
        text: String,
    },
    /// Tags fall back to the hints verbatim, without art
    MetadataDegraded {
        job_id: JobId,
        reason: String,
    },
    Completed {
        job_id: JobId,
        outputs: OutputPaths,
    },
    Failed {
        job_id: JobId,
        class: ErrorClass,
        message: String,
    },
    Cancelled {
        job_id: JobId,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Queued { job_id, .. }
            | JobEvent::StageChanged { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Message { job_id, .. }
            | JobEvent::MetadataDegraded { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id } => job_id,
        }
    }

    /// Whether no further event will follow for this job
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Completed { .. } | JobEvent::Failed { .. } | JobEvent::Cancelled { .. }
        )
    }
}

/// Copy-on-read snapshot of a job
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub job_id: JobId,
    pub input: String,
    pub variant: InputVariant,
    pub stage: JobStage,
    pub percent: Option<f32>,
    pub last_message: Option<String>,
    pub outputs: Option<OutputPaths>,
    pub error: Option<JobError>,
}

impl JobStatus {
    pub fn new(job_id: &str, input: &str, variant: InputVariant) -> Self {
        Self {
            job_id: job_id.to_string(),
            input: input.to_string(),
            variant,
            stage: JobStage::Queued,
            percent: None,
            last_message: None,
            outputs: None,
            error: None,
        }
    }

    /// Fold an event into the snapshot
    pub fn apply(&mut self, event: &JobEvent) {
        match event {
            JobEvent::Queued { .. } => self.stage = JobStage::Queued,
            JobEvent::StageChanged { stage, .. } => {
                self.stage = *stage;
                self.percent = None;
            }
            JobEvent::Progress { percent, .. } => self.percent = Some(*percent),
            JobEvent::Message { text, .. } => self.last_message = Some(text.clone()),
            JobEvent::MetadataDegraded { reason, .. } => {
                self.last_message = Some(format!("metadata degraded: {}", reason))
            }
            JobEvent::Completed { outputs, .. } => {
                self.stage = JobStage::Completed;
                self.percent = Some(100.0);
                self.outputs = Some(outputs.clone());
            }
            JobEvent::Failed { class, message, .. } => {
                self.stage = if *class == ErrorClass::TranscodeFailed {
                    JobStage::Parked
                } else {
                    JobStage::Failed
                };
                self.error = Some(JobError::new(*class, message.clone()));
            }
            JobEvent::Cancelled { .. } => self.stage = JobStage::Cancelled,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Detect(#[from] DetectError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("No job {0}")]
    UnknownJob(JobId),
    #[error("Job {job_id} cannot be retried: {reason}")]
    NotRetryable { job_id: JobId, reason: String },
    #[error("Job {0} is still running")]
    Busy(JobId),
    #[error("Pipeline is shut down")]
    ShutDown,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Detect(_) => ErrorClass::UnrecognizedInput,
            PipelineError::Ledger(LedgerError::Corrupt { .. }) => ErrorClass::LedgerCorruption,
            _ => ErrorClass::Internal,
        }
    }
}
