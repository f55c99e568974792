// # Pipeline
//
// Orchestrates ingestion jobs:
//
// - **PipelineHandle**: submit, observe, cancel, retry and discard jobs
// - **PipelineService**: worker spawning one task per job
// - **Job**: stage sequencing (extraction alongside metadata, then transcode)
// - **JobEventHandle**: fans job events out to subscribers and status snapshots
//
// The optical drive is held exclusively for a PhysicalDisc job's whole
// ExtractionStage; concurrent transcodes are bounded by a semaphore.

mod handle;
mod job;
mod progress;
mod service;
mod types;

pub use handle::PipelineHandle;
pub use progress::JobEventHandle;
pub use service::PipelineService;
pub use types::{
    ErrorClass, JobError, JobEvent, JobId, JobRequest, JobStage, JobStatus, PipelineError,
    StageResult,
};
