use crate::format_detector::InputVariant;
use crate::models::{ExtractedRelease, ResolvedMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use std::path::PathBuf;
use std::str::FromStr;

// String constants for SQL DEFAULT clauses (keep in sync with as_str())
pub(crate) const STAGE_REGISTERED: &str = "registered";
const STAGE_EXTRACTING: &str = "extracting";
const STAGE_EXTRACTED: &str = "extracted";
const STAGE_TRANSCODING: &str = "transcoding";
const STAGE_TRANSCODE_FAILED: &str = "transcode_failed";

/// Where a job stands, as far as crash recovery is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Registered,     // Entry and workspace path recorded, nothing started
    Extracting,     // Ripping or probing the source
    Extracted,      // Tracks persisted, waiting for metadata or a transcode slot
    Transcoding,    // Building the library entry
    TranscodeFailed, // Parked: workspace kept, retry possible
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Registered => STAGE_REGISTERED,
            Stage::Extracting => STAGE_EXTRACTING,
            Stage::Extracted => STAGE_EXTRACTED,
            Stage::Transcoding => STAGE_TRANSCODING,
            Stage::TranscodeFailed => STAGE_TRANSCODE_FAILED,
        }
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            STAGE_REGISTERED => Ok(Stage::Registered),
            STAGE_EXTRACTING => Ok(Stage::Extracting),
            STAGE_EXTRACTED => Ok(Stage::Extracted),
            STAGE_TRANSCODING => Ok(Stage::Transcoding),
            STAGE_TRANSCODE_FAILED => Ok(Stage::TranscodeFailed),
            other => Err(format!("unknown stage {:?}", other)),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the orchestrator records before anything touches the disk
#[derive(Debug, Clone)]
pub struct JobRegistration {
    pub job_id: String,
    pub input: String,
    pub variant: InputVariant,
    pub artist_hint: String,
    pub album_hint: String,
    pub library_root: PathBuf,
    pub workspace: PathBuf,
}

/// A tool started on behalf of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerProcess {
    pub pid: u32,
    pub tool: String,
    pub started_at: DateTime<Utc>,
}

/// Durable record of one in-flight job
///
/// Present from registration until the job completes, is cancelled or is
/// discarded. Startup reconciliation works from these rows alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub job_id: String,
    pub workspace: PathBuf,
    pub stage: Stage,
    pub input: String,
    pub variant: InputVariant,
    pub artist_hint: String,
    pub album_hint: String,
    pub library_root: PathBuf,
    /// pid of the carat process that registered the job
    pub owner_pid: u32,
    pub processes: Vec<LedgerProcess>,
    pub created_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    /// Set once extraction finishes so a transcode retry can skip it
    pub release: Option<ExtractedRelease>,
    pub metadata: Option<ResolvedMetadata>,
    pub last_error: Option<String>,
}

impl LedgerEntry {
    pub fn is_parked(&self) -> bool {
        self.stage == Stage::TranscodeFailed
    }

    pub fn pids(&self) -> Vec<u32> {
        self.processes.iter().map(|p| p.pid).collect()
    }
}

/// What startup reconciliation did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Orphaned jobs whose workspace and entry were removed
    pub reclaimed: Vec<String>,
    /// Parked jobs kept for a retry
    pub parked: Vec<String>,
    /// Entries left alone: owned by a live instance, or a recycled pid on a
    /// workspace that is not yet stale
    pub kept: Vec<String>,
    /// Tools that were still running and got killed
    pub killed: Vec<u32>,
    /// Unreferenced `carat_*` directories removed
    pub swept: Vec<PathBuf>,
    /// Malformed rows skipped
    pub corrupt: usize,
}
