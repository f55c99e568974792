//! ExtractionStage
//!
//! Disc-like inputs (drive, ISO, BDMV) are ripped with MakeMKV into the job's
//! workspace; file-based inputs pass through untouched and are only probed for
//! their track durations.

pub mod makemkv;

use crate::format_detector::InputVariant;
use crate::models::{ExtractedRelease, Track};
use crate::probe::{self, ProbeError, ProbeReport};
use crate::process::ToolRunner;
use crate::tools::{ToolError, Toolset};
use crate::workspace;
use async_trait::async_trait;
use makemkv::MakeMkv;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("No valid titles found on source")]
    NoTitles,
    #[error("Atmos or Die: best title ({best_title}) has score {score}; no Atmos track found")]
    NoAtmosTitle { best_title: u32, score: u32 },
    #[error("No drive with a disc inserted was found")]
    NoDisc,
    #[error("MakeMKV produced no output")]
    NoOutput,
    #[error("{0} has no measurable duration")]
    NoDuration(String),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ExtractionError::Tool(ToolError::Cancelled { .. })
                | ExtractionError::Probe(ProbeError::Tool(ToolError::Cancelled { .. }))
        )
    }
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Produce the ordered track list for a classified input.
    ///
    /// Every subprocess goes through `runner`, which books its pid with the
    /// job before any output is read.
    async fn extract(
        &self,
        variant: &InputVariant,
        runner: &ToolRunner,
    ) -> Result<ExtractedRelease, ExtractionError>;
}

/// Extractor backed by the external tools
pub struct ToolExtractor {
    tools: Toolset,
    min_title_seconds: u32,
}

impl ToolExtractor {
    pub fn new(tools: Toolset, min_title_seconds: u32) -> Self {
        Self {
            tools,
            min_title_seconds,
        }
    }

    fn makemkv(&self) -> MakeMkv<'_> {
        MakeMkv {
            program: &self.tools.makemkvcon,
            min_title_seconds: self.min_title_seconds,
        }
    }

    async fn rip(&self, runner: &ToolRunner, source: &str) -> Result<ExtractedRelease, ExtractionError> {
        self.tools.validate_makemkv_license().await?;

        let makemkv = self.makemkv();
        let title = makemkv.find_atmos_title(runner, source).await?;
        let raw_dir = workspace::raw_dir(runner.workspace());
        tokio::fs::create_dir_all(&raw_dir).await?;
        let master = makemkv.rip_title(runner, source, title, &raw_dir).await?;

        let report = probe::probe(runner, &self.tools.ffprobe, &master).await?;
        let tracks = tracks_from_report(&report, &master)?;
        info!("Ripped {:?}: {} track(s)", master, tracks.len());

        Ok(ExtractedRelease {
            sources: vec![master],
            tracks,
        })
    }

    async fn passthrough_single(
        &self,
        runner: &ToolRunner,
        file: &Path,
    ) -> Result<ExtractedRelease, ExtractionError> {
        let report = probe::probe(runner, &self.tools.ffprobe, file).await?;
        let tracks = tracks_from_report(&report, file)?;
        Ok(ExtractedRelease {
            sources: vec![file.to_path_buf()],
            tracks,
        })
    }

    async fn passthrough_folder(
        &self,
        runner: &ToolRunner,
        files: &[PathBuf],
    ) -> Result<ExtractedRelease, ExtractionError> {
        let mut durations = Vec::with_capacity(files.len());
        for file in files {
            let report = probe::probe(runner, &self.tools.ffprobe, file).await?;
            if report.duration.is_zero() {
                return Err(ExtractionError::NoDuration(file.display().to_string()));
            }
            durations.push(report.duration);
        }
        Ok(ExtractedRelease {
            sources: files.to_vec(),
            tracks: Track::sequence(&durations),
        })
    }
}

#[async_trait]
impl Extractor for ToolExtractor {
    async fn extract(
        &self,
        variant: &InputVariant,
        runner: &ToolRunner,
    ) -> Result<ExtractedRelease, ExtractionError> {
        match variant {
            InputVariant::PhysicalDisc { drive } => {
                let source = match makemkv::disc_source(drive) {
                    Some(source) => source,
                    None => self.makemkv().auto_detect_drive(runner).await?,
                };
                self.rip(runner, &source).await
            }
            InputVariant::DiscImage { image } => {
                self.rip(runner, &makemkv::image_source(image)).await
            }
            InputVariant::BdmvFolder { root } => {
                self.rip(runner, &makemkv::bdmv_source(root)).await
            }
            InputVariant::TrackFolder { files } => self.passthrough_folder(runner, files).await,
            InputVariant::SingleContainerFile { file } => {
                self.passthrough_single(runner, file).await
            }
        }
    }
}

/// Shortest chapter kept as a track of its own: one cue frame (1/75 s)
const MIN_CHAPTER: Duration = Duration::from_millis(14);

/// Tracks are the container's chapters; a chapterless container is one track
pub fn tracks_from_report(report: &ProbeReport, file: &Path) -> Result<Vec<Track>, ExtractionError> {
    let durations: Vec<Duration> = if report.chapters.is_empty() {
        vec![report.duration]
    } else {
        merge_short_chapters(report.chapters.iter().map(|c| c.duration()))
    };

    if durations.iter().all(|d| d.is_zero()) {
        return Err(ExtractionError::NoDuration(file.display().to_string()));
    }
    Ok(Track::sequence(&durations))
}

/// Fold chapters shorter than a cue frame into the preceding one (the
/// following one at the start), so every track gets its own INDEX timecode
fn merge_short_chapters(chapters: impl Iterator<Item = Duration>) -> Vec<Duration> {
    let mut merged: Vec<Duration> = Vec::new();
    let mut carry = Duration::ZERO;
    for duration in chapters {
        if duration < MIN_CHAPTER {
            match merged.last_mut() {
                Some(previous) => *previous += duration,
                None => carry += duration,
            }
            continue;
        }
        merged.push(duration + std::mem::take(&mut carry));
    }
    if merged.is_empty() && !carry.is_zero() {
        merged.push(carry);
    }
    merged
}
