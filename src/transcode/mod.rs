//! TranscodeStage
//!
//! Turns an extracted release plus resolved metadata into the library entry:
//! `<root>/<artist>/<album>/<album> (Atmos).m4a`, the matching `.cue` and
//! `cover.jpg`.

pub mod ffmpeg;
pub mod mkvmerge;

use crate::cue_sheet::CueSheet;
use crate::models::{total_duration, ExtractedRelease, OutputPaths, ResolvedMetadata};
use crate::probe::{self, ProbeError};
use crate::process::{FfmpegParser, Invocation, ToolRunner};
use crate::tools::{ToolError, Toolset};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("No TrueHD or E-AC-3 stream found in {0}")]
    NoAtmosStream(String),
    #[error("Nothing to transcode")]
    NoSources,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            TranscodeError::Tool(ToolError::Cancelled { .. })
                | TranscodeError::Probe(ProbeError::Tool(ToolError::Cancelled { .. }))
        )
    }
}

/// Everything TranscodeStage consumes
#[derive(Debug, Clone)]
pub struct TranscodeInput<'a> {
    pub release: &'a ExtractedRelease,
    pub metadata: &'a ResolvedMetadata,
    /// Validated JPEG in the workspace, if art was found
    pub cover: Option<&'a Path>,
    pub library_root: &'a Path,
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(
        &self,
        input: &TranscodeInput<'_>,
        runner: &ToolRunner,
    ) -> Result<OutputPaths, TranscodeError>;
}

/// Transcoder backed by mkvmerge and ffmpeg
pub struct ToolTranscoder {
    tools: Toolset,
}

impl ToolTranscoder {
    pub fn new(tools: Toolset) -> Self {
        Self { tools }
    }

    async fn remux(
        &self,
        input: &TranscodeInput<'_>,
        runner: &ToolRunner,
        audio: &Path,
    ) -> Result<(), TranscodeError> {
        let sources = &input.release.sources;
        let master = match sources.as_slice() {
            [] => return Err(TranscodeError::NoSources),
            [single] => single.clone(),
            many => mkvmerge::concat(runner, &self.tools.mkvmerge, many).await?,
        };

        let report = probe::probe(runner, &self.tools.ffprobe, &master).await?;
        let stream = report
            .atmos_stream()
            .ok_or_else(|| TranscodeError::NoAtmosStream(master.display().to_string()))?;
        info!(
            "Using {} stream {} ({} ch) from {:?}",
            stream.codec, stream.index, stream.channels, master
        );

        runner.message("Finalizing Atmos M4A");
        let args = ffmpeg::remux_args(&master, stream.index, input.cover, input.metadata, audio);
        let mut parser = FfmpegParser::new(total_duration(&input.release.tracks));
        runner
            .run(Invocation::new("ffmpeg", &self.tools.ffmpeg).args(args), &mut parser)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Transcoder for ToolTranscoder {
    async fn transcode(
        &self,
        input: &TranscodeInput<'_>,
        runner: &ToolRunner,
    ) -> Result<OutputPaths, TranscodeError> {
        let paths = output_paths(input.library_root, input.metadata, input.cover.is_some());
        if let Some(dir) = paths.audio.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        if let Err(e) = self.remux(input, runner, &paths.audio).await {
            remove_partial(&paths.audio).await;
            return Err(e);
        }

        let file_name = paths
            .audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        CueSheet::build(input.metadata, &input.release.tracks, &file_name)
            .write_to(&paths.cue)
            .await?;

        if let (Some(cover), Some(dest)) = (input.cover, &paths.cover) {
            tokio::fs::copy(cover, dest).await?;
        }

        info!("Library entry written: {:?}", paths.audio);
        Ok(paths)
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!("Removed partial output {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove partial output {:?}: {}", path, e),
    }
}

/// Characters that are not allowed in a path component on some platform
const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Make a tag usable as one path component
pub fn sanitize_component(value: &str, fallback: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if FORBIDDEN.contains(&c) || c.is_control() { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_end_matches('.').trim().to_string();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        fallback.to_string()
    } else {
        cleaned
    }
}

/// Where a release lands in the library
pub fn output_paths(library_root: &Path, metadata: &ResolvedMetadata, with_cover: bool) -> OutputPaths {
    let album = sanitize_component(&metadata.album, "Unknown Album");
    let dir: PathBuf = library_root
        .join(sanitize_component(&metadata.artist, "Unknown Artist"))
        .join(&album);
    OutputPaths {
        audio: dir.join(format!("{} (Atmos).m4a", album)),
        cue: dir.join(format!("{} (Atmos).cue", album)),
        cover: with_cover.then(|| dir.join("cover.jpg")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("AC/DC", "x"), "AC_DC");
        assert_eq!(sanitize_component("What?: \"Live\" <1>", "x"), "What__ _Live_ _1_");
        assert_eq!(sanitize_component("  ", "Unknown Artist"), "Unknown Artist");
        assert_eq!(sanitize_component("..", "Unknown"), "Unknown");
        assert_eq!(sanitize_component("Sigur Rós", "x"), "Sigur Rós");
    }

    #[test]
    fn test_output_layout() {
        let meta = ResolvedMetadata::from_hints("Pink Floyd", "The Wall");
        let paths = output_paths(Path::new("/lib"), &meta, true);
        assert_eq!(paths.audio, Path::new("/lib/Pink Floyd/The Wall/The Wall (Atmos).m4a"));
        assert_eq!(paths.cue, Path::new("/lib/Pink Floyd/The Wall/The Wall (Atmos).cue"));
        assert_eq!(
            paths.cover.as_deref(),
            Some(Path::new("/lib/Pink Floyd/The Wall/cover.jpg"))
        );
        assert!(output_paths(Path::new("/lib"), &meta, false).cover.is_none());
    }
}
