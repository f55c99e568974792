// # ffprobe wrapper
//
// One `ffprobe -of json` call per container yields its duration, chapter list
// and audio streams.

use crate::process::{Invocation, SilentParser, ToolRunner};
use crate::tools::ToolError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("Unreadable ffprobe output for {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chapter {
    pub start: Duration,
    pub end: Duration,
    pub title: Option<String>,
}

impl Chapter {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioStream {
    pub index: u32,
    pub codec: String,
    pub channels: u32,
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    pub duration: Duration,
    pub chapters: Vec<Chapter>,
    pub audio_streams: Vec<AudioStream>,
}

impl ProbeReport {
    /// The stream carrying Atmos: the TrueHD stream with the most channels,
    /// otherwise an E-AC-3 (JOC) stream
    pub fn atmos_stream(&self) -> Option<&AudioStream> {
        let truehd = self
            .audio_streams
            .iter()
            .filter(|s| s.codec == "truehd")
            .max_by_key(|s| (s.channels, std::cmp::Reverse(s.index)));
        truehd.or_else(|| {
            self.audio_streams
                .iter()
                .filter(|s| s.codec == "eac3")
                .max_by_key(|s| (s.channels, std::cmp::Reverse(s.index)))
        })
    }
}

#[derive(Deserialize)]
struct RawReport {
    #[serde(default)]
    chapters: Vec<RawChapter>,
    #[serde(default)]
    streams: Vec<RawStream>,
    format: Option<RawFormat>,
}

#[derive(Deserialize)]
struct RawChapter {
    start_time: Option<String>,
    end_time: Option<String>,
    #[serde(default)]
    tags: Option<RawTags>,
}

#[derive(Deserialize)]
struct RawTags {
    title: Option<String>,
}

#[derive(Deserialize)]
struct RawStream {
    index: u32,
    codec_name: Option<String>,
    codec_type: Option<String>,
    channels: Option<u32>,
    profile: Option<String>,
}

#[derive(Deserialize)]
struct RawFormat {
    duration: Option<String>,
}

fn seconds(raw: Option<&str>) -> Duration {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .and_then(|v| Duration::try_from_secs_f64(v).ok())
        .unwrap_or(Duration::ZERO)
}

/// Parse `ffprobe -show_format -show_streams -show_chapters -of json` output
pub fn parse_report(json: &str, path: &Path) -> Result<ProbeReport, ProbeError> {
    let raw: RawReport = serde_json::from_str(json).map_err(|source| ProbeError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    let chapters = raw
        .chapters
        .into_iter()
        .map(|c| Chapter {
            start: seconds(c.start_time.as_deref()),
            end: seconds(c.end_time.as_deref()),
            title: c.tags.and_then(|t| t.title).filter(|t| !t.trim().is_empty()),
        })
        .collect();

    let audio_streams = raw
        .streams
        .into_iter()
        .filter(|s| s.codec_type.as_deref() == Some("audio"))
        .map(|s| AudioStream {
            index: s.index,
            codec: s.codec_name.unwrap_or_default(),
            channels: s.channels.unwrap_or(0),
            profile: s.profile,
        })
        .collect();

    Ok(ProbeReport {
        duration: seconds(raw.format.as_ref().and_then(|f| f.duration.as_deref())),
        chapters,
        audio_streams,
    })
}

/// Probe a container
pub async fn probe(
    runner: &ToolRunner,
    ffprobe: &Path,
    file: &Path,
) -> Result<ProbeReport, ProbeError> {
    let invocation = Invocation::new("ffprobe", ffprobe)
        .args(["-v", "error", "-print_format", "json"])
        .args(["-show_format", "-show_streams", "-show_chapters"])
        .arg(file.as_os_str())
        .capture();

    let output = runner.run(invocation, &mut SilentParser).await?;
    let report = parse_report(&output.lines.join("\n"), file)?;
    debug!(
        "Probed {:?}: {:.1}s, {} chapter(s), {} audio stream(s)",
        file,
        report.duration.as_secs_f64(),
        report.chapters.len(),
        report.audio_streams.len()
    );
    Ok(report)
}
