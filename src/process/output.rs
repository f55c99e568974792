// # Tool Output Parsers
//
// Each wrapped tool prints semi-structured text. Parsers turn single lines into
// `ToolEvent`s so nothing above the process layer knows a tool's output format.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

/// What the pipeline learns from a running tool
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEvent {
    /// Overall completion, 0..=100
    Progress { percent: f32, detail: Option<String> },
    /// Human-readable status line
    Message(String),
}

/// Line-oriented parser for one tool's output
pub trait OutputParser: Send {
    fn parse_line(&mut self, line: &str) -> Option<ToolEvent>;
}

/// MakeMKV `-r` (robot) output.
///
/// Progress is only reported once the main extraction has started (`PRGC:5017`);
/// before that PRGV lines describe disc scanning and would jump back to zero.
#[derive(Debug, Default)]
pub struct MakeMkvParser {
    extracting: bool,
}

const MAKEMKV_EXTRACTION_STARTED: &str = "PRGC:5017";
const MAKEMKV_SUPPRESSED: &[&str] = &["DRV:", "TDRV:", "CIDC:", "SINFO:", "TINFO:", "CINFO:"];

impl MakeMkvParser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputParser for MakeMkvParser {
    fn parse_line(&mut self, line: &str) -> Option<ToolEvent> {
        let line = line.trim_end();
        if line.is_empty() {
            return None;
        }

        if line.contains(MAKEMKV_EXTRACTION_STARTED) {
            self.extracting = true;
        }

        if line.starts_with("PRG") {
            if !self.extracting {
                return None;
            }
            let rest = line
                .strip_prefix("PRGV:")
                .or_else(|| line.strip_prefix("PRGT:"))?;
            let fields: Vec<&str> = rest.split(',').collect();
            let current: f64 = fields.first()?.trim().parse().ok()?;
            let max: f64 = fields.get(2)?.trim().parse().ok()?;
            if max <= 0.0 {
                return None;
            }
            let percent = current / max * 100.0;
            if !(0.0..=100.0).contains(&percent) {
                return None;
            }
            return Some(ToolEvent::Progress {
                percent: percent as f32,
                detail: None,
            });
        }

        if let Some(message) = parse_makemkv_message(line) {
            return Some(ToolEvent::Message(message));
        }

        if MAKEMKV_SUPPRESSED.iter().any(|prefix| line.starts_with(prefix)) {
            return None;
        }

        Some(ToolEvent::Message(line.to_string()))
    }
}

/// Extract the formatted text from `MSG:code,flags,count,"message","template",...`
pub fn parse_makemkv_message(line: &str) -> Option<String> {
    let rest = line.strip_prefix("MSG:")?;
    let fields = split_robot_fields(rest);
    fields.get(3).map(|text| text.to_string())
}

/// Split a MakeMKV robot line body on commas, honouring double quotes
pub fn split_robot_fields(body: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in body.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// ffmpeg `-stats` lines: `size=  1024kB time=00:01:02.50 bitrate=...`
#[derive(Debug)]
pub struct FfmpegParser {
    total: Duration,
}

impl FfmpegParser {
    /// `total` is the duration of the input, used to turn `time=` into a percentage
    pub fn new(total: Duration) -> Self {
        Self { total }
    }
}

fn ffmpeg_time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"time=\s*(-?)(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").unwrap())
}

/// Parse an ffmpeg `HH:MM:SS.ss` stamp from a stats line
pub fn parse_ffmpeg_time(line: &str) -> Option<Duration> {
    let caps = ffmpeg_time_regex().captures(line)?;
    if !caps[1].is_empty() {
        return Some(Duration::ZERO);
    }
    let hours: u64 = caps[2].parse().ok()?;
    let minutes: u64 = caps[3].parse().ok()?;
    let seconds: f64 = caps[4].parse().ok()?;
    Some(Duration::from_secs(hours * 3600 + minutes * 60) + Duration::from_secs_f64(seconds))
}

impl OutputParser for FfmpegParser {
    fn parse_line(&mut self, line: &str) -> Option<ToolEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if line.contains("size=") && line.contains("time=") && line.contains("bitrate=") {
            let detail = Some(line.replace("frame=", " ").trim().to_string());
            let elapsed = parse_ffmpeg_time(line)?;
            let percent = if self.total.is_zero() {
                0.0
            } else {
                (elapsed.as_secs_f64() / self.total.as_secs_f64() * 100.0).clamp(0.0, 100.0)
            };
            return Some(ToolEvent::Progress {
                percent: percent as f32,
                detail,
            });
        }

        Some(ToolEvent::Message(line.to_string()))
    }
}

/// mkvmerge prints `Progress: 42%` plus ordinary status lines
#[derive(Debug, Default)]
pub struct MkvmergeParser;

impl OutputParser for MkvmergeParser {
    fn parse_line(&mut self, line: &str) -> Option<ToolEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if let Some(rest) = line.strip_prefix("Progress:") {
            let percent: f32 = rest.trim().trim_end_matches('%').parse().ok()?;
            return Some(ToolEvent::Progress {
                percent: percent.clamp(0.0, 100.0),
                detail: None,
            });
        }
        Some(ToolEvent::Message(line.to_string()))
    }
}

/// For tools whose output is consumed whole (scans, probes)
#[derive(Debug, Default)]
pub struct SilentParser;

impl OutputParser for SilentParser {
    fn parse_line(&mut self, _line: &str) -> Option<ToolEvent> {
        None
    }
}
