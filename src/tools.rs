//! External tool discovery
//!
//! The pipeline drives four black-box binaries: `makemkvcon` (disc ripping),
//! `ffprobe` (stream/chapter inspection), `mkvmerge` (concatenation) and `ffmpeg`
//! (stream-copy remux). They are located once at startup.

use crate::config::ToolOverrides;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Missing dependencies: {0}. Please install them or check your system paths.")]
    Missing(String),
    #[error("MakeMKV beta key appears to be expired or invalid. Enter the latest beta key in the MakeMKV GUI and try again.")]
    LicenseExpired,
    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} exited with code {code:?}: {diagnostics}")]
    NonZeroExit {
        tool: String,
        code: Option<i32>,
        diagnostics: String,
    },
    #[error("{tool} was cancelled")]
    Cancelled { tool: String },
    #[error("Failed to record {tool} (pid {pid}) in the ledger: {reason}")]
    Bookkeeping {
        tool: String,
        pid: u32,
        reason: String,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolved locations of the external tools
#[derive(Debug, Clone)]
pub struct Toolset {
    pub makemkvcon: PathBuf,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub mkvmerge: PathBuf,
}

#[cfg(windows)]
const MAKEMKV_NAME: &str = "makemkvcon64";
#[cfg(not(windows))]
const MAKEMKV_NAME: &str = "makemkvcon";

const FFMPEG_PROSPECTS: &[&str] = &[
    r"C:\ffmpeg\bin\ffmpeg.exe",
    "/usr/local/bin/ffmpeg",
    "/opt/homebrew/bin/ffmpeg",
];
const FFPROBE_PROSPECTS: &[&str] = &[
    r"C:\ffmpeg\bin\ffprobe.exe",
    "/usr/local/bin/ffprobe",
    "/opt/homebrew/bin/ffprobe",
];
const MKVMERGE_PROSPECTS: &[&str] = &[
    r"C:\Program Files\MKVToolNix\mkvmerge.exe",
    "/usr/local/bin/mkvmerge",
    "/opt/homebrew/bin/mkvmerge",
];
const MAKEMKV_PROSPECTS: &[&str] = &[
    r"C:\Program Files (x86)\MakeMKV\makemkvcon64.exe",
    "/Applications/MakeMKV.app/Contents/MacOS/makemkvcon",
    "/usr/bin/makemkvcon",
];

impl Toolset {
    /// Locate every tool, failing once with the full list of what is missing
    pub fn discover(overrides: &ToolOverrides) -> Result<Self, ToolError> {
        let makemkvcon = locate(MAKEMKV_NAME, overrides.makemkvcon.as_deref(), MAKEMKV_PROSPECTS);
        let ffmpeg = locate("ffmpeg", overrides.ffmpeg.as_deref(), FFMPEG_PROSPECTS);
        let ffprobe = locate("ffprobe", overrides.ffprobe.as_deref(), FFPROBE_PROSPECTS);
        let mkvmerge = locate("mkvmerge", overrides.mkvmerge.as_deref(), MKVMERGE_PROSPECTS);

        let missing: Vec<&str> = [
            (MAKEMKV_NAME, makemkvcon.is_none()),
            ("ffmpeg", ffmpeg.is_none()),
            ("ffprobe", ffprobe.is_none()),
            ("mkvmerge", mkvmerge.is_none()),
        ]
        .iter()
        .filter(|(_, absent)| *absent)
        .map(|(name, _)| *name)
        .collect();

        match (makemkvcon, ffmpeg, ffprobe, mkvmerge) {
            (Some(makemkvcon), Some(ffmpeg), Some(ffprobe), Some(mkvmerge)) => {
                let tools = Toolset {
                    makemkvcon,
                    ffmpeg,
                    ffprobe,
                    mkvmerge,
                };
                info!("Toolset: {:?}", tools);
                Ok(tools)
            }
            _ => Err(ToolError::Missing(missing.join(", "))),
        }
    }

    /// Run `makemkvcon info dev:all`, which triggers the key check without ripping
    pub async fn validate_makemkv_license(&self) -> Result<(), ToolError> {
        let output = Command::new(&self.makemkvcon)
            .args(["info", "dev:all"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ToolError::Spawn {
                tool: MAKEMKV_NAME.to_string(),
                source,
            })?;

        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if license_looks_expired(&text) {
            return Err(ToolError::LicenseExpired);
        }
        Ok(())
    }
}

fn license_looks_expired(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("expired") || lower.contains("too old") || lower.contains("evaluation")
}

fn locate(name: &str, explicit: Option<&Path>, prospects: &[&str]) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        debug!("Configured {} at {:?} does not exist", name, path);
    }

    if let Some(found) = search_path(name) {
        return Some(found);
    }

    prospects
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.exists())
}

fn search_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) {
            let exe = dir.join(format!("{}.exe", name));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_license_detection() {
        assert!(license_looks_expired("This application version is too old."));
        assert!(license_looks_expired("Evaluation period has EXPIRED"));
        assert!(!license_looks_expired("DRV:0,2,999,12,\"BD-RE\",\"DISC\",\"/dev/sr0\""));
    }

    #[test]
    fn test_explicit_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("ffmpeg-custom");
        std::fs::write(&fake, b"").unwrap();
        assert_eq!(locate("ffmpeg-nonexistent-xyz", Some(&fake), &[]), Some(fake));
    }

    #[test]
    fn test_missing_tool_is_none() {
        assert_eq!(locate("carat-definitely-not-a-tool", None, &[]), None);
    }
}
