//! Input classification.
//!
//! Inspects path structure only: nothing is opened for writing and no
//! subprocess is spawned, so repeated calls on the same input agree.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

const DISC_IMAGE_EXTENSIONS: &[&str] = &["iso"];
const CONTAINER_EXTENSIONS: &[&str] = &["mkv", "mka", "m4a", "mp4"];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DetectError {
    #[error("Unrecognized input '{input}': {reason}")]
    UnrecognizedInput { input: String, reason: String },
    #[error("Cannot inspect '{input}': {reason}")]
    Inaccessible { input: String, reason: String },
}

/// Which drive a PhysicalDisc job reads from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DriveRef {
    /// MakeMKV drive index (`disc:N`)
    Index(u32),
    /// Pick the first drive with a disc inserted
    Auto,
    /// Platform device path such as `/dev/sr0` or `D:`
    Device(String),
}

impl fmt::Display for DriveRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveRef::Index(n) => write!(f, "disc:{}", n),
            DriveRef::Auto => write!(f, "disc:auto"),
            DriveRef::Device(dev) => write!(f, "dev:{}", dev),
        }
    }
}

/// Supported ingestion variants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum InputVariant {
    PhysicalDisc { drive: DriveRef },
    DiscImage { image: PathBuf },
    BdmvFolder { root: PathBuf },
    /// Per-track container files, in file-name order
    TrackFolder { files: Vec<PathBuf> },
    SingleContainerFile { file: PathBuf },
}

impl InputVariant {
    /// Only an optical drive is an exclusively held resource
    pub fn uses_optical_drive(&self) -> bool {
        matches!(self, InputVariant::PhysicalDisc { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            InputVariant::PhysicalDisc { .. } => "PhysicalDisc",
            InputVariant::DiscImage { .. } => "DiscImage",
            InputVariant::BdmvFolder { .. } => "BDMVFolder",
            InputVariant::TrackFolder { .. } => "TrackFolder",
            InputVariant::SingleContainerFile { .. } => "SingleContainerFile",
        }
    }
}

/// Classify an input path (or drive reference).
///
/// Priority: disc image extension, `BDMV` signature, folder of per-track
/// containers, single container file, optical drive reference.
pub fn detect(input: &str) -> Result<InputVariant, DetectError> {
    let cleaned = input.trim().trim_matches('"');
    if cleaned.is_empty() {
        return Err(unrecognized(input, "empty input"));
    }
    let path = Path::new(cleaned);

    if has_extension(path, DISC_IMAGE_EXTENSIONS) && path.is_file() {
        debug!("Detected disc image: {:?}", path);
        return Ok(InputVariant::DiscImage {
            image: path.to_path_buf(),
        });
    }

    if path.is_dir() {
        return detect_directory(input, path);
    }

    if path.is_file() {
        if has_extension(path, CONTAINER_EXTENSIONS) {
            debug!("Detected single container file: {:?}", path);
            return Ok(InputVariant::SingleContainerFile {
                file: path.to_path_buf(),
            });
        }
        return Err(unrecognized(
            input,
            "file is neither a disc image nor a supported container (mkv, mka, m4a, mp4)",
        ));
    }

    if let Some(drive) = parse_drive_ref(cleaned) {
        debug!("Detected optical drive reference: {}", drive);
        return Ok(InputVariant::PhysicalDisc { drive });
    }

    Err(unrecognized(input, "path does not exist and is not a drive reference"))
}

fn detect_directory(input: &str, dir: &Path) -> Result<InputVariant, DetectError> {
    if dir.join("BDMV").is_dir() {
        debug!("Detected BDMV folder: {:?}", dir);
        return Ok(InputVariant::BdmvFolder {
            root: dir.to_path_buf(),
        });
    }

    let entries = fs::read_dir(dir).map_err(|e| DetectError::Inaccessible {
        input: input.to_string(),
        reason: e.to_string(),
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DetectError::Inaccessible {
            input: input.to_string(),
            reason: e.to_string(),
        })?;
        let path = entry.path();
        if path.is_file() && has_extension(&path, CONTAINER_EXTENSIONS) {
            files.push(path);
        }
    }

    if files.is_empty() {
        return Err(unrecognized(
            input,
            "folder has no BDMV directory and no per-track container files",
        ));
    }

    // One file is a chaptered release, not a folder of tracks
    if files.len() == 1 {
        let file = files.remove(0);
        debug!("Detected folder holding a single container: {:?}", file);
        return Ok(InputVariant::SingleContainerFile { file });
    }

    // Source order is file-name order
    files.sort();
    debug!("Detected track folder with {} file(s): {:?}", files.len(), dir);
    Ok(InputVariant::TrackFolder { files })
}

/// Parse `0`, `-1` (auto), `disc:N`, `/dev/sr0`, `D:` style drive references
pub fn parse_drive_ref(raw: &str) -> Option<DriveRef> {
    let raw = raw.trim();

    if let Ok(index) = raw.parse::<i64>() {
        return match index {
            -1 => Some(DriveRef::Auto),
            n if n >= 0 && n <= u32::MAX as i64 => Some(DriveRef::Index(n as u32)),
            _ => None,
        };
    }

    if let Some(rest) = raw.strip_prefix("disc:") {
        return rest.parse::<u32>().ok().map(DriveRef::Index);
    }

    let lower = raw.to_lowercase();
    let is_unix_device = ["/dev/sr", "/dev/cdrom", "/dev/dvd", "/dev/disk", "/dev/rdisk"]
        .iter()
        .any(|prefix| lower.starts_with(prefix));
    if is_unix_device {
        return Some(DriveRef::Device(raw.to_string()));
    }

    // Windows drive letter, optionally as \\.\X:
    let letter_part = raw.strip_prefix(r"\\.\").unwrap_or(raw);
    let letter_part = letter_part.trim_end_matches('\\');
    let bytes = letter_part.as_bytes();
    if bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Some(DriveRef::Device(letter_part.to_uppercase()));
    }

    None
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn unrecognized(input: &str, reason: &str) -> DetectError {
    DetectError::UnrecognizedInput {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}
