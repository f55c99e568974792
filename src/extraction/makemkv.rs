//! MakeMKV scan and rip
//!
//! Only the Atmos title is ripped: titles are scored from the `SINFO` stream
//! descriptions of a robot-mode scan, and a disc without an Atmos title fails.

use crate::extraction::ExtractionError;
use crate::format_detector::DriveRef;
use crate::process::output::split_robot_fields;
use crate::process::{Invocation, MakeMkvParser, SilentParser, ToolRunner};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Lossless Atmos (TrueHD)
pub const SCORE_LOSSLESS_ATMOS: u32 = 1000;
/// Lossy Atmos (E-AC-3 JOC)
pub const SCORE_LOSSY_ATMOS: u32 = 500;

/// TINFO attribute id carrying a title's chapter count
const TINFO_CHAPTER_COUNT: &str = "8";
/// DRV visibility value of a drive with a disc inserted
const DRIVE_DISC_INSERTED: &str = "2";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TitleScore {
    pub score: u32,
    pub chapters: u32,
}

/// Score every title mentioned in a scan
pub fn score_titles(lines: &[String]) -> BTreeMap<u32, TitleScore> {
    let mut titles: BTreeMap<u32, TitleScore> = BTreeMap::new();

    for line in lines {
        if let Some(body) = line.strip_prefix("TINFO:") {
            let fields = split_robot_fields(body);
            let Some(title) = fields.first().and_then(|t| t.parse::<u32>().ok()) else {
                continue;
            };
            let entry = titles.entry(title).or_default();
            if fields.get(1).map(String::as_str) == Some(TINFO_CHAPTER_COUNT) {
                if let Some(count) = fields.get(3).and_then(|c| c.trim().parse().ok()) {
                    entry.chapters = count;
                }
            }
        } else if let Some(body) = line.strip_prefix("SINFO:") {
            let fields = split_robot_fields(body);
            let Some(title) = fields.first().and_then(|t| t.parse::<u32>().ok()) else {
                continue;
            };
            let score = if line.contains("A_TRUEHD") || line.contains("TrueHD Atmos") {
                SCORE_LOSSLESS_ATMOS
            } else if line.contains("A_EAC3") && line.contains("Atmos") {
                SCORE_LOSSY_ATMOS
            } else {
                0
            };
            let entry = titles.entry(title).or_default();
            entry.score = entry.score.max(score);
        }
    }

    titles
}

/// Pick the best-scoring title, breaking ties on chapter count then title index
pub fn pick_title(titles: &BTreeMap<u32, TitleScore>) -> Result<u32, ExtractionError> {
    let (title, best) = titles
        .iter()
        .max_by_key(|(index, s)| (s.score, s.chapters, std::cmp::Reverse(**index)))
        .ok_or(ExtractionError::NoTitles)?;

    if best.score < SCORE_LOSSY_ATMOS {
        return Err(ExtractionError::NoAtmosTitle {
            best_title: *title,
            score: best.score,
        });
    }
    Ok(*title)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveInfo {
    pub index: u32,
    pub has_disc: bool,
    pub drive_name: String,
    pub disc_label: String,
    pub device: String,
}

/// Parse `DRV:index,visible,enabled,flags,"drive","disc","device"` lines
pub fn parse_drives(lines: &[String]) -> Vec<DriveInfo> {
    lines
        .iter()
        .filter_map(|line| line.strip_prefix("DRV:"))
        .filter_map(|body| {
            let fields = split_robot_fields(body);
            let index = fields.first()?.parse::<u32>().ok()?;
            let drive_name = fields.get(4).cloned().unwrap_or_default();
            if drive_name.is_empty() {
                // Unused drive slot
                return None;
            }
            Some(DriveInfo {
                index,
                has_disc: fields.get(1).map(String::as_str) == Some(DRIVE_DISC_INSERTED),
                drive_name,
                disc_label: fields.get(5).cloned().unwrap_or_default(),
                device: fields.get(6).cloned().unwrap_or_default(),
            })
        })
        .collect()
}

/// MakeMKV source spec for each disc-like input
pub fn disc_source(drive: &DriveRef) -> Option<String> {
    match drive {
        DriveRef::Index(n) => Some(format!("disc:{}", n)),
        DriveRef::Device(dev) => Some(format!("dev:{}", dev)),
        DriveRef::Auto => None,
    }
}

pub fn image_source(image: &Path) -> String {
    format!("iso:{}", absolute(image).display())
}

pub fn bdmv_source(root: &Path) -> String {
    format!("file:{}", absolute(root).join("BDMV").display())
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Wraps the `makemkvcon` binary
pub struct MakeMkv<'a> {
    pub program: &'a Path,
    pub min_title_seconds: u32,
}

impl MakeMkv<'_> {
    /// Resolve `-1` to the first drive holding a disc
    pub async fn auto_detect_drive(&self, runner: &ToolRunner) -> Result<String, ExtractionError> {
        let output = runner
            .run(
                Invocation::new("makemkvcon", self.program)
                    .args(["-r", "info", "disc:9999"])
                    .capture(),
                &mut SilentParser,
            )
            .await?;

        let drives = parse_drives(&output.lines);
        debug!("Drives: {:?}", drives);
        let drive = drives
            .iter()
            .find(|d| d.has_disc)
            .ok_or(ExtractionError::NoDisc)?;
        runner.message(format!(
            "Using drive {} ({}) with disc '{}'",
            drive.index, drive.drive_name, drive.disc_label
        ));
        Ok(format!("disc:{}", drive.index))
    }

    /// Scan a source and return the Atmos title to rip
    pub async fn find_atmos_title(
        &self,
        runner: &ToolRunner,
        source: &str,
    ) -> Result<u32, ExtractionError> {
        runner.message("Scanning for Atmos titles...");
        let output = runner
            .run(
                Invocation::new("makemkvcon", self.program)
                    .args(["--progress=-stdout", "-r", "info", source])
                    .arg(format!("--minlength={}", self.min_title_seconds))
                    .capture(),
                &mut MakeMkvParser::new(),
            )
            .await?;

        let titles = score_titles(&output.lines);
        info!("MakeMKV title scores for {}: {:?}", source, titles);
        let title = pick_title(&titles)?;
        let best = titles.get(&title).cloned().unwrap_or_default();
        runner.message(format!(
            "Title {}: {} Atmos, {} chapter(s)",
            title,
            if best.score >= SCORE_LOSSLESS_ATMOS {
                "lossless"
            } else {
                "lossy"
            },
            best.chapters
        ));
        Ok(title)
    }

    /// Rip one title into `out_dir`; the largest file produced is the master
    pub async fn rip_title(
        &self,
        runner: &ToolRunner,
        source: &str,
        title: u32,
        out_dir: &Path,
    ) -> Result<PathBuf, ExtractionError> {
        runner.message(format!("Ripping title {}...", title));
        runner
            .run(
                Invocation::new("makemkvcon", self.program)
                    .args(["--progress=-stdout", "-r", "mkv", source])
                    .arg(title.to_string())
                    .arg(absolute(out_dir).as_os_str())
                    .arg(format!("--minlength={}", self.min_title_seconds)),
                &mut MakeMkvParser::new(),
            )
            .await?;

        keep_largest_mkv(out_dir)
    }
}

/// Keep the largest `.mkv` in `dir`, deleting the rest
pub fn keep_largest_mkv(dir: &Path) -> Result<PathBuf, ExtractionError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_mkv = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("mkv"))
            .unwrap_or(false);
        if is_mkv && entry.file_type()?.is_file() {
            files.push((entry.metadata()?.len(), path));
        }
    }

    files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    let mut files = files.into_iter();
    let (_, master) = files.next().ok_or(ExtractionError::NoOutput)?;
    for (_, other) in files {
        debug!("Removing extra rip output {:?}", other);
        std::fs::remove_file(other)?;
    }
    Ok(master)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_lossless_atmos_wins() {
        let scan = lines(&[
            "TINFO:0,8,0,\"12\"",
            "SINFO:0,1,1,6119,\"A_AC3\"",
            "SINFO:0,2,1,6119,\"A_EAC3\"",
            "SINFO:0,2,3,0,\"Dolby Digital Plus Atmos\"",
            "TINFO:1,8,0,\"10\"",
            "SINFO:1,1,1,6119,\"A_TRUEHD\"",
            "SINFO:1,1,3,0,\"TrueHD Atmos\"",
        ]);
        let titles = score_titles(&scan);
        assert_eq!(titles[&0].score, 0);
        assert_eq!(titles[&1].score, SCORE_LOSSLESS_ATMOS);
        assert_eq!(pick_title(&titles).unwrap(), 1);
    }

    #[test]
    fn test_lossy_atmos_line() {
        let scan = lines(&["SINFO:3,1,3,0,\"A_EAC3 Atmos\""]);
        let titles = score_titles(&scan);
        assert_eq!(titles[&3].score, SCORE_LOSSY_ATMOS);
        assert_eq!(pick_title(&titles).unwrap(), 3);
    }

    #[test]
    fn test_tie_broken_by_chapters() {
        let scan = lines(&[
            "TINFO:0,8,0,\"3\"",
            "SINFO:0,1,1,6119,\"A_TRUEHD\"",
            "TINFO:1,8,0,\"11\"",
            "SINFO:1,1,1,6119,\"A_TRUEHD\"",
        ]);
        assert_eq!(pick_title(&score_titles(&scan)).unwrap(), 1);
    }

    #[test]
    fn test_atmos_or_die() {
        let scan = lines(&["TINFO:0,8,0,\"12\"", "SINFO:0,1,1,6119,\"A_DTS\""]);
        assert!(matches!(
            pick_title(&score_titles(&scan)),
            Err(ExtractionError::NoAtmosTitle {
                best_title: 0,
                score: 0
            })
        ));
        assert!(matches!(
            pick_title(&BTreeMap::new()),
            Err(ExtractionError::NoTitles)
        ));
    }

    #[test]
    fn test_parse_drives() {
        let scan = lines(&[
            "DRV:0,0,999,0,\"DVD-RW GH24\",\"\",\"/dev/sr0\"",
            "DRV:1,2,999,12,\"BD-RE WH16NS60\",\"THE_WALL\",\"/dev/sr1\"",
            "DRV:2,256,999,0,\"\",\"\",\"\"",
        ]);
        let drives = parse_drives(&scan);
        assert_eq!(drives.len(), 2);
        assert!(!drives[0].has_disc);
        assert!(drives[1].has_disc);
        assert_eq!(drives[1].disc_label, "THE_WALL");
        assert_eq!(drives[1].device, "/dev/sr1");
    }

    #[test]
    fn test_sources() {
        assert_eq!(disc_source(&DriveRef::Index(1)).unwrap(), "disc:1");
        assert_eq!(
            disc_source(&DriveRef::Device("/dev/sr0".into())).unwrap(),
            "dev:/dev/sr0"
        );
        assert!(disc_source(&DriveRef::Auto).is_none());
        assert!(bdmv_source(Path::new("/media/disc")).ends_with("BDMV"));
        assert!(image_source(Path::new("/isos/wall.iso")).starts_with("iso:"));
    }

    #[test]
    fn test_keep_largest_mkv() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("title_t00.mkv"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("title_t01.mkv"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("title_t02.mkv"), vec![0u8; 1]).unwrap();

        let master = keep_largest_mkv(dir.path()).unwrap();
        assert!(master.ends_with("title_t01.mkv"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        let empty = tempfile::tempdir().unwrap();
        assert!(matches!(
            keep_largest_mkv(empty.path()),
            Err(ExtractionError::NoOutput)
        ));
    }
}
