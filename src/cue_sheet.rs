//! Cue sheets for the single-file gapless output

use crate::models::{ResolvedMetadata, Track};
use std::fmt::Write as _;
use std::path::Path;

/// Cue timecodes count 75 frames per second
const FRAMES_PER_SECOND: u64 = 75;

/// One `TRACK` block
#[derive(Debug, Clone, PartialEq)]
pub struct CueTrack {
    pub number: u32,
    pub title: String,
    pub start_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CueSheet {
    pub performer: String,
    pub title: String,
    pub date: Option<String>,
    pub file_name: String,
    pub tracks: Vec<CueTrack>,
}

impl CueSheet {
    /// Build the sheet for an output container.
    ///
    /// Track starts are the offsets computed at extraction; titles come from
    /// the first catalog track list of matching length, else `Track N`.
    pub fn build(metadata: &ResolvedMetadata, tracks: &[Track], file_name: &str) -> Self {
        let titles = metadata.titles_for(tracks.len());
        let tracks = tracks
            .iter()
            .enumerate()
            .map(|(i, track)| CueTrack {
                number: track.index,
                title: titles
                    .and_then(|t| t.get(i))
                    .cloned()
                    .unwrap_or_else(|| format!("Track {}", track.index)),
                start_ms: track.offset_ms,
            })
            .collect();

        CueSheet {
            performer: metadata.artist.clone(),
            title: format!("{} (Atmos)", metadata.album),
            date: metadata.year.clone(),
            file_name: file_name.to_string(),
            tracks,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "PERFORMER \"{}\"", quoted(&self.performer));
        let _ = writeln!(out, "TITLE \"{}\"", quoted(&self.title));
        let _ = writeln!(out, "REM DATE {}", self.date.as_deref().unwrap_or("Unknown"));
        let _ = writeln!(out, "FILE \"{}\" WAVE", quoted(&self.file_name));
        for track in &self.tracks {
            let _ = writeln!(out, "  TRACK {:02} AUDIO", track.number);
            let _ = writeln!(out, "    TITLE \"{}\"", quoted(&track.title));
            let _ = writeln!(out, "    INDEX 01 {}", timecode(track.start_ms));
        }
        out
    }

    pub async fn write_to(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::write(path, self.render()).await
    }
}

/// Milliseconds to `MM:SS:FF`. Minutes are not wrapped at 60.
pub fn timecode(ms: u64) -> String {
    let minutes = ms / 60_000;
    let seconds = (ms / 1000) % 60;
    let frames = (ms % 1000) * FRAMES_PER_SECOND / 1000;
    format!("{:02}:{:02}:{:02}", minutes, seconds, frames)
}

/// Cue strings cannot escape double quotes
fn quoted(value: &str) -> String {
    value.replace('"', "'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timecode() {
        assert_eq!(timecode(0), "00:00:00");
        assert_eq!(timecode(61_500), "01:01:37");
        assert_eq!(timecode(999), "00:00:74");
        assert_eq!(timecode(75 * 60_000 + 2_000), "75:02:00");
    }

    #[test]
    fn test_index_follows_cumulative_offsets() {
        let durations = [
            Duration::from_secs(200),
            Duration::from_millis(187_400),
            Duration::from_secs(95),
        ];
        let tracks = Track::sequence(&durations);
        let meta = ResolvedMetadata::from_hints("Artist", "Album");
        let sheet = CueSheet::build(&meta, &tracks, "Album (Atmos).m4a");

        let starts: Vec<u64> = sheet.tracks.iter().map(|t| t.start_ms).collect();
        assert_eq!(starts, vec![0, 200_000, 387_400]);
        assert!(starts.windows(2).all(|w| w[0] < w[1]));

        let text = sheet.render();
        assert!(text.contains("    INDEX 01 03:20:00"));
        assert!(text.contains("    INDEX 01 06:27:30"));
        assert!(text.contains("TITLE \"Track 3\""));
        assert!(text.contains("REM DATE Unknown"));
    }

    #[test]
    fn test_uses_catalog_titles_of_matching_length() {
        let tracks = Track::sequence(&[Duration::from_secs(10), Duration::from_secs(20)]);
        let mut meta = ResolvedMetadata::from_hints("Pink Floyd", "The Wall");
        meta.year = Some("1979".into());
        meta.track_lists = vec![
            vec!["Only One".into()],
            vec!["In the Flesh?".into(), "The \"Thin\" Ice".into()],
        ];
        let text = CueSheet::build(&meta, &tracks, "The Wall (Atmos).m4a").render();

        let expected = "PERFORMER \"Pink Floyd\"\n\
                        TITLE \"The Wall (Atmos)\"\n\
                        REM DATE 1979\n\
                        FILE \"The Wall (Atmos).m4a\" WAVE\n  \
                        TRACK 01 AUDIO\n    \
                        TITLE \"In the Flesh?\"\n    \
                        INDEX 01 00:00:00\n  \
                        TRACK 02 AUDIO\n    \
                        TITLE \"The 'Thin' Ice\"\n    \
                        INDEX 01 00:10:00\n";
        assert_eq!(text, expected);
    }
}
