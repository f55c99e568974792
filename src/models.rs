use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One audio stream of a release, in source order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Track {
    /// 1-based position in the source
    pub index: u32,
    pub duration_ms: u64,
    /// Start within the final single-file container: sum of preceding durations
    pub offset_ms: u64,
}

impl Track {
    /// Build the ordered track list from per-track durations.
    ///
    /// Offsets are purely additive over the given durations; nothing is
    /// re-measured after transcoding.
    pub fn sequence(durations: &[Duration]) -> Vec<Track> {
        let mut offset_ms = 0u64;
        durations
            .iter()
            .enumerate()
            .map(|(i, duration)| {
                let duration_ms = duration.as_millis() as u64;
                let track = Track {
                    index: i as u32 + 1,
                    duration_ms,
                    offset_ms,
                };
                offset_ms += duration_ms;
                track
            })
            .collect()
    }
}

/// Total running time of a track list
pub fn total_duration(tracks: &[Track]) -> Duration {
    Duration::from_millis(tracks.iter().map(|t| t.duration_ms).sum())
}

/// What ExtractionStage hands to TranscodeStage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedRelease {
    /// Containers holding the Atmos audio, in playback order. One entry for
    /// disc rips and single files, one per track for track folders.
    pub sources: Vec<PathBuf>,
    pub tracks: Vec<Track>,
}

/// Which service a candidate came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CatalogSource {
    MusicBrainz,
    ITunes,
}

impl std::fmt::Display for CatalogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogSource::MusicBrainz => write!(f, "MusicBrainz"),
            CatalogSource::ITunes => write!(f, "iTunes"),
        }
    }
}

/// One lookup result, scored against the user's hints
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataCandidate {
    pub source: CatalogSource,
    /// MusicBrainz release-group MBID or iTunes collection id
    pub catalog_id: String,
    pub artist: String,
    pub album: String,
    pub year: Option<String>,
    /// 0.0..=1.0, filled in by the resolver
    pub confidence: f64,
    pub art_urls: Vec<String>,
}

/// Where the final tags came from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetadataOrigin {
    Catalog {
        source: CatalogSource,
        catalog_id: String,
    },
    /// Nothing matched; the user's hints are used verbatim
    Hints,
}

/// Metadata chosen for a job. Persisted with the job so a transcode retry
/// needs no network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedMetadata {
    pub artist: String,
    pub album: String,
    pub year: Option<String>,
    pub confidence: f64,
    pub origin: MetadataOrigin,
    /// Track titles of each official release of the chosen identity
    #[serde(default)]
    pub track_lists: Vec<Vec<String>>,
}

impl ResolvedMetadata {
    /// The fallback sentinel: hints verbatim, no art
    pub fn from_hints(artist: &str, album: &str) -> Self {
        Self {
            artist: artist.to_string(),
            album: album.to_string(),
            year: None,
            confidence: 0.0,
            origin: MetadataOrigin::Hints,
            track_lists: Vec::new(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.origin, MetadataOrigin::Hints)
    }

    /// Titles from the first track list whose length matches the release
    pub fn titles_for(&self, track_count: usize) -> Option<&[String]> {
        self.track_lists
            .iter()
            .find(|list| list.len() == track_count)
            .map(|list| list.as_slice())
    }
}

/// The three artifacts of a finished job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputPaths {
    pub audio: PathBuf,
    pub cue: PathBuf,
    /// Absent when no acceptable art was found
    pub cover: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_offsets_are_cumulative() {
        let durations = [
            Duration::from_millis(245_500),
            Duration::from_millis(12_000),
            Duration::from_millis(301_250),
            Duration::from_millis(1),
        ];
        let tracks = Track::sequence(&durations);

        let mut expected_offset = 0;
        for (k, track) in tracks.iter().enumerate() {
            assert_eq!(track.index as usize, k + 1);
            assert_eq!(track.offset_ms, expected_offset);
            expected_offset += durations[k].as_millis() as u64;
        }
        for pair in tracks.windows(2) {
            assert!(pair[1].offset_ms > pair[0].offset_ms);
        }
        assert_eq!(total_duration(&tracks).as_millis() as u64, expected_offset);
    }

    #[test]
    fn test_titles_for_matches_track_count() {
        let mut meta = ResolvedMetadata::from_hints("a", "b");
        assert!(meta.is_fallback());
        meta.track_lists = vec![
            vec!["One".into(), "Two".into(), "Three".into()],
            vec!["One".into(), "Two".into()],
        ];
        assert_eq!(meta.titles_for(2).unwrap(), &["One", "Two"]);
        assert!(meta.titles_for(5).is_none());
    }
}
