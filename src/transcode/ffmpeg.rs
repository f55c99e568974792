// # Atmos remux
//
// The Atmos stream is copied bit-for-bit into an MP4 container. Nothing here
// re-encodes audio; `-c:a copy` is what keeps the object metadata intact.

use crate::models::ResolvedMetadata;
use std::ffi::OsString;
use std::path::Path;

/// Arguments for the final stream-copy remux.
///
/// `cover` is embedded as an attached picture when present. Chapters are
/// dropped; track boundaries live in the cue sheet.
pub fn remux_args(
    master: &Path,
    stream_index: u32,
    cover: Option<&Path>,
    metadata: &ResolvedMetadata,
    out: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "warning", "-stats"]
        .into_iter()
        .map(OsString::from)
        .collect();

    args.push("-i".into());
    args.push(master.as_os_str().to_os_string());
    if let Some(cover) = cover {
        args.push("-i".into());
        args.push(cover.as_os_str().to_os_string());
    }

    args.push("-map".into());
    args.push(format!("0:{}", stream_index).into());
    if cover.is_some() {
        for a in ["-map", "1:v", "-c:v", "copy", "-disposition:v:0", "attached_pic"] {
            args.push(a.into());
        }
    }

    for (key, value) in tags(metadata) {
        args.push("-metadata".into());
        args.push(format!("{}={}", key, value).into());
    }

    for a in [
        "-c:a",
        "copy",
        "-f",
        "mp4",
        "-movflags",
        "+faststart",
        "-strict",
        "-2",
        "-fflags",
        "+genpts",
        "-map_chapters",
        "-1",
        "-y",
    ] {
        args.push(a.into());
    }
    args.push(out.as_os_str().to_os_string());
    args
}

/// Container tags, taken verbatim from the resolved metadata
pub fn tags(metadata: &ResolvedMetadata) -> Vec<(&'static str, String)> {
    let mut tags = vec![
        ("title", metadata.album.clone()),
        ("artist", metadata.artist.clone()),
        ("album_artist", metadata.artist.clone()),
        ("album", metadata.album.clone()),
    ];
    if let Some(year) = &metadata.year {
        tags.push(("date", year.clone()));
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    fn metadata_value(args: &[String], key: &str) -> Option<String> {
        args.windows(2)
            .filter(|w| w[0] == "-metadata")
            .find_map(|w| w[1].strip_prefix(&format!("{}=", key)).map(str::to_string))
    }

    #[test]
    fn test_hints_are_written_verbatim_on_fallback() {
        for (artist, album) in [("", ""), ("Sigur Rós", "( )"), ("AC/DC", "Back in Black: \"Live\"")] {
            let meta = ResolvedMetadata::from_hints(artist, album);
            let args = strings(&remux_args(
                Path::new("/ws/title_t00.mkv"),
                1,
                None,
                &meta,
                Path::new("/lib/out.m4a"),
            ));
            assert_eq!(metadata_value(&args, "artist").as_deref(), Some(artist));
            assert_eq!(metadata_value(&args, "album").as_deref(), Some(album));
            assert_eq!(metadata_value(&args, "title").as_deref(), Some(album));
            assert_eq!(metadata_value(&args, "date"), None);
        }
    }

    #[test]
    fn test_stream_copy_without_chapters() {
        let meta = ResolvedMetadata::from_hints("A", "B");
        let args = strings(&remux_args(
            Path::new("/ws/master.mkv"),
            2,
            None,
            &meta,
            Path::new("/lib/B (Atmos).m4a"),
        ));
        let joined = args.join(" ");
        assert!(joined.contains("-map 0:2"));
        assert!(joined.contains("-c:a copy"));
        assert!(joined.contains("-map_chapters -1"));
        assert!(!joined.contains("attached_pic"));
        assert_eq!(args.last().map(String::as_str), Some("/lib/B (Atmos).m4a"));
    }

    #[test]
    fn test_cover_is_attached() {
        let mut meta = ResolvedMetadata::from_hints("A", "B");
        meta.year = Some("1979".into());
        let args = strings(&remux_args(
            Path::new("/ws/master.mkv"),
            1,
            Some(Path::new("/ws/cover.jpg")),
            &meta,
            Path::new("/lib/out.m4a"),
        ));
        let joined = args.join(" ");
        assert!(joined.contains("-i /ws/master.mkv -i /ws/cover.jpg"));
        assert!(joined.contains("-map 1:v -c:v copy -disposition:v:0 attached_pic"));
        assert_eq!(metadata_value(&args, "date").as_deref(), Some("1979"));
    }
}
