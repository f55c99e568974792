//! String normalization and similarity for fuzzy release matching

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Weight of a containment match relative to its length ratio
const CONTAINMENT_WEIGHT: f64 = 0.85;

/// Fold a string for comparison.
///
/// NFKD decomposition (so "ö" becomes "o" and full-width letters become
/// ASCII), combining marks stripped, lowercased, `&` spelled out, every
/// non-alphanumeric character turned into a space, whitespace collapsed.
/// Letters of any script survive.
pub fn normalize(s: &str) -> String {
    let folded: String = s
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .replace('&', " and ")
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Similarity of two strings after normalization, 0.0..=1.0.
///
/// Exact matches score 1.0; otherwise the better of the normalized
/// Levenshtein similarity and a damped length ratio when one string contains
/// the other ("Abbey Road" vs "Abbey Road (Remastered)").
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);

    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let edit = strsim::normalized_levenshtein(&a, &b);

    let containment = if a.contains(&b) || b.contains(&a) {
        let (len_a, len_b) = (a.chars().count() as f64, b.chars().count() as f64);
        CONTAINMENT_WEIGHT * len_a.min(len_b) / len_a.max(len_b)
    } else {
        0.0
    };

    edit.max(containment).min(1.0)
}

/// Candidate score: mean of artist and album similarity
pub fn score(hint_artist: &str, hint_album: &str, artist: &str, album: &str) -> f64 {
    (similarity(hint_artist, artist) + similarity(hint_album, album)) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("Mötley Crüe"), "motley crue");
        assert_eq!(normalize("Simon & Garfunkel"), "simon and garfunkel");
        assert_eq!(normalize("  AC/DC -- Back   in Black! "), "ac dc back in black");
        assert_eq!(normalize("Ｆｕｌｌ"), "full");
        assert_eq!(normalize("Сплин"), "сплин");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_exact_after_normalization_is_one() {
        assert_eq!(similarity("The Wall", "the wall"), 1.0);
        assert_eq!(similarity("Beyoncé", "BEYONCE"), 1.0);
    }

    #[test]
    fn test_misspellings_score_high() {
        let s = score("Pink Floydd", "The Wal", "Pink Floyd", "The Wall");
        assert!(s > 0.85, "score was {}", s);
        assert!(s < 1.0);
    }

    #[test]
    fn test_exact_beats_partial() {
        let exact = score("Pink Floyd", "The Wall", "Pink Floyd", "The Wall");
        let pool = [
            ("Pink Floyd", "The Wall (Live)"),
            ("Pink Floyd", "Wall"),
            ("Pink Floyd Tribute", "The Wall"),
            ("Roger Waters", "The Wall Live in Berlin"),
        ];
        for (artist, album) in pool {
            assert!(exact >= score("Pink Floyd", "The Wall", artist, album));
        }
    }

    #[test]
    fn test_containment_is_damped() {
        let s = similarity("Abbey Road", "Abbey Road Super Deluxe Edition");
        assert!(s > 0.2 && s < 0.85);
        assert_eq!(similarity("", "anything"), 0.0);
        assert_eq!(similarity("", ""), 1.0);
    }
}
