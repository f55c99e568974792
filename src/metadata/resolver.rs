//! Resolution chain: primary catalog, secondary catalog, then the user's hints.
//!
//! Each link returns either a confident candidate or a reason to defer to the
//! next one. Network failures and timeouts are deferrals, never errors.

use crate::config::Config;
use crate::metadata::cover_art::{CoverArt, CoverArtArchive};
use crate::metadata::itunes::ITunesClient;
use crate::metadata::musicbrainz::MusicBrainzClient;
use crate::metadata::normalize;
use crate::metadata::MetadataError;
use crate::models::{CatalogSource, MetadataCandidate, MetadataOrigin, ResolvedMetadata};
use async_trait::async_trait;
use reqwest::Client;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Extra data for a chosen identity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReleaseDetails {
    pub track_lists: Vec<Vec<String>>,
    pub year: Option<String>,
}

/// A read-only catalog search
#[async_trait]
pub trait CatalogService: Send + Sync {
    fn source(&self) -> CatalogSource;

    async fn search(&self, artist: &str, album: &str) -> Result<Vec<MetadataCandidate>, MetadataError>;

    async fn release_details(
        &self,
        _candidate: &MetadataCandidate,
    ) -> Result<ReleaseDetails, MetadataError> {
        Ok(ReleaseDetails::default())
    }
}

/// Somewhere cover art for a candidate may be found
#[async_trait]
pub trait ArtSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Validated art for the candidate, or None if this source has none
    async fn fetch_art(&self, candidate: &MetadataCandidate) -> Result<Option<CoverArt>, MetadataError>;
}

/// One link of the chain
#[derive(Debug)]
pub enum Resolution {
    Confident {
        candidate: MetadataCandidate,
        /// Art already looked up while breaking a tie
        art: Option<Option<CoverArt>>,
    },
    Defer(String),
}

impl Resolution {
    fn confident(candidate: MetadataCandidate) -> Self {
        Resolution::Confident {
            candidate,
            art: None,
        }
    }
}

/// What the resolver hands to TranscodeStage
#[derive(Debug, Clone)]
pub struct ResolverOutcome {
    pub metadata: ResolvedMetadata,
    pub art: Option<CoverArt>,
    /// Set when the hints were used verbatim, with why
    pub degraded: Option<String>,
}

pub struct MetadataResolver {
    primary: Arc<dyn CatalogService>,
    secondary: Arc<dyn CatalogService>,
    archive: Arc<dyn ArtSource>,
    fallback_art: Arc<dyn ArtSource>,
    min_similarity: f64,
    timeout: Duration,
}

impl MetadataResolver {
    pub fn new(
        primary: Arc<dyn CatalogService>,
        secondary: Arc<dyn CatalogService>,
        archive: Arc<dyn ArtSource>,
        fallback_art: Arc<dyn ArtSource>,
        min_similarity: f64,
        timeout: Duration,
    ) -> Self {
        Self {
            primary,
            secondary,
            archive,
            fallback_art,
            min_similarity,
            timeout,
        }
    }

    /// Resolver against the live services, sharing one HTTP client
    pub fn from_config(config: &Config, client: Client) -> Self {
        let itunes = Arc::new(ITunesClient::new(client.clone()));
        Self::new(
            Arc::new(MusicBrainzClient::new(client.clone())),
            itunes.clone(),
            Arc::new(CoverArtArchive::new(client)),
            itunes,
            config.min_similarity,
            config.network_timeout,
        )
    }

    /// Resolve hints to an identity with art. Never fails: exhausting the
    /// chain yields the hints verbatim with no art.
    pub async fn resolve(&self, artist: &str, album: &str) -> ResolverOutcome {
        if artist.trim().is_empty() && album.trim().is_empty() {
            return fallback(artist, album, "no artist/album hints given".to_string());
        }

        let mut reasons = Vec::new();
        for service in [&self.primary, &self.secondary] {
            match self.query(service.as_ref(), artist, album).await {
                Resolution::Confident { candidate, art } => {
                    return self.finish(service.as_ref(), candidate, art).await;
                }
                Resolution::Defer(reason) => {
                    info!("{}: {}", service.source(), reason);
                    reasons.push(format!("{}: {}", service.source(), reason));
                }
            }
        }

        fallback(artist, album, reasons.join("; "))
    }

    /// Search one catalog and pick the best candidate above threshold
    async fn query(&self, service: &dyn CatalogService, artist: &str, album: &str) -> Resolution {
        let candidates = match self.bounded(service.search(artist, album)).await {
            Ok(candidates) => candidates,
            Err(e) => return Resolution::Defer(e.to_string()),
        };

        let ranked = rank_candidates(artist, album, candidates, self.min_similarity);
        let Some(best) = ranked.first() else {
            return Resolution::Defer("no candidate above the similarity threshold".to_string());
        };

        let tied: Vec<&MetadataCandidate> = ranked
            .iter()
            .take_while(|c| c.confidence == best.confidence)
            .collect();
        if tied.len() == 1 {
            return Resolution::confident(best.clone());
        }

        // Exact tie: the first candidate with usable high-res art wins
        debug!("{} candidates tied at {:.3}", tied.len(), best.confidence);
        for candidate in &tied {
            if let Some(art) = self.art_for(candidate).await {
                return Resolution::Confident {
                    candidate: (*candidate).clone(),
                    art: Some(Some(art)),
                };
            }
        }
        // Every tied candidate came up empty, the best one included
        Resolution::Confident {
            candidate: best.clone(),
            art: Some(None),
        }
    }

    async fn finish(
        &self,
        service: &dyn CatalogService,
        candidate: MetadataCandidate,
        prefetched_art: Option<Option<CoverArt>>,
    ) -> ResolverOutcome {
        info!(
            "Matched {} - {} ({} {}, confidence {:.2})",
            candidate.artist,
            candidate.album,
            candidate.source,
            candidate.catalog_id,
            candidate.confidence
        );

        let details = match self.bounded(service.release_details(&candidate)).await {
            Ok(details) => details,
            Err(e) => {
                warn!("Could not fetch release details for {}: {}", candidate.catalog_id, e);
                ReleaseDetails::default()
            }
        };

        let art = match prefetched_art {
            Some(art) => art,
            None => self.art_for(&candidate).await,
        };
        if art.is_none() {
            info!("No suitable art found for {} - {}", candidate.artist, candidate.album);
        }

        ResolverOutcome {
            metadata: ResolvedMetadata {
                artist: candidate.artist.clone(),
                album: candidate.album.clone(),
                year: candidate.year.clone().or(details.year),
                confidence: candidate.confidence,
                origin: MetadataOrigin::Catalog {
                    source: candidate.source,
                    catalog_id: candidate.catalog_id.clone(),
                },
                track_lists: details.track_lists,
            },
            art,
            degraded: None,
        }
    }

    /// Art archive first, then the secondary service's artwork
    async fn art_for(&self, candidate: &MetadataCandidate) -> Option<CoverArt> {
        for source in [&self.archive, &self.fallback_art] {
            match self.bounded(source.fetch_art(candidate)).await {
                Ok(Some(art)) => return Some(art),
                Ok(None) => debug!("{} has no art for {}", source.name(), candidate.catalog_id),
                Err(e) => debug!("{} failed for {}: {}", source.name(), candidate.catalog_id, e),
            }
        }
        None
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, MetadataError>
    where
        F: Future<Output = Result<T, MetadataError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(MetadataError::Timeout(format!(
                "request (limit {}s)",
                self.timeout.as_secs()
            ))),
        }
    }

    /// Art for a hint pair without the rest of the pipeline
    pub async fn cover_art_only(&self, artist: &str, album: &str) -> Option<CoverArt> {
        let outcome = self.resolve(artist, album).await;
        if outcome.art.is_some() {
            return outcome.art;
        }
        // Hints verbatim against the fallback service
        let hints = MetadataCandidate {
            source: CatalogSource::MusicBrainz,
            catalog_id: String::new(),
            artist: artist.to_string(),
            album: album.to_string(),
            year: None,
            confidence: 0.0,
            art_urls: Vec::new(),
        };
        self.bounded(self.fallback_art.fetch_art(&hints))
            .await
            .ok()
            .flatten()
    }
}

fn fallback(artist: &str, album: &str, reason: String) -> ResolverOutcome {
    warn!("Metadata resolution degraded to hints: {}", reason);
    ResolverOutcome {
        metadata: ResolvedMetadata::from_hints(artist, album),
        art: None,
        degraded: Some(reason),
    }
}

/// Score candidates against the hints, drop those under `min_similarity`, and
/// order by score then catalog id so equal inputs give equal output.
pub fn rank_candidates(
    artist: &str,
    album: &str,
    candidates: Vec<MetadataCandidate>,
    min_similarity: f64,
) -> Vec<MetadataCandidate> {
    let mut scored: Vec<MetadataCandidate> = candidates
        .into_iter()
        .map(|mut c| {
            c.confidence = normalize::score(artist, album, &c.artist, &c.album);
            debug!(
                "Candidate {} - {} ({}): {:.3}",
                c.artist, c.album, c.catalog_id, c.confidence
            );
            c
        })
        .filter(|c| c.confidence >= min_similarity)
        .collect();

    scored.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.catalog_id.cmp(&b.catalog_id))
    });
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn candidate(source: CatalogSource, id: &str, artist: &str, album: &str) -> MetadataCandidate {
        MetadataCandidate {
            source,
            catalog_id: id.to_string(),
            artist: artist.to_string(),
            album: album.to_string(),
            year: None,
            confidence: 0.0,
            art_urls: Vec::new(),
        }
    }

    struct FakeCatalog {
        source: CatalogSource,
        results: Vec<MetadataCandidate>,
        details: ReleaseDetails,
        delay: Option<Duration>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeCatalog {
        fn new(source: CatalogSource, results: Vec<MetadataCandidate>) -> Self {
            Self {
                source,
                results,
                details: ReleaseDetails::default(),
                delay: None,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CatalogService for FakeCatalog {
        fn source(&self) -> CatalogSource {
            self.source
        }

        async fn search(&self, _artist: &str, _album: &str) -> Result<Vec<MetadataCandidate>, MetadataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(MetadataError::Status {
                    service: "fake".into(),
                    status: 503,
                });
            }
            Ok(self.results.clone())
        }

        async fn release_details(&self, _c: &MetadataCandidate) -> Result<ReleaseDetails, MetadataError> {
            Ok(self.details.clone())
        }
    }

    #[derive(Default)]
    struct FakeArt {
        by_id: HashMap<String, CoverArt>,
        fetched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ArtSource for FakeArt {
        fn name(&self) -> &'static str {
            "fake art"
        }

        async fn fetch_art(&self, candidate: &MetadataCandidate) -> Result<Option<CoverArt>, MetadataError> {
            self.fetched.lock().unwrap().push(candidate.catalog_id.clone());
            Ok(self.by_id.get(&candidate.catalog_id).cloned())
        }
    }

    fn art(url: &str) -> CoverArt {
        CoverArt {
            url: url.to_string(),
            jpeg: vec![0xFF, 0xD8],
            width: 1200,
            height: 1200,
        }
    }

    fn resolver(
        primary: FakeCatalog,
        secondary: FakeCatalog,
        archive: FakeArt,
        fallback_art: FakeArt,
    ) -> MetadataResolver {
        MetadataResolver::new(
            Arc::new(primary),
            Arc::new(secondary),
            Arc::new(archive),
            Arc::new(fallback_art),
            0.75,
            Duration::from_millis(200),
        )
    }

    fn mb_pool() -> Vec<MetadataCandidate> {
        vec![
            candidate(CatalogSource::MusicBrainz, "rg-live", "Pink Floyd", "Is There Anybody Out There? The Wall Live"),
            candidate(CatalogSource::MusicBrainz, "rg-wall", "Pink Floyd", "The Wall"),
            candidate(CatalogSource::MusicBrainz, "rg-waters", "Roger Waters", "The Wall Live in Berlin"),
        ]
    }

    #[tokio::test]
    async fn test_misspelled_hints_match_catalog_entry() {
        let mut primary = FakeCatalog::new(CatalogSource::MusicBrainz, mb_pool());
        primary.details = ReleaseDetails {
            track_lists: vec![vec!["In the Flesh?".into(), "The Thin Ice".into()]],
            year: Some("1979".into()),
        };
        let mut archive = FakeArt::default();
        archive.by_id.insert("rg-wall".into(), art("caa"));

        let r = resolver(
            primary,
            FakeCatalog::new(CatalogSource::ITunes, vec![]),
            archive,
            FakeArt::default(),
        );
        let outcome = r.resolve("Pink Floydd", "The Wal").await;

        assert_eq!(outcome.metadata.artist, "Pink Floyd");
        assert_eq!(outcome.metadata.album, "The Wall");
        assert_eq!(outcome.metadata.year.as_deref(), Some("1979"));
        assert_eq!(outcome.metadata.track_lists.len(), 1);
        assert_eq!(outcome.art.unwrap().url, "caa");
        assert!(outcome.degraded.is_none());
    }

    #[tokio::test]
    async fn test_resolution_is_deterministic() {
        let mut first = None;
        for reversed in [false, true, false] {
            let mut pool = mb_pool();
            if reversed {
                pool.reverse();
            }
            let r = resolver(
                FakeCatalog::new(CatalogSource::MusicBrainz, pool),
                FakeCatalog::new(CatalogSource::ITunes, vec![]),
                FakeArt::default(),
                FakeArt::default(),
            );
            let chosen = r.resolve("pink floyd", "the wall").await.metadata;
            match &first {
                None => first = Some(chosen),
                Some(expected) => assert_eq!(&chosen, expected),
            }
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_secondary_catalog() {
        let primary = FakeCatalog::new(
            CatalogSource::MusicBrainz,
            vec![candidate(CatalogSource::MusicBrainz, "x", "Someone Else", "Other Album")],
        );
        let secondary = FakeCatalog::new(
            CatalogSource::ITunes,
            vec![candidate(CatalogSource::ITunes, "123", "Pink Floyd", "The Wall")],
        );
        let mut fallback_art = FakeArt::default();
        fallback_art.by_id.insert("123".into(), art("itunes"));

        let r = resolver(primary, secondary, FakeArt::default(), fallback_art);
        let outcome = r.resolve("Pink Floyd", "The Wall").await;
        assert_eq!(
            outcome.metadata.origin,
            MetadataOrigin::Catalog {
                source: CatalogSource::ITunes,
                catalog_id: "123".into()
            }
        );
        assert_eq!(outcome.art.unwrap().url, "itunes");
    }

    #[tokio::test]
    async fn test_timeouts_and_errors_degrade_to_hints() {
        let mut primary = FakeCatalog::new(CatalogSource::MusicBrainz, mb_pool());
        primary.delay = Some(Duration::from_secs(5));
        let mut secondary = FakeCatalog::new(CatalogSource::ITunes, vec![]);
        secondary.fail = true;

        let r = resolver(primary, secondary, FakeArt::default(), FakeArt::default());
        let outcome = r.resolve("Pink Floyd", "The Wall").await;

        assert!(outcome.metadata.is_fallback());
        assert_eq!(outcome.metadata.artist, "Pink Floyd");
        assert!(outcome.art.is_none());
        assert!(outcome.degraded.is_some());
    }

    #[tokio::test]
    async fn test_empty_hints_skip_lookups() {
        let primary = FakeCatalog::new(CatalogSource::MusicBrainz, mb_pool());
        let r = MetadataResolver::new(
            Arc::new(primary),
            Arc::new(FakeCatalog::new(CatalogSource::ITunes, vec![])),
            Arc::new(FakeArt::default()),
            Arc::new(FakeArt::default()),
            0.75,
            Duration::from_millis(200),
        );
        let outcome = r.resolve("", "").await;
        assert!(outcome.metadata.is_fallback());
        assert_eq!(outcome.metadata.artist, "");
    }

    #[tokio::test]
    async fn test_exact_tie_prefers_candidate_with_art() {
        let pool = vec![
            candidate(CatalogSource::MusicBrainz, "a-no-art", "Pink Floyd", "The Wall"),
            candidate(CatalogSource::MusicBrainz, "b-with-art", "Pink Floyd", "The Wall"),
        ];
        let mut archive = FakeArt::default();
        archive.by_id.insert("b-with-art".into(), art("caa-b"));

        let r = resolver(
            FakeCatalog::new(CatalogSource::MusicBrainz, pool),
            FakeCatalog::new(CatalogSource::ITunes, vec![]),
            archive,
            FakeArt::default(),
        );
        let outcome = r.resolve("Pink Floyd", "The Wall").await;
        assert_eq!(
            outcome.metadata.origin,
            MetadataOrigin::Catalog {
                source: CatalogSource::MusicBrainz,
                catalog_id: "b-with-art".into()
            }
        );
    }

    #[tokio::test]
    async fn test_tie_break_art_is_fetched_once() {
        let pool = vec![
            candidate(CatalogSource::MusicBrainz, "a-no-art", "Pink Floyd", "The Wall"),
            candidate(CatalogSource::MusicBrainz, "b-with-art", "Pink Floyd", "The Wall"),
        ];
        let mut archive = FakeArt::default();
        archive.by_id.insert("b-with-art".into(), art("caa-b"));
        let archive = Arc::new(archive);
        let fallback_art = Arc::new(FakeArt::default());

        let r = MetadataResolver::new(
            Arc::new(FakeCatalog::new(CatalogSource::MusicBrainz, pool)),
            Arc::new(FakeCatalog::new(CatalogSource::ITunes, vec![])),
            archive.clone(),
            fallback_art.clone(),
            0.75,
            Duration::from_millis(200),
        );
        let outcome = r.resolve("Pink Floyd", "The Wall").await;

        assert_eq!(outcome.art.unwrap().url, "caa-b");
        assert_eq!(
            *archive.fetched.lock().unwrap(),
            vec!["a-no-art".to_string(), "b-with-art".to_string()]
        );
        assert_eq!(*fallback_art.fetched.lock().unwrap(), vec!["a-no-art".to_string()]);
    }

    #[test]
    fn test_rank_discards_below_threshold() {
        let ranked = rank_candidates("Pink Floyd", "The Wall", mb_pool(), 0.75);
        assert_eq!(ranked[0].catalog_id, "rg-wall");
        assert_eq!(ranked[0].confidence, 1.0);
        assert!(ranked.iter().all(|c| c.confidence >= 0.75));
        assert!(!ranked.iter().any(|c| c.catalog_id == "rg-waters"));
    }
}
