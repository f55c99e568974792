use crate::metadata::cover_art::{self, CoverArt};
use crate::metadata::normalize::normalize;
use crate::metadata::resolver::{ArtSource, CatalogService};
use crate::metadata::MetadataError;
use crate::models::{CatalogSource, MetadataCandidate};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

const ITUNES_SEARCH: &str = "https://itunes.apple.com/search";
/// Several albums are fetched as a buffer against Apple's fuzzy search
const MAX_ALBUMS: usize = 5;

/// Secondary catalog and artwork fallback: the iTunes Search API
pub struct ITunesClient {
    client: Client,
    search_url: String,
}

impl ITunesClient {
    pub fn new(client: Client) -> Self {
        Self::with_search_url(client, ITUNES_SEARCH)
    }

    pub fn with_search_url(client: Client, search_url: &str) -> Self {
        Self {
            client,
            search_url: search_url.to_string(),
        }
    }

    async fn search_albums(&self, term: &str) -> Result<serde_json::Value, MetadataError> {
        let limit = MAX_ALBUMS.to_string();
        let response = self
            .client
            .get(&self.search_url)
            .query(&[("term", term), ("entity", "album"), ("limit", limit.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(MetadataError::Status {
                service: "iTunes".to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.json::<serde_json::Value>().await?)
    }
}

/// Swap the 100px artwork URL for the 1200px rendition
pub fn high_res_artwork(url: &str) -> String {
    url.replace("100x100bb", "1200x1200bb")
}

pub fn parse_albums(json: &serde_json::Value) -> Vec<MetadataCandidate> {
    let Some(results) = json.get("results").and_then(|r| r.as_array()) else {
        return Vec::new();
    };

    results
        .iter()
        .take(MAX_ALBUMS)
        .filter_map(|result| {
            let id = result.get("collectionId").and_then(|id| {
                id.as_u64()
                    .map(|n| n.to_string())
                    .or_else(|| id.as_str().map(str::to_string))
            })?;
            let album = result.get("collectionName")?.as_str()?.to_string();
            let artist = result.get("artistName")?.as_str()?.to_string();
            let year = result
                .get("releaseDate")
                .and_then(|d| d.as_str())
                .map(|d| d.chars().take(4).collect::<String>())
                .filter(|y| y.len() == 4);
            let art_urls = result
                .get("artworkUrl100")
                .and_then(|u| u.as_str())
                .map(|u| vec![high_res_artwork(u)])
                .unwrap_or_default();
            Some(MetadataCandidate {
                source: CatalogSource::ITunes,
                catalog_id: id,
                artist,
                album,
                year,
                confidence: 0.0,
                art_urls,
            })
        })
        .collect()
}

#[async_trait]
impl CatalogService for ITunesClient {
    fn source(&self) -> CatalogSource {
        CatalogSource::ITunes
    }

    async fn search(&self, artist: &str, album: &str) -> Result<Vec<MetadataCandidate>, MetadataError> {
        info!("iTunes: searching for {} - {}", artist, album);
        let json = self.search_albums(&format!("{} {}", artist, album)).await?;
        let candidates = parse_albums(&json);
        info!("iTunes: {} album(s)", candidates.len());
        Ok(candidates)
    }
}

#[async_trait]
impl ArtSource for ITunesClient {
    fn name(&self) -> &'static str {
        "iTunes"
    }

    /// Artwork of the candidate itself when it came from iTunes, otherwise of
    /// the first iTunes album whose names contain the candidate's
    async fn fetch_art(&self, candidate: &MetadataCandidate) -> Result<Option<CoverArt>, MetadataError> {
        let urls = if candidate.source == CatalogSource::ITunes {
            candidate.art_urls.clone()
        } else {
            let json = self
                .search_albums(&format!("{} {}", candidate.artist, candidate.album))
                .await?;
            let target_artist = normalize(&candidate.artist);
            let target_album = normalize(&candidate.album);
            parse_albums(&json)
                .into_iter()
                .filter(|found| {
                    let matches = normalize(&found.artist).contains(&target_artist)
                        && normalize(&found.album).contains(&target_album);
                    if !matches {
                        debug!("Skipping iTunes mismatch: {} - {}", found.artist, found.album);
                    }
                    matches
                })
                .flat_map(|found| found.art_urls)
                .collect()
        };

        for url in urls {
            match cover_art::download_and_accept(&self.client, &url).await {
                Ok(art) => return Ok(Some(art)),
                Err(e) => debug!("iTunes artwork {} not usable: {}", url, e),
            }
        }
        Ok(None)
    }
}
