use crate::metadata::resolver::{CatalogService, ReleaseDetails};
use crate::metadata::MetadataError;
use crate::models::{CatalogSource, MetadataCandidate};
use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

const MUSICBRAINZ_API: &str = "https://musicbrainz.org/ws/2";
/// Release groups considered per search
const MAX_RELEASE_GROUPS: usize = 5;
/// MusicBrainz allows one request per second per client
const MIN_REQUEST_SPACING: Duration = Duration::from_millis(1100);

/// Primary catalog: MusicBrainz release groups
pub struct MusicBrainzClient {
    client: Client,
    base_url: String,
    last_request: Mutex<Option<Instant>>,
}

impl MusicBrainzClient {
    pub fn new(client: Client) -> Self {
        Self::with_base_url(client, MUSICBRAINZ_API)
    }

    pub fn with_base_url(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            last_request: Mutex::new(None),
        }
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, MetadataError> {
        {
            let mut last = self.last_request.lock().await;
            if let Some(previous) = *last {
                let since = previous.elapsed();
                if since < MIN_REQUEST_SPACING {
                    tokio::time::sleep(MIN_REQUEST_SPACING - since).await;
                }
            }
            *last = Some(Instant::now());
        }

        debug!("MusicBrainz request: {}", url);
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(MetadataError::Status {
                service: "MusicBrainz".to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.json::<serde_json::Value>().await?)
    }
}

/// Lucene phrase query value with quotes and backslashes escaped
fn lucene_phrase(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Join an `artist-credit` array into the credited name
fn artist_credit_phrase(json: &serde_json::Value) -> Option<String> {
    let credits = json.get("artist-credit")?.as_array()?;
    let phrase: String = credits
        .iter()
        .map(|credit| {
            let name = credit
                .get("name")
                .and_then(|n| n.as_str())
                .or_else(|| {
                    credit
                        .get("artist")
                        .and_then(|a| a.get("name"))
                        .and_then(|n| n.as_str())
                })
                .unwrap_or("");
            let join = credit
                .get("joinphrase")
                .and_then(|j| j.as_str())
                .unwrap_or("");
            format!("{}{}", name, join)
        })
        .collect();
    let phrase = phrase.trim().to_string();
    (!phrase.is_empty()).then_some(phrase)
}

fn year_of(date: Option<&str>) -> Option<String> {
    let date = date?.trim();
    let year: String = date.chars().take(4).collect();
    (year.len() == 4 && year.chars().all(|c| c.is_ascii_digit())).then_some(year)
}

/// Parse a release-group search response into candidates
pub fn parse_release_groups(json: &serde_json::Value) -> Vec<MetadataCandidate> {
    let Some(groups) = json.get("release-groups").and_then(|g| g.as_array()) else {
        return Vec::new();
    };

    groups
        .iter()
        .take(MAX_RELEASE_GROUPS)
        .filter_map(|group| {
            let id = group.get("id")?.as_str()?.to_string();
            let title = group.get("title")?.as_str()?.to_string();
            let artist = artist_credit_phrase(group)?;
            Some(MetadataCandidate {
                source: CatalogSource::MusicBrainz,
                catalog_id: id,
                artist,
                album: title,
                year: year_of(group.get("first-release-date").and_then(|d| d.as_str())),
                confidence: 0.0,
                art_urls: Vec::new(),
            })
        })
        .collect()
}

/// Parse a release browse response: track titles of each official release,
/// and the earliest year seen
pub fn parse_release_browse(json: &serde_json::Value) -> ReleaseDetails {
    let mut details = ReleaseDetails::default();
    let Some(releases) = json.get("releases").and_then(|r| r.as_array()) else {
        return details;
    };

    for release in releases {
        if release.get("status").and_then(|s| s.as_str()) != Some("Official") {
            continue;
        }

        let titles: Vec<String> = release
            .get("media")
            .and_then(|m| m.as_array())
            .map(|media| {
                media
                    .iter()
                    .filter_map(|medium| medium.get("tracks").and_then(|t| t.as_array()))
                    .flatten()
                    .map(|track| {
                        track
                            .get("title")
                            .or_else(|| track.get("recording").and_then(|r| r.get("title")))
                            .and_then(|t| t.as_str())
                            .unwrap_or("")
                            .to_string()
                    })
                    .collect()
            })
            .unwrap_or_default();

        if !titles.is_empty() && !details.track_lists.contains(&titles) {
            details.track_lists.push(titles);
        }

        if let Some(year) = year_of(release.get("date").and_then(|d| d.as_str())) {
            if details.year.as_ref().map(|y| &year < y).unwrap_or(true) {
                details.year = Some(year);
            }
        }
    }

    details
}

#[async_trait]
impl CatalogService for MusicBrainzClient {
    fn source(&self) -> CatalogSource {
        CatalogSource::MusicBrainz
    }

    async fn search(&self, artist: &str, album: &str) -> Result<Vec<MetadataCandidate>, MetadataError> {
        info!("MusicBrainz: searching for {} - {}", artist, album);
        let query = format!(
            "artist:{} AND releasegroup:{}",
            lucene_phrase(artist),
            lucene_phrase(album)
        );
        let url = format!(
            "{}/release-group/?query={}&fmt=json&limit={}",
            self.base_url,
            urlencoding::encode(&query),
            MAX_RELEASE_GROUPS
        );
        let json = self.get_json(&url).await?;
        let candidates = parse_release_groups(&json);
        info!("MusicBrainz: {} release group(s)", candidates.len());
        Ok(candidates)
    }

    async fn release_details(
        &self,
        candidate: &MetadataCandidate,
    ) -> Result<ReleaseDetails, MetadataError> {
        let url = format!(
            "{}/release?release-group={}&inc=recordings&status=official&fmt=json&limit=25",
            self.base_url,
            urlencoding::encode(&candidate.catalog_id)
        );
        let json = self.get_json(&url).await?;
        let details = parse_release_browse(&json);
        debug!(
            "MusicBrainz: {} official track list(s) for {}",
            details.track_lists.len(),
            candidate.catalog_id
        );
        Ok(details)
    }
}
