use crate::metadata::resolver::ArtSource;
use crate::metadata::MetadataError;
use crate::models::{CatalogSource, MetadataCandidate};
use crate::network::upgrade_to_https;
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use reqwest::Client;
use std::path::Path;
use tracing::{debug, info};

const COVER_ART_ARCHIVE: &str = "https://coverartarchive.org";

/// Largest art download accepted
pub const MAX_ART_BYTES: u64 = 15 * 1024 * 1024;
/// Minimum width for "high resolution"
pub const MIN_ART_WIDTH: u32 = 1000;
const JPEG_QUALITY: u8 = 95;

/// Validated cover art, re-encoded as JPEG
#[derive(Debug, Clone, PartialEq)]
pub struct CoverArt {
    pub url: String,
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl CoverArt {
    pub async fn write_to(&self, path: &Path) -> Result<(), MetadataError> {
        tokio::fs::write(path, &self.jpeg).await?;
        info!(
            "Saved {}x{} cover to {:?}",
            self.width, self.height, path
        );
        Ok(())
    }
}

/// Check shape and size, then re-encode as RGB JPEG (any alpha channel dropped)
pub fn accept_art(url: &str, bytes: &[u8]) -> Result<CoverArt, MetadataError> {
    if bytes.len() as u64 > MAX_ART_BYTES {
        return Err(MetadataError::ArtRejected(format!(
            "{} bytes exceeds the {} byte cap",
            bytes.len(),
            MAX_ART_BYTES
        )));
    }

    let img = image::load_from_memory(bytes)?;
    let (width, height) = (img.width(), img.height());
    if height == 0 {
        return Err(MetadataError::ArtRejected("empty image".to_string()));
    }

    let aspect = width as f64 / height as f64;
    if !(aspect > 0.95 && aspect < 1.05) {
        return Err(MetadataError::ArtRejected(format!(
            "{}x{} is not square enough",
            width, height
        )));
    }
    if width < MIN_ART_WIDTH {
        return Err(MetadataError::ArtRejected(format!(
            "{}x{} is below {} px",
            width, height, MIN_ART_WIDTH
        )));
    }

    let rgb = img.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY).encode_image(&rgb)?;

    Ok(CoverArt {
        url: url.to_string(),
        jpeg,
        width,
        height,
    })
}

/// Download art, refusing anything over the size cap
pub async fn download_and_accept(client: &Client, url: &str) -> Result<CoverArt, MetadataError> {
    debug!("Downloading art: {}", url);
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(MetadataError::Status {
            service: "art download".to_string(),
            status: response.status().as_u16(),
        });
    }
    if let Some(length) = response.content_length() {
        if length > MAX_ART_BYTES {
            return Err(MetadataError::ArtRejected(format!(
                "{} announces {} bytes",
                url, length
            )));
        }
    }

    let bytes = response.bytes().await?;
    accept_art(url, &bytes)
}

/// Pick art URLs from a Cover Art Archive listing: front images first,
/// 1200px thumbnail preferred over the original
pub fn front_image_urls(json: &serde_json::Value) -> Vec<String> {
    let Some(images) = json.get("images").and_then(|i| i.as_array()) else {
        return Vec::new();
    };

    images
        .iter()
        .filter(|image| image.get("front").and_then(|f| f.as_bool()) == Some(true))
        .filter_map(|image| {
            image
                .get("thumbnails")
                .and_then(|t| t.get("1200"))
                .and_then(|u| u.as_str())
                .or_else(|| image.get("image").and_then(|u| u.as_str()))
                .map(upgrade_to_https)
        })
        .collect()
}

/// Art archive keyed by MusicBrainz release group
pub struct CoverArtArchive {
    client: Client,
    base_url: String,
}

impl CoverArtArchive {
    pub fn new(client: Client) -> Self {
        Self::with_base_url(client, COVER_ART_ARCHIVE)
    }

    pub fn with_base_url(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ArtSource for CoverArtArchive {
    fn name(&self) -> &'static str {
        "Cover Art Archive"
    }

    async fn fetch_art(&self, candidate: &MetadataCandidate) -> Result<Option<CoverArt>, MetadataError> {
        if candidate.source != CatalogSource::MusicBrainz {
            return Ok(None);
        }

        let url = format!("{}/release-group/{}", self.base_url, candidate.catalog_id);
        debug!("Fetching cover art listing: {}", url);
        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("No cover art in archive for {}", candidate.catalog_id);
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(MetadataError::Status {
                service: "Cover Art Archive".to_string(),
                status: response.status().as_u16(),
            });
        }

        let json = response.json::<serde_json::Value>().await?;
        for image_url in front_image_urls(&json) {
            match download_and_accept(&self.client, &image_url).await {
                Ok(art) => {
                    info!("Found CAA art for {}: {}", candidate.catalog_id, image_url);
                    return Ok(Some(art));
                }
                Err(e) => debug!("Invalid CAA art {}: {}", image_url, e),
            }
        }
        Ok(None)
    }
}
