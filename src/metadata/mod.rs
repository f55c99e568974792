//! MetadataResolver and the external catalog/art services it consults

pub mod cover_art;
pub mod itunes;
pub mod musicbrainz;
pub mod normalize;
pub mod resolver;

pub use cover_art::{CoverArt, CoverArtArchive};
pub use itunes::ITunesClient;
pub use musicbrainz::MusicBrainzClient;
pub use resolver::{ArtSource, CatalogService, MetadataResolver, ReleaseDetails, ResolverOutcome};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{service} returned status {status}")]
    Status { service: String, status: u16 },
    #[error("Unexpected {service} response: {reason}")]
    Parse { service: String, reason: String },
    #[error("{0} did not answer in time")]
    Timeout(String),
    #[error("Art rejected: {0}")]
    ArtRejected(String),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
