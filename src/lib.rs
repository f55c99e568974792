// Library exports for the CLI and integration tests

pub mod config;
pub mod network;
pub mod tools;
pub mod workspace;

// Ingestion pipeline
pub mod cue_sheet;
pub mod extraction;
pub mod format_detector;
pub mod ledger;
pub mod metadata;
pub mod models;
pub mod pipeline;
pub mod probe;
pub mod process;
pub mod transcode;
