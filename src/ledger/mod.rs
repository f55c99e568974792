//! JobLedger: durable per-job bookkeeping and startup reconciliation

mod client;
pub mod models;
pub mod process_probe;

pub use client::{JobBook, JobLedger, ReconcilePolicy};
pub use models::{JobRegistration, LedgerEntry, LedgerProcess, ReconcileReport, Stage};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No ledger entry for job {0}")]
    UnknownJob(String),
    #[error("Malformed ledger entry {job_id}: {reason}")]
    Corrupt { job_id: String, reason: String },
}
