//! Error types for the openwork orchestrator.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No usable binary for {service}: {detail}")]
    ResolutionExhausted { service: String, detail: String },

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Version mismatch for {service}: expected {expected}, got {actual}")]
    VersionMismatch {
        service: String,
        expected: String,
        actual: String,
    },

    #[error("Download error: {0}")]
    Download(String),

    #[error("Failed to spawn {service}: {source}")]
    Spawn {
        service: String,
        source: std::io::Error,
    },

    #[error("Health check timed out: {0}")]
    HealthTimeout(String),

    #[error("Daemon error: {0}")]
    Daemon(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("State error: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}
