use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Integrity error: {0}")]
    Integrity(String),
    #[error("Corrupt write: {0}")]
    CorruptWrite(String),
    #[error("Lock contention: {0}")]
    LockContention(String),
    #[error("Manifest parse error: {0}")]
    ManifestParse(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LauncherError>;
