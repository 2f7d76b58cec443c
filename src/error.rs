//! Crate-wide error type.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration file missing, unreadable or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Cache database access failed.
    #[error("cache database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A cached value or wire payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// HTTP request to the content source failed outright.
    #[error("content source request failed: {0}")]
    Source(#[from] reqwest::Error),

    /// The content source answered with a non-success status.
    #[error("content source returned {status} for {path}")]
    SourceStatus { status: u16, path: String },

    /// The content source answered 200 but the payload was not usable.
    #[error("unexpected content source payload for {path}: {reason}")]
    SourcePayload { path: String, reason: String },

    /// Markdown or frontmatter of a post could not be compiled.
    #[error("compile failed for {slug}: {reason}")]
    Compile { slug: String, reason: String },

    /// A compile job exceeded the queue timeout.
    #[error("compile timed out after {0:?}")]
    CompileTimeout(Duration),

    /// Social-image rendering failed.
    #[error("image rendering failed: {0}")]
    Image(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
