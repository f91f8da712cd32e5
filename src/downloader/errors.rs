// Error types for the download client

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DownloadError {
    /// Video reference has no id; a caller bug, never retried
    #[error("Invalid video: {0}")]
    InvalidVideo(String),

    /// Search/info/format lookup failed on the network or while parsing
    #[error("Metadata fetch failed: {0}")]
    MetadataFetch(String),

    /// Job was cancelled before the worker reported any progress
    #[error("Download aborted: {0}")]
    DownloadAbort(String),

    /// Push channel could not be opened or a command could not be sent
    #[error("Transport error: {0}")]
    Transport(String),

    /// Finished artifact could not be fetched or written locally
    #[error("Retrieval failed: {0}")]
    Retrieval(String),

    /// Bad base URL, proxy or other client setting
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DownloadError {
    /// Whether this error means the job never started and must be dropped at once
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::DownloadAbort(_))
    }
}

// HTTP failures only happen on metadata round trips or artifact retrieval;
// the retriever maps its own errors explicitly, so default to metadata.
impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            return Self::Config(e.to_string());
        }
        if e.is_timeout() {
            return Self::MetadataFetch(format!("request timed out: {}", e));
        }
        if e.is_decode() {
            return Self::MetadataFetch(format!("invalid JSON: {}", e));
        }
        Self::MetadataFetch(e.to_string())
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(e: serde_json::Error) -> Self {
        Self::MetadataFetch(format!("JSON parse error: {}", e))
    }
}

impl From<url::ParseError> for DownloadError {
    fn from(e: url::ParseError) -> Self {
        Self::Config(format!("invalid URL: {}", e))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DownloadError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        Self::Retrieval(e.to_string())
    }
}
