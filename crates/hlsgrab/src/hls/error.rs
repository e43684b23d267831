use std::path::PathBuf;
use std::sync::Arc;

use reqwest::StatusCode;

/// Failure of a single HTTP fetch (manifest or segment).
#[derive(Debug, thiserror::Error, Clone)]
pub enum FetchError {
    #[error("HTTP status {0}")]
    Http(StatusCode),
    #[error("Network error: {source}")]
    Network { source: Arc<reqwest::Error> },
    #[error("I/O error: {source}")]
    Io { source: Arc<std::io::Error> },
    #[error("Fetch cancelled")]
    Cancelled,
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Network {
            source: Arc::new(err),
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Io {
            source: Arc::new(err),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum HlsDownloaderError {
    #[error("Failed to fetch manifest {url}: {source}")]
    ManifestFetch { url: String, source: FetchError },
    #[error("Manifest error: {0}")]
    ManifestParse(String),
    #[error("Failed to fetch segment {index} ({url}): {source}")]
    SegmentFetch {
        index: usize,
        url: String,
        source: FetchError,
    },
    #[error("Failed to fetch init segment {url}: {source}")]
    InitSegmentFetch { url: String, source: FetchError },
    #[error("Merge error: {0}")]
    Merge(String),
    #[error("Remux error: {0}")]
    Remux(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("I/O error: {source}")]
    Io { source: Arc<std::io::Error> },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("A job is already writing to {}", .0.display())]
    JobAlreadyRunning(PathBuf),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HlsDownloaderError {
    /// True when the error comes from cooperative cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            HlsDownloaderError::Cancelled
                | HlsDownloaderError::ManifestFetch {
                    source: FetchError::Cancelled,
                    ..
                }
                | HlsDownloaderError::SegmentFetch {
                    source: FetchError::Cancelled,
                    ..
                }
                | HlsDownloaderError::InitSegmentFetch {
                    source: FetchError::Cancelled,
                    ..
                }
        )
    }
}

// Manual implementation of From<std::io::Error> for HlsDownloaderError
// because of the Arc wrapping.
impl From<std::io::Error> for HlsDownloaderError {
    fn from(err: std::io::Error) -> Self {
        HlsDownloaderError::Io {
            source: Arc::new(err),
        }
    }
}
