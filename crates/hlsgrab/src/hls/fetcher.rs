// HLS Fetcher: plain HTTP GETs for manifests and streamed segment downloads.

use std::path::Path;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, Response};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::hls::error::FetchError;

/// Downloads one segment to a local file.
///
/// `on_chunk` is called with the size of every chunk written, so the caller
/// can aggregate progress across concurrent downloads. Returns the number of
/// bytes written.
#[async_trait]
pub trait SegmentDownloader: Send + Sync {
    async fn download_segment(
        &self,
        uri: &str,
        destination: &Path,
        headers: &HeaderMap,
        cancel: &CancellationToken,
        on_chunk: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64, FetchError>;
}

pub struct HttpFetcher {
    http_client: Client,
    buffer_size: usize,
}

impl HttpFetcher {
    pub fn new(http_client: Client, buffer_size: usize) -> Self {
        Self {
            http_client,
            buffer_size: buffer_size.max(1),
        }
    }

    /// Issue a GET with the caller headers layered over the client defaults.
    /// Anything but a 2xx status is an error.
    async fn get(
        &self,
        uri: &str,
        headers: &HeaderMap,
        cancel: &CancellationToken,
    ) -> Result<Response, FetchError> {
        let url = Url::parse(uri).map_err(|e| FetchError::InvalidUrl(format!("{uri}: {e}")))?;
        let request = self.http_client.get(url).headers(headers.clone());

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            debug!(uri, %status, "Request rejected");
            return Err(FetchError::Http(status));
        }
        Ok(response)
    }

    pub async fn fetch_text(
        &self,
        uri: &str,
        headers: &HeaderMap,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        let response = self.get(uri, headers, cancel).await?;
        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            text = response.text() => text?,
        };
        trace!(uri, len = text.len(), "Fetched manifest text");
        Ok(text)
    }

    /// Stream the response body into `destination` through a buffered writer.
    /// Cancellation is checked between chunks.
    pub async fn download_to_file(
        &self,
        uri: &str,
        destination: &Path,
        headers: &HeaderMap,
        cancel: &CancellationToken,
        on_chunk: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64, FetchError> {
        let mut response = self.get(uri, headers, cancel).await?;
        let file = File::create(destination).await?;
        let mut writer = BufWriter::with_capacity(self.buffer_size, file);
        let mut written = 0u64;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                chunk = response.chunk() => chunk?,
            };
            let Some(chunk) = chunk else {
                break;
            };

            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
            on_chunk(chunk.len() as u64);
        }

        writer.flush().await?;
        debug!(uri, bytes = written, path = %destination.display(), "Segment written");
        Ok(written)
    }
}

#[async_trait]
impl SegmentDownloader for HttpFetcher {
    async fn download_segment(
        &self,
        uri: &str,
        destination: &Path,
        headers: &HeaderMap,
        cancel: &CancellationToken,
        on_chunk: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64, FetchError> {
        self.download_to_file(uri, destination, headers, cancel, on_chunk)
            .await
    }
}
