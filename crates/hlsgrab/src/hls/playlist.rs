// HLS Playlist Engine: fetches manifests and picks the variant to download.

use std::sync::Arc;

use hls::{Manifest, Variant, VariantSelectionPolicy, select_variant_with};
use reqwest::header::HeaderMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hls::HlsDownloaderError;
use crate::hls::fetcher::HttpFetcher;

/// A parsed manifest together with the URI it was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedPlaylist {
    pub url: String,
    pub manifest: Manifest,
}

pub struct PlaylistEngine {
    fetcher: Arc<HttpFetcher>,
    policy: VariantSelectionPolicy,
}

impl PlaylistEngine {
    pub fn new(fetcher: Arc<HttpFetcher>, policy: VariantSelectionPolicy) -> Self {
        Self { fetcher, policy }
    }

    /// Fetch and parse one manifest. Relative URIs inside it resolve against `url`.
    pub async fn load_playlist(
        &self,
        url: &str,
        headers: &HeaderMap,
        cancel: &CancellationToken,
    ) -> Result<LoadedPlaylist, HlsDownloaderError> {
        let text = self
            .fetcher
            .fetch_text(url, headers, cancel)
            .await
            .map_err(|source| HlsDownloaderError::ManifestFetch {
                url: url.to_string(),
                source,
            })?;

        let manifest = hls::parse(&text, url);
        debug!(
            url,
            kind = %manifest.kind,
            segments = manifest.segments.len(),
            variants = manifest.variants.len(),
            "Parsed manifest"
        );

        Ok(LoadedPlaylist {
            url: url.to_string(),
            manifest,
        })
    }

    /// Pick the variant to follow from a master manifest.
    pub fn select_media_variant<'m>(
        &self,
        master: &'m LoadedPlaylist,
    ) -> Result<&'m Variant, HlsDownloaderError> {
        let variant = select_variant_with(&master.manifest, self.policy).ok_or_else(|| {
            HlsDownloaderError::ManifestParse(format!(
                "master playlist {} has no usable variants",
                master.url
            ))
        })?;

        info!(
            bandwidth = variant.bandwidth,
            uri = %variant.uri,
            policy = ?self.policy,
            "Selected variant"
        );
        Ok(variant)
    }
}
