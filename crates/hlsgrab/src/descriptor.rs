//! Stream descriptors handed over by the content-discovery side.

use std::collections::HashMap;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Protocol names that identify an HLS stream.
const HLS_PROTOCOLS: [&str; 3] = ["hls", "m3u8", "m3u8_native"];

/// What to download: a manifest URI, its declared protocol and the HTTP
/// headers the origin expects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    #[serde(alias = "url")]
    pub uri: String,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default, alias = "httpHeaders")]
    pub http_headers: Option<HashMap<String, String>>,
}

impl MediaDescriptor {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.http_headers
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), value.into());
        self
    }

    /// Whether this engine handles the descriptor: the declared protocol is
    /// HLS or the URI mentions `m3u8`.
    pub fn suitable(&self) -> bool {
        let protocol_matches = self
            .protocol
            .as_deref()
            .is_some_and(|p| HLS_PROTOCOLS.iter().any(|h| p.eq_ignore_ascii_case(h)));

        protocol_matches || self.uri.to_ascii_lowercase().contains("m3u8")
    }

    /// Convert the descriptor headers into a request header map.
    /// Entries that are not valid HTTP headers are skipped.
    pub fn header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let Some(http_headers) = &self.http_headers else {
            return headers;
        };

        for (name, value) in http_headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Skipping invalid descriptor header"),
            }
        }
        headers
    }
}
