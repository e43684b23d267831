use std::fmt::Display;

use url::Url;

use crate::isobmff;

/// Transport stream packet length.
pub const TS_PACKET_SIZE: usize = 188;
/// First byte of every transport stream packet.
pub const TS_SYNC_BYTE: u8 = 0x47;

/// Container kind carried by the media segments of a playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// MPEG-2 transport stream; segments can be joined by concatenation.
    TransportStream,
    /// Fragmented MP4 (`moof`/`mdat` fragments).
    Fmp4,
}

impl SegmentKind {
    /// File extension used for downloaded segment files.
    pub fn extension(&self) -> &'static str {
        match self {
            SegmentKind::TransportStream => "ts",
            SegmentKind::Fmp4 => "m4s",
        }
    }

    /// Classify a segment URI by its path extension or format query.
    ///
    /// Returns `None` when the URI gives no hint either way.
    pub fn from_uri(uri: &str) -> Option<Self> {
        let (path, query) = match Url::parse(uri) {
            Ok(url) => (
                url.path().to_ascii_lowercase(),
                url.query().unwrap_or("").to_ascii_lowercase(),
            ),
            Err(_) => {
                let lower = uri.to_ascii_lowercase();
                match lower.split_once('?') {
                    Some((path, query)) => (path.to_string(), query.to_string()),
                    None => (lower, String::new()),
                }
            }
        };

        if path.ends_with(".m4s")
            || path.ends_with(".mp4")
            || path.ends_with(".m4v")
            || path.ends_with(".m4a")
            || path.ends_with(".cmfv")
            || path.ends_with(".cmfa")
            || query.contains("format=mp4")
            || query.contains("fmt=mp4")
        {
            Some(SegmentKind::Fmp4)
        } else if path.ends_with(".ts") || path.ends_with(".m2ts") {
            Some(SegmentKind::TransportStream)
        } else {
            None
        }
    }

    /// Classify a segment from its leading bytes.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if isobmff::starts_with_fmp4_box(data) {
            Some(SegmentKind::Fmp4)
        } else if looks_like_transport_stream(data) {
            Some(SegmentKind::TransportStream)
        } else {
            None
        }
    }
}

impl Display for SegmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentKind::TransportStream => write!(f, "ts"),
            SegmentKind::Fmp4 => write!(f, "fmp4"),
        }
    }
}

/// True when `data` starts with a sync byte and, where enough bytes are
/// present, the following packet boundaries carry sync bytes as well.
pub fn looks_like_transport_stream(data: &[u8]) -> bool {
    if data.first() != Some(&TS_SYNC_BYTE) {
        return false;
    }

    data.iter()
        .step_by(TS_PACKET_SIZE)
        .take(3)
        .all(|b| *b == TS_SYNC_BYTE)
}
