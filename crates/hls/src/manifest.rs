//! Line-oriented `#EXT-X-*` playlist parsing.
//!
//! The parser is deliberately lenient: malformed numeric fields fall back to
//! their defaults instead of aborting, and unknown tags are skipped. Callers
//! decide what an empty result means (a media manifest without segments is
//! fatal for a download job, but not for the parser).

use std::fmt;

use tracing::trace;
use url::Url;

/// `#EXT-X-VERSION` value used when the tag is missing or malformed.
pub const DEFAULT_VERSION: u32 = 3;
/// `#EXT-X-TARGETDURATION` value used when the tag is missing or malformed.
pub const DEFAULT_TARGET_DURATION: u64 = 10;
/// `#EXT-X-MEDIA-SEQUENCE` value used when the tag is missing or malformed.
pub const DEFAULT_MEDIA_SEQUENCE: u64 = 0;
/// `#EXTINF` duration used when the duration field is malformed.
pub const DEFAULT_SEGMENT_DURATION: f64 = 10.0;

/// Number of leading non-empty lines inspected for `EXT-X-STREAM-INF`.
const MASTER_DETECTION_LINES: usize = 10;

const TAG_VERSION: &str = "#EXT-X-VERSION:";
const TAG_TARGET_DURATION: &str = "#EXT-X-TARGETDURATION:";
const TAG_MEDIA_SEQUENCE: &str = "#EXT-X-MEDIA-SEQUENCE:";
const TAG_INF: &str = "#EXTINF:";
const TAG_ENDLIST: &str = "#EXT-X-ENDLIST";
const TAG_STREAM_INF: &str = "#EXT-X-STREAM-INF:";
const TAG_MAP: &str = "#EXT-X-MAP:";
const STREAM_INF_MARKER: &str = "EXT-X-STREAM-INF";

/// Whether a manifest lists media segments or variant streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManifestKind {
    #[default]
    Media,
    Master,
}

impl fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestKind::Media => write!(f, "media"),
            ManifestKind::Master => write!(f, "master"),
        }
    }
}

/// A media segment entry. The URI is already resolved against the manifest URI.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub uri: String,
    /// Duration in seconds as declared by `#EXTINF`.
    pub duration: f64,
    pub title: Option<String>,
}

/// A variant stream entry of a master manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    /// Peak bandwidth in bits per second.
    pub bandwidth: u64,
    pub uri: String,
    pub resolution: Option<(u32, u32)>,
    pub codecs: Option<String>,
}

/// Structured view of a playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub version: u32,
    pub target_duration: u64,
    pub media_sequence: u64,
    /// Set when `#EXT-X-ENDLIST` is present (the playlist is complete / VOD).
    pub end_list: bool,
    pub kind: ManifestKind,
    /// Media segments in manifest order. Empty for master manifests.
    pub segments: Vec<Segment>,
    /// Variant streams in manifest order. Empty for media manifests.
    pub variants: Vec<Variant>,
    /// Absolute URI of the `#EXT-X-MAP` initialization section, if any.
    pub init_segment: Option<String>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION,
            target_duration: DEFAULT_TARGET_DURATION,
            media_sequence: DEFAULT_MEDIA_SEQUENCE,
            end_list: false,
            kind: ManifestKind::Media,
            segments: Vec::new(),
            variants: Vec::new(),
            init_segment: None,
        }
    }
}

impl Manifest {
    pub fn is_master(&self) -> bool {
        self.kind == ManifestKind::Master
    }

    pub fn is_vod(&self) -> bool {
        self.end_list
    }

    /// Sum of all segment durations in seconds.
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }
}

/// Parse manifest text fetched from `base_uri`.
///
/// Relative segment and variant URIs are resolved against `base_uri`.
pub fn parse(text: &str, base_uri: &str) -> Manifest {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let base = Url::parse(base_uri).ok();

    let mut manifest = Manifest {
        kind: detect_kind(text),
        ..Manifest::default()
    };

    let mut pending_segment: Option<(f64, Option<String>)> = None;
    let mut pending_variant: Option<Variant> = None;

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }

        if let Some(value) = line.strip_prefix(TAG_VERSION) {
            manifest.version = value.trim().parse().unwrap_or(DEFAULT_VERSION);
        } else if let Some(value) = line.strip_prefix(TAG_TARGET_DURATION) {
            manifest.target_duration = value.trim().parse().unwrap_or(DEFAULT_TARGET_DURATION);
        } else if let Some(value) = line.strip_prefix(TAG_MEDIA_SEQUENCE) {
            manifest.media_sequence = value.trim().parse().unwrap_or(DEFAULT_MEDIA_SEQUENCE);
        } else if let Some(value) = line.strip_prefix(TAG_INF) {
            pending_segment = Some(parse_inf(value));
        } else if line.starts_with(TAG_ENDLIST) {
            manifest.end_list = true;
        } else if let Some(value) = line.strip_prefix(TAG_MAP) {
            manifest.init_segment = attribute(value, "URI").map(|uri| resolve_uri(uri, base.as_ref()));
        } else if let Some(value) = line.strip_prefix(TAG_STREAM_INF) {
            if manifest.kind == ManifestKind::Master {
                pending_variant = parse_stream_inf(value);
            }
        } else if line.starts_with('#') {
            trace!(line, "Skipping unhandled playlist line");
        } else if manifest.kind == ManifestKind::Master {
            if let Some(mut variant) = pending_variant.take() {
                variant.uri = resolve_uri(line, base.as_ref());
                manifest.variants.push(variant);
            }
        } else if let Some((duration, title)) = pending_segment.take() {
            manifest.segments.push(Segment {
                uri: resolve_uri(line, base.as_ref()),
                duration,
                title,
            });
        }
    }

    manifest
}

/// A manifest is a master when one of its first non-empty lines mentions
/// `EXT-X-STREAM-INF`.
fn detect_kind(text: &str) -> ManifestKind {
    let is_master = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(MASTER_DETECTION_LINES)
        .any(|line| line.contains(STREAM_INF_MARKER));

    if is_master {
        ManifestKind::Master
    } else {
        ManifestKind::Media
    }
}

fn parse_inf(value: &str) -> (f64, Option<String>) {
    let (duration, title) = match value.split_once(',') {
        Some((duration, title)) => (duration, title.trim()),
        None => (value, ""),
    };

    let duration = duration
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d >= 0.0)
        .unwrap_or(DEFAULT_SEGMENT_DURATION);
    let title = (!title.is_empty()).then(|| title.to_string());

    (duration, title)
}

fn parse_stream_inf(value: &str) -> Option<Variant> {
    let bandwidth = attribute(value, "BANDWIDTH")?.parse::<u64>().ok()?;
    let resolution = attribute(value, "RESOLUTION").and_then(|r| {
        let (w, h) = r.split_once(['x', 'X'])?;
        Some((w.parse().ok()?, h.parse().ok()?))
    });
    let codecs = attribute(value, "CODECS").map(str::to_string);

    Some(Variant {
        bandwidth,
        uri: String::new(),
        resolution,
        codecs,
    })
}

/// Look up `name` in an attribute list such as
/// `BANDWIDTH=1280000,CODECS="avc1.4d401f,mp4a.40.2"`.
///
/// Quoted values may contain commas; the surrounding quotes are stripped.
pub fn attribute<'a>(list: &'a str, name: &str) -> Option<&'a str> {
    AttributeIter { rest: list }
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

struct AttributeIter<'a> {
    rest: &'a str,
}

impl<'a> Iterator for AttributeIter<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let rest = self.rest.trim_start_matches([',', ' ']);
            if rest.is_empty() {
                return None;
            }

            let Some(eq) = rest.find('=') else {
                self.rest = "";
                return None;
            };
            let key = rest[..eq].trim();
            let after = &rest[eq + 1..];

            let (value, remainder) = if let Some(quoted) = after.strip_prefix('"') {
                match quoted.find('"') {
                    Some(end) => (&quoted[..end], &quoted[end + 1..]),
                    None => (quoted, ""),
                }
            } else {
                match after.find(',') {
                    Some(end) => (after[..end].trim(), &after[end..]),
                    None => (after.trim(), ""),
                }
            };
            self.rest = remainder;

            if !key.is_empty() {
                return Some((key, value));
            }
        }
    }
}

/// Resolve a playlist URI against the manifest location.
///
/// Absolute `http(s)` URIs are returned unchanged. Anything else is joined
/// with `base`; when no base is available or the join fails the URI is kept
/// as written.
pub fn resolve_uri(uri: &str, base: Option<&Url>) -> String {
    let lower = uri.get(..8).unwrap_or(uri).to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return uri.to_string();
    }

    base.and_then(|base| base.join(uri).ok())
        .map(String::from)
        .unwrap_or_else(|| uri.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://cdn.example.com/vod/abc/index.m3u8";

    #[test]
    fn test_parse_fmp4_media_manifest() {
        let text = "#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-TARGETDURATION:3\n#EXTINF:3.003003,\n0.m4s\n#EXTINF:3.003003,\n1.m4s\n#EXT-X-ENDLIST\n";
        let manifest = parse(text, BASE);

        assert_eq!(manifest.kind, ManifestKind::Media);
        assert_eq!(manifest.segments.len(), 2);
        assert_eq!(manifest.target_duration, 3);
        assert_eq!(manifest.version, 7);
        assert!(manifest.end_list);
        assert_eq!(
            manifest.segments[0].uri,
            "https://cdn.example.com/vod/abc/0.m4s"
        );
        assert_eq!(
            manifest.segments[1].uri,
            "https://cdn.example.com/vod/abc/1.m4s"
        );
        assert!((manifest.segments[0].duration - 3.003003).abs() < f64::EPSILON);
    }

    #[test]
    fn test_segments_keep_source_order_and_durations() {
        let durations = [4.0, 2.5, 6.006, 1.0, 9.75];
        let mut text = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:10\n");
        for (i, d) in durations.iter().enumerate() {
            text.push_str(&format!("#EXTINF:{d},\nseg_{i}.ts\n"));
        }

        let manifest = parse(&text, BASE);
        assert_eq!(manifest.segments.len(), durations.len());
        for (i, (segment, d)) in manifest.segments.iter().zip(durations).enumerate() {
            assert!(segment.uri.ends_with(&format!("seg_{i}.ts")));
            assert_eq!(segment.duration, d);
        }
        assert!(!manifest.end_list);
    }

    #[test]
    fn test_defaults_when_tags_missing() {
        let manifest = parse("#EXTM3U\n#EXTINF:5,\na.ts\n", BASE);
        assert_eq!(manifest.version, DEFAULT_VERSION);
        assert_eq!(manifest.target_duration, DEFAULT_TARGET_DURATION);
        assert_eq!(manifest.media_sequence, DEFAULT_MEDIA_SEQUENCE);
        assert_eq!(manifest.segments.len(), 1);
    }

    #[test]
    fn test_malformed_numbers_fall_back_to_defaults() {
        let text = "#EXTM3U\n#EXT-X-VERSION:seven\n#EXT-X-TARGETDURATION:\n#EXT-X-MEDIA-SEQUENCE:-4\n#EXTINF:abc,Intro\nintro.ts\n";
        let manifest = parse(text, BASE);

        assert_eq!(manifest.version, DEFAULT_VERSION);
        assert_eq!(manifest.target_duration, DEFAULT_TARGET_DURATION);
        assert_eq!(manifest.media_sequence, DEFAULT_MEDIA_SEQUENCE);
        assert_eq!(manifest.segments[0].duration, DEFAULT_SEGMENT_DURATION);
        assert_eq!(manifest.segments[0].title.as_deref(), Some("Intro"));
    }

    #[test]
    fn test_media_sequence_parsed() {
        let manifest = parse("#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:1234\n", BASE);
        assert_eq!(manifest.media_sequence, 1234);
    }

    #[test]
    fn test_no_segments_is_empty_media() {
        let manifest = parse("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-ENDLIST\n", BASE);
        assert_eq!(manifest.kind, ManifestKind::Media);
        assert!(manifest.segments.is_empty());
        assert!(manifest.variants.is_empty());
    }

    #[test]
    fn test_uri_without_extinf_is_ignored() {
        let manifest = parse("#EXTM3U\nstray.ts\n#EXTINF:2,\nreal.ts\n", BASE);
        assert_eq!(manifest.segments.len(), 1);
        assert!(manifest.segments[0].uri.ends_with("real.ts"));
    }

    #[test]
    fn test_absolute_and_rooted_uris() {
        let text = "#EXTM3U\n#EXTINF:1,\nhttps://other.example.org/x.ts\n#EXTINF:1,\n/root/y.ts\n#EXTINF:1,\n../up/z.ts\n";
        let manifest = parse(text, BASE);
        assert_eq!(manifest.segments[0].uri, "https://other.example.org/x.ts");
        assert_eq!(manifest.segments[1].uri, "https://cdn.example.com/root/y.ts");
        assert_eq!(manifest.segments[2].uri, "https://cdn.example.com/vod/up/z.ts");
    }

    #[test]
    fn test_bom_and_crlf_tolerated() {
        let text = "\u{feff}#EXTM3U\r\n#EXT-X-VERSION:4\r\n#EXTINF:2.0,\r\na.ts\r\n#EXT-X-ENDLIST\r\n";
        let manifest = parse(text, BASE);
        assert_eq!(manifest.version, 4);
        assert_eq!(manifest.segments.len(), 1);
        assert!(manifest.segments[0].uri.ends_with("/a.ts"));
        assert!(manifest.end_list);
    }

    #[test]
    fn test_parse_master_manifest() {
        let text = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=500000,RESOLUTION=640x360\nlow/index.m3u8\n#EXT-X-STREAM-INF:AVERAGE-BANDWIDTH=900000,BANDWIDTH=1200000,CODECS=\"avc1.4d401f,mp4a.40.2\",RESOLUTION=1280x720\nhigh/index.m3u8\n";
        let manifest = parse(text, BASE);

        assert!(manifest.is_master());
        assert!(manifest.segments.is_empty());
        assert_eq!(manifest.variants.len(), 2);
        assert_eq!(manifest.variants[0].bandwidth, 500_000);
        assert_eq!(manifest.variants[0].resolution, Some((640, 360)));
        assert_eq!(
            manifest.variants[0].uri,
            "https://cdn.example.com/vod/abc/low/index.m3u8"
        );
        assert_eq!(manifest.variants[1].bandwidth, 1_200_000);
        assert_eq!(
            manifest.variants[1].codecs.as_deref(),
            Some("avc1.4d401f,mp4a.40.2")
        );
    }

    #[test]
    fn test_stream_inf_without_bandwidth_is_skipped() {
        let text = "#EXTM3U\n#EXT-X-STREAM-INF:RESOLUTION=640x360\nnobw.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=abc\nbad.m3u8\n";
        let manifest = parse(text, BASE);
        assert!(manifest.is_master());
        assert!(manifest.variants.is_empty());
    }

    #[test]
    fn test_stream_inf_after_detection_window_is_media() {
        let mut text = String::from("#EXTM3U\n");
        for i in 0..10 {
            text.push_str(&format!("#EXT-X-CUSTOM-{i}:x\n"));
        }
        text.push_str("#EXT-X-STREAM-INF:BANDWIDTH=1000\nv.m3u8\n");

        let manifest = parse(&text, BASE);
        assert_eq!(manifest.kind, ManifestKind::Media);
        assert!(manifest.segments.is_empty());
        assert!(manifest.variants.is_empty());
    }

    #[test]
    fn test_map_tag_resolved() {
        let text = "#EXTM3U\n#EXT-X-MAP:URI=\"init.mp4\",BYTERANGE=\"720@0\"\n#EXTINF:4,\n0.m4s\n";
        let manifest = parse(text, BASE);
        assert_eq!(
            manifest.init_segment.as_deref(),
            Some("https://cdn.example.com/vod/abc/init.mp4")
        );
    }

    #[test]
    fn test_attribute_lookup() {
        let list = "PROGRAM-ID=1,AVERAGE-BANDWIDTH=10,BANDWIDTH=20,NAME=\"a,b\"";
        assert_eq!(attribute(list, "BANDWIDTH"), Some("20"));
        assert_eq!(attribute(list, "AVERAGE-BANDWIDTH"), Some("10"));
        assert_eq!(attribute(list, "NAME"), Some("a,b"));
        assert_eq!(attribute(list, "CODECS"), None);
    }

    #[test]
    fn test_resolve_uri_without_base() {
        assert_eq!(resolve_uri("seg.ts", None), "seg.ts");
        assert_eq!(resolve_uri("HTTPS://A.example/x", None), "HTTPS://A.example/x");
    }
}
