// HLS (HTTP Live Streaming) manifest and segment container handling
pub mod isobmff;
pub mod manifest;
pub mod segment;
pub mod variant;

// Export common types for ease of use
pub use manifest::{Manifest, ManifestKind, Segment, Variant, parse, resolve_uri};
pub use segment::SegmentKind;
pub use variant::{VariantSelectionPolicy, select_variant, select_variant_with};
