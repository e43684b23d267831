use crate::manifest::{Manifest, Variant};

/// How a variant is picked from a master manifest.
///
/// Every policy is deterministic: when several variants score equally the
/// one listed first wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VariantSelectionPolicy {
    /// Select the variant with the highest bandwidth
    #[default]
    HighestBitrate,
    LowestBitrate,
    /// Select the variant whose bandwidth is closest to the given bits per second
    ClosestToBitrate(u64),
}

/// Pick the variant with the strictly greatest bandwidth; ties keep the first seen.
pub fn select_variant(master: &Manifest) -> Option<&Variant> {
    select_variant_with(master, VariantSelectionPolicy::HighestBitrate)
}

pub fn select_variant_with(master: &Manifest, policy: VariantSelectionPolicy) -> Option<&Variant> {
    let mut best: Option<&Variant> = None;

    for candidate in &master.variants {
        let replace = match best {
            None => true,
            Some(current) => match policy {
                VariantSelectionPolicy::HighestBitrate => candidate.bandwidth > current.bandwidth,
                VariantSelectionPolicy::LowestBitrate => candidate.bandwidth < current.bandwidth,
                VariantSelectionPolicy::ClosestToBitrate(target) => {
                    candidate.bandwidth.abs_diff(target) < current.bandwidth.abs_diff(target)
                }
            },
        };

        if replace {
            best = Some(candidate);
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse;

    fn master(bandwidths: &[u64]) -> Manifest {
        let mut text = String::from("#EXTM3U\n");
        for (i, bw) in bandwidths.iter().enumerate() {
            text.push_str(&format!("#EXT-X-STREAM-INF:BANDWIDTH={bw}\nv{i}.m3u8\n"));
        }
        parse(&text, "https://example.com/master.m3u8")
    }

    #[test]
    fn test_highest_bandwidth_selected() {
        let manifest = master(&[500_000, 1_200_000]);
        let selected = select_variant(&manifest).unwrap();
        assert_eq!(selected.bandwidth, 1_200_000);
        assert_eq!(selected.uri, "https://example.com/v1.m3u8");
    }

    #[test]
    fn test_ties_resolve_to_first_seen() {
        let manifest = master(&[800_000, 2_000_000, 300_000, 2_000_000]);
        let selected = select_variant(&manifest).unwrap();
        assert_eq!(selected.uri, "https://example.com/v1.m3u8");
    }

    #[test]
    fn test_order_does_not_matter_for_maximum() {
        let manifest = master(&[3_000_000, 1_000, 2_999_999]);
        assert_eq!(select_variant(&manifest).unwrap().bandwidth, 3_000_000);
    }

    #[test]
    fn test_no_variants() {
        let manifest = master(&[]);
        assert!(select_variant(&manifest).is_none());
    }

    #[test]
    fn test_lowest_and_closest_policies() {
        let manifest = master(&[900_000, 400_000, 1_500_000, 400_000]);

        let lowest = select_variant_with(&manifest, VariantSelectionPolicy::LowestBitrate).unwrap();
        assert_eq!(lowest.uri, "https://example.com/v1.m3u8");

        let closest = select_variant_with(
            &manifest,
            VariantSelectionPolicy::ClosestToBitrate(1_300_000),
        )
        .unwrap();
        assert_eq!(closest.bandwidth, 1_500_000);
    }
}
