use crate::protocol::Lane;
use crate::types::Tag;

/// Compute a non-zero FNV-1a hash over an iterator of byte slices.
pub(crate) fn fnv1a<I, S>(parts: I) -> u64
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut h: u64 = 0xcbf29ce484222325; // FNV-1a offset basis
    for part in parts {
        for &b in part.as_ref() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        // Separator so ("ab", "c") and ("a", "bc") differ.
        h ^= 0xff;
        h = h.wrapping_mul(0x100000001b3);
    }
    if h == 0 { 1 } else { h }
}

/// Transport tag for traffic of `lane` concerning `name`.
///
/// Every rank derives the same tag for the same `(lane, name)` pair, so no
/// registration handshake is needed.
pub fn tag_for(lane: Lane, name: &str) -> Tag {
    fnv1a([&[lane as u8][..], name.as_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_deterministic() {
        assert_eq!(
            tag_for(Lane::Consensus, "fc.weight"),
            tag_for(Lane::Consensus, "fc.weight")
        );
    }

    #[test]
    fn test_lanes_and_names_separate() {
        assert_ne!(tag_for(Lane::Consensus, "w"), tag_for(Lane::Gather, "w"));
        assert_ne!(tag_for(Lane::Consensus, "w"), tag_for(Lane::Consensus, "b"));
        assert_ne!(fnv1a(["ab", "c"]), fnv1a(["a", "bc"]));
    }

    #[test]
    fn test_fnv1a_non_zero() {
        for i in 0..1000u64 {
            assert_ne!(fnv1a([&i.to_le_bytes()[..]]), 0);
        }
    }
}
