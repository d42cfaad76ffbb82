//! Closest-peer election.
//!
//! Each member keeps friend connections to the up-to-four peers whose
//! long-term keys are XOR-nearest its own; those links form the overlay
//! that broadcasts flood across. Lexicographic comparison of the XOR of
//! two keys is the standard Kademlia distance metric.

use parley_crypto::PublicKey;
use parley_types::{PeerId, DESIRED_CLOSE_CONNECTIONS};

/// XOR distance between two public keys.
pub fn xor_distance(a: &PublicKey, b: &PublicKey) -> [u8; 32] {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Elect the up-to-[`DESIRED_CLOSE_CONNECTIONS`] peers closest to
/// `own_pk`, given `(gid, real_pk)` candidates. Returns gids sorted by
/// ascending distance; deterministic for a fixed candidate set.
pub fn elect_closest(
    own_pk: &PublicKey,
    candidates: impl Iterator<Item = (PeerId, PublicKey)>,
) -> Vec<PeerId> {
    let mut ranked: Vec<([u8; 32], PeerId)> = candidates
        .map(|(gid, pk)| (xor_distance(own_pk, &pk), gid))
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0));
    ranked
        .into_iter()
        .take(DESIRED_CLOSE_CONNECTIONS)
        .map(|(_, gid)| gid)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(first: u8) -> PublicKey {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        PublicKey::from_bytes(bytes)
    }

    fn gid(v: i32) -> PeerId {
        PeerId::new(v).expect("gid")
    }

    #[test]
    fn test_xor_distance_symmetric_and_zero() {
        let a = pk(0b1010);
        let b = pk(0b0110);
        assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
        assert_eq!(xor_distance(&a, &a), [0u8; 32]);
        assert_eq!(xor_distance(&a, &b)[0], 0b1100);
    }

    #[test]
    fn test_election_picks_nearest_four() {
        let own = pk(0);
        let candidates = vec![
            (gid(1), pk(1)),
            (gid(2), pk(2)),
            (gid(3), pk(3)),
            (gid(4), pk(0x80)),
            (gid(5), pk(0x40)),
            (gid(6), pk(4)),
        ];
        let elected = elect_closest(&own, candidates.into_iter());
        assert_eq!(elected, vec![gid(1), gid(2), gid(3), gid(6)]);
    }

    #[test]
    fn test_election_is_deterministic() {
        let own = pk(0x55);
        let candidates: Vec<_> = (1..=10).map(|i| (gid(i), pk(i as u8))).collect();
        let first = elect_closest(&own, candidates.clone().into_iter());
        let second = elect_closest(&own, candidates.into_iter());
        assert_eq!(first, second);
        assert_eq!(first.len(), DESIRED_CLOSE_CONNECTIONS);
    }

    #[test]
    fn test_election_with_few_candidates() {
        let own = pk(0);
        let elected = elect_closest(&own, vec![(gid(9), pk(9))].into_iter());
        assert_eq!(elected, vec![gid(9)]);
        assert!(elect_closest(&own, std::iter::empty()).is_empty());
    }
}
