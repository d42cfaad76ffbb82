//! 24-byte big-endian nonce counters.
//!
//! A nonce must never repeat under the same key, so senders treat it as a
//! big-endian counter. The carry loops below always run over all 24 bytes;
//! the iteration count must stay independent of the nonce contents.

use crate::rng;

/// Nonce length in bytes.
pub const NONCE_SIZE: usize = 24;

/// A secretbox nonce.
pub type Nonce = [u8; NONCE_SIZE];

/// Fill a fresh nonce from the CSPRNG.
pub fn random_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    rng::random_bytes(&mut nonce);
    nonce
}

/// Increment the nonce by one. Overflow wraps silently.
pub fn increment_nonce(nonce: &mut Nonce) {
    let mut carry: u16 = 1;
    for byte in nonce.iter_mut().rev() {
        carry += u16::from(*byte);
        *byte = carry as u8;
        carry >>= 8;
    }
}

/// Increment the nonce by a 32-bit value placed in the least significant
/// four bytes. Overflow wraps silently.
pub fn increment_nonce_by(nonce: &mut Nonce, amount: u32) {
    let mut addend = [0u8; NONCE_SIZE];
    addend[NONCE_SIZE - 4..].copy_from_slice(&amount.to_be_bytes());

    let mut carry: u16 = 0;
    for (byte, add) in nonce.iter_mut().zip(addend.iter()).rev() {
        carry += u16::from(*byte) + u16::from(*add);
        *byte = carry as u8;
        carry >>= 8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_carries_into_next_byte() {
        let mut nonce = [0u8; NONCE_SIZE];
        for _ in 0..256 {
            increment_nonce(&mut nonce);
        }
        assert_eq!(nonce[NONCE_SIZE - 1], 0);
        assert_eq!(nonce[NONCE_SIZE - 2], 1);
        assert!(nonce[..NONCE_SIZE - 2].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_increment_by_max_u32() {
        let mut nonce = [0u8; NONCE_SIZE];
        increment_nonce_by(&mut nonce, u32::MAX);
        assert_eq!(&nonce[NONCE_SIZE - 4..], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(nonce[..NONCE_SIZE - 4].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_increment_by_carries_across_boundary() {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[NONCE_SIZE - 4..].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        increment_nonce_by(&mut nonce, 1);
        assert!(nonce[NONCE_SIZE - 4..].iter().all(|&b| b == 0));
        assert_eq!(nonce[NONCE_SIZE - 5], 1);
    }

    #[test]
    fn test_overflow_wraps_silently() {
        let mut nonce = [0xFF; NONCE_SIZE];
        increment_nonce(&mut nonce);
        assert_eq!(nonce, [0u8; NONCE_SIZE]);

        let mut nonce = [0xFF; NONCE_SIZE];
        increment_nonce_by(&mut nonce, u32::MAX);
        let mut expected = [0u8; NONCE_SIZE];
        expected[NONCE_SIZE - 4..].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFE]);
        assert_eq!(nonce, expected);
    }

    #[test]
    fn test_increment_by_one_matches_increment() {
        let mut a = random_nonce();
        let mut b = a;
        increment_nonce(&mut a);
        increment_nonce_by(&mut b, 1);
        assert_eq!(a, b);
    }
}
