//! CSPRNG draws.
//!
//! Everything random in the protocol — keys, nonces, request tokens,
//! conference identifiers — comes through here, from the operating
//! system's CSPRNG.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::SYMMETRIC_KEY_SIZE;

/// A uniformly random `u16`.
pub fn random_u16() -> u16 {
    OsRng.next_u32() as u16
}

/// A uniformly random `u32`.
pub fn random_u32() -> u32 {
    OsRng.next_u32()
}

/// A uniformly random `u64`.
pub fn random_u64() -> u64 {
    OsRng.next_u64()
}

/// Fill `buf` with random bytes.
pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// A fresh 32-byte symmetric key.
pub fn new_symmetric_key() -> [u8; SYMMETRIC_KEY_SIZE] {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    random_bytes(&mut key);
    key
}
