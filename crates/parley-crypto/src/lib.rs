//! # parley-crypto
//!
//! Authenticated box cryptography for the Parley protocol: Curve25519 key
//! agreement, XSalsa20-Poly1305 secretboxes with a precomputed shared-key
//! fast path, SHA-2 hashing, CSPRNG helpers, and the big-endian nonce
//! counter discipline. Every packet in the overlay rests on this layer.
//!
//! All primitives delegate to audited RustCrypto implementations; nothing
//! here rolls its own cipher.
//!
//! ## Modules
//!
//! - [`x25519`] — keypairs, public-key validity, shared-key precomputation
//! - [`secretbox`] — symmetric and box-form authenticated encryption
//! - [`nonce`] — 24-byte big-endian counter arithmetic
//! - [`hash`] — SHA-256 / SHA-512
//! - [`rng`] — CSPRNG draws for ids, keys, and nonces

pub mod hash;
pub mod nonce;
pub mod rng;
pub mod secretbox;
pub mod x25519;

pub use nonce::{Nonce, NONCE_SIZE};
pub use secretbox::{decrypt, decrypt_symmetric, encrypt, encrypt_symmetric};
pub use x25519::{generate_keypair, precompute, PublicKey, SecretKey, SharedKey};

/// Public key length in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Secret key length in bytes.
pub const SECRET_KEY_SIZE: usize = 32;

/// Precomputed shared key length in bytes.
pub const SHARED_KEY_SIZE: usize = 32;

/// Symmetric key length in bytes.
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Poly1305 authenticator length in bytes.
pub const MAC_SIZE: usize = 16;

/// SHA-256 digest length in bytes.
pub const SHA256_SIZE: usize = 32;

/// SHA-512 digest length in bytes.
pub const SHA512_SIZE: usize = 64;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    /// An input had an unusable shape (empty plaintext, truncated box).
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// Message authentication failed.
    #[error("message authentication failed")]
    AuthFailed,
}

/// Convenience result type for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Zeroize a secret-bearing buffer in a way the compiler will not
/// optimize away.
pub fn secure_zero(buf: &mut [u8]) {
    use zeroize::Zeroize;
    buf.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(PUBLIC_KEY_SIZE, 32);
        assert_eq!(SECRET_KEY_SIZE, 32);
        assert_eq!(SHARED_KEY_SIZE, 32);
        assert_eq!(MAC_SIZE, 16);
        assert_eq!(NONCE_SIZE, 24);
        assert_eq!(SHA256_SIZE, 32);
        assert_eq!(SHA512_SIZE, 64);
    }

    #[test]
    fn test_secure_zero() {
        let mut buf = [0xAA; 16];
        secure_zero(&mut buf);
        assert_eq!(buf, [0u8; 16]);
    }
}
