//! X25519 keypairs and shared-key precomputation (RFC 7748).
//!
//! The shared key is the NaCl `beforenm` derivation: an X25519 exchange
//! followed by HSalsa20 with a zero block, so one scalar multiplication is
//! amortized over every secretbox between the same pair of peers.

use rand::rngs::OsRng;
use salsa20::cipher::consts::U10;
use salsa20::cipher::generic_array::GenericArray;
use salsa20::hsalsa;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use x25519_dalek::StaticSecret;
use zeroize::Zeroize;

/// A long-term or ephemeral Curve25519 secret key.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SecretKey {
    inner: StaticSecret,
}

/// A Curve25519 public key.
///
/// Equality is constant-time over the full 32 bytes.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct PublicKey {
    bytes: [u8; 32],
}

/// A precomputed 32-byte shared key, valid for secretbox operations
/// between the two keypairs that produced it. Zeroized on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SharedKey {
    bytes: [u8; 32],
}

impl SecretKey {
    /// Generate a fresh random secret key.
    pub fn generate() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    /// The raw bytes of this secret.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Derive the corresponding public key (basepoint scalar multiply).
    pub fn public_key(&self) -> PublicKey {
        let pk = x25519_dalek::PublicKey::from(&self.inner);
        PublicKey {
            bytes: pk.to_bytes(),
        }
    }
}

impl PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// The raw bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.bytes
    }

    /// The raw bytes as a reference.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Whether this is a canonical Curve25519 public key.
    ///
    /// The top bit of the last byte is always clear in a canonical
    /// encoding.
    pub fn is_valid(&self) -> bool {
        self.bytes[31] < 128
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.ct_eq(&other.bytes).into()
    }
}

impl Eq for PublicKey {}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write(&self.bytes);
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.bytes))
    }
}

impl SharedKey {
    /// Create from raw bytes (e.g. a stored symmetric conference key).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// The raw bytes of the shared key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

/// Generate a fresh Curve25519 keypair.
pub fn generate_keypair() -> (PublicKey, SecretKey) {
    let secret = SecretKey::generate();
    (secret.public_key(), secret)
}

/// Precompute the shared key between `their_public` and `our_secret`.
///
/// X25519 key agreement followed by the HSalsa20 derivation. The result is
/// symmetric: `precompute(pk_b, sk_a) == precompute(pk_a, sk_b)`.
pub fn precompute(their_public: &PublicKey, our_secret: &SecretKey) -> SharedKey {
    let pk = x25519_dalek::PublicKey::from(their_public.bytes);
    let mut dh = our_secret.inner.diffie_hellman(&pk).to_bytes();
    let key = hsalsa::<U10>(GenericArray::from_slice(&dh), &GenericArray::default());
    dh.zeroize();
    SharedKey { bytes: key.into() }
}
