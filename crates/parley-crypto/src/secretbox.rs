//! XSalsa20-Poly1305 authenticated encryption.
//!
//! The wire layout is a 16-byte Poly1305 authenticator followed by the
//! ciphertext, so a box is always exactly 16 bytes longer than its
//! plaintext. The symmetric forms take a precomputed [`SharedKey`]; the
//! box forms precompute one internally and zeroize it on every exit path.

use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{AeadInPlace, KeyInit};
use crypto_secretbox::XSalsa20Poly1305;

use crate::nonce::Nonce;
use crate::x25519::{precompute, PublicKey, SecretKey, SharedKey};
use crate::{CryptoError, Result, MAC_SIZE};

/// Encrypt `plaintext` under a precomputed shared key.
///
/// Returns `MAC_SIZE + plaintext.len()` bytes: the authenticator first,
/// then the ciphertext.
///
/// # Errors
///
/// [`CryptoError::InvalidInput`] if the plaintext is empty.
pub fn encrypt_symmetric(key: &SharedKey, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
    if plaintext.is_empty() {
        return Err(CryptoError::InvalidInput("empty plaintext"));
    }

    let cipher = XSalsa20Poly1305::new(GenericArray::from_slice(key.as_bytes()));
    let mut body = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), &[], &mut body)
        .map_err(|_| CryptoError::InvalidInput("plaintext too long"))?;

    let mut out = Vec::with_capacity(MAC_SIZE + body.len());
    out.extend_from_slice(&tag);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decrypt a box produced by [`encrypt_symmetric`].
///
/// # Errors
///
/// [`CryptoError::InvalidInput`] if the box is too short to contain an
/// authenticator, [`CryptoError::AuthFailed`] if verification fails.
pub fn decrypt_symmetric(key: &SharedKey, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() <= MAC_SIZE {
        return Err(CryptoError::InvalidInput("ciphertext too short"));
    }

    let (tag, body) = ciphertext.split_at(MAC_SIZE);
    let cipher = XSalsa20Poly1305::new(GenericArray::from_slice(key.as_bytes()));
    let mut out = body.to_vec();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            &[],
            &mut out,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| CryptoError::AuthFailed)?;
    Ok(out)
}

/// Encrypt for `their_public` from `our_secret`, precomputing the shared
/// key for this one call. The scratch key zeroizes on drop.
pub fn encrypt(
    their_public: &PublicKey,
    our_secret: &SecretKey,
    nonce: &Nonce,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let key = precompute(their_public, our_secret);
    encrypt_symmetric(&key, nonce, plaintext)
}

/// Decrypt a box from `their_public` addressed to `our_secret`. The
/// scratch key zeroizes on drop.
pub fn decrypt(
    their_public: &PublicKey,
    our_secret: &SecretKey,
    nonce: &Nonce,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let key = precompute(their_public, our_secret);
    decrypt_symmetric(&key, nonce, ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce::random_nonce;
    use crate::x25519::generate_keypair;

    #[test]
    fn test_symmetric_roundtrip() {
        let key = SharedKey::from_bytes([0x42; 32]);
        let nonce = [0x01; 24];
        let plaintext = b"attack at dawn";

        let boxed = encrypt_symmetric(&key, &nonce, plaintext).expect("encrypt");
        assert_eq!(boxed.len(), plaintext.len() + MAC_SIZE);

        let opened = decrypt_symmetric(&key, &nonce, &boxed).expect("decrypt");
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_box_roundtrip() {
        let (alice_pk, alice_sk) = generate_keypair();
        let (bob_pk, bob_sk) = generate_keypair();
        let nonce = random_nonce();
        let plaintext = b"m";

        let boxed = encrypt(&bob_pk, &alice_sk, &nonce, plaintext).expect("encrypt");
        let opened = decrypt(&alice_pk, &bob_sk, &nonce, &boxed).expect("decrypt");
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_empty_plaintext_rejected() {
        let key = SharedKey::from_bytes([1; 32]);
        assert_eq!(
            encrypt_symmetric(&key, &[0; 24], b""),
            Err(CryptoError::InvalidInput("empty plaintext"))
        );
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let key = SharedKey::from_bytes([1; 32]);
        assert_eq!(
            decrypt_symmetric(&key, &[0; 24], &[0u8; MAC_SIZE]),
            Err(CryptoError::InvalidInput("ciphertext too short"))
        );
    }

    #[test]
    fn test_any_bit_flip_fails_auth() {
        let key = SharedKey::from_bytes([9; 32]);
        let nonce = [3; 24];
        let boxed = encrypt_symmetric(&key, &nonce, b"payload").expect("encrypt");

        for i in 0..boxed.len() {
            let mut tampered = boxed.clone();
            tampered[i] ^= 0x01;
            assert_eq!(
                decrypt_symmetric(&key, &nonce, &tampered),
                Err(CryptoError::AuthFailed),
                "flip at byte {i} must fail authentication"
            );
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let nonce = [5; 24];
        let boxed =
            encrypt_symmetric(&SharedKey::from_bytes([1; 32]), &nonce, b"x").expect("encrypt");
        assert_eq!(
            decrypt_symmetric(&SharedKey::from_bytes([2; 32]), &nonce, &boxed),
            Err(CryptoError::AuthFailed)
        );
    }

    #[test]
    fn test_wrong_nonce_fails() {
        let key = SharedKey::from_bytes([1; 32]);
        let boxed = encrypt_symmetric(&key, &[5; 24], b"x").expect("encrypt");
        assert_eq!(
            decrypt_symmetric(&key, &[6; 24], &boxed),
            Err(CryptoError::AuthFailed)
        );
    }

    #[test]
    fn test_box_matches_precomputed_path() {
        let (alice_pk, alice_sk) = generate_keypair();
        let (bob_pk, bob_sk) = generate_keypair();
        let nonce = [7; 24];

        let boxed = encrypt(&bob_pk, &alice_sk, &nonce, b"fast path").expect("encrypt");
        let shared = precompute(&alice_pk, &bob_sk);
        let opened = decrypt_symmetric(&shared, &nonce, &boxed).expect("decrypt");
        assert_eq!(opened, b"fast path");
    }
}
