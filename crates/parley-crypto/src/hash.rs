//! SHA-2 hashing.

use sha2::{Digest, Sha256, Sha512};

use crate::{SHA256_SIZE, SHA512_SIZE};

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; SHA256_SIZE] {
    let mut out = [0u8; SHA256_SIZE];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// SHA-512 digest of `data`.
pub fn sha512(data: &[u8]) -> [u8; SHA512_SIZE] {
    let mut out = [0u8; SHA512_SIZE];
    out.copy_from_slice(&Sha512::digest(data));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_sha256_empty_vector() {
        assert_eq!(
            sha256(b""),
            hex!("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );
    }

    #[test]
    fn test_sha256_abc_vector() {
        assert_eq!(
            sha256(b"abc"),
            hex!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_sha512_abc_vector() {
        assert_eq!(
            sha512(b"abc"),
            hex!(
                "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a"
                "2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
            )
        );
    }
}
