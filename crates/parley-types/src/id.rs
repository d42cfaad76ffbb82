//! Conference and peer identifiers.

use serde::{Deserialize, Serialize};

use crate::CONFERENCE_ID_LENGTH;

/// Error raised when constructing an identifier from invalid input.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdError {
    /// The serialized conference id has the wrong length.
    #[error("conference id must be {expected} bytes, got {actual}")]
    BadLength { expected: usize, actual: usize },

    /// The conference type byte is not a known type.
    #[error("unknown conference type byte {0}")]
    UnknownType(u8),

    /// The peer id does not fit in the signed 24-bit range.
    #[error("peer id {0} outside the signed 24-bit range")]
    PeerIdRange(i32),
}

/// Kind of conference: plain text chat or audio/video signaling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConferenceType {
    Text = 0,
    Av = 1,
}

impl ConferenceType {
    /// The wire byte for this conference type.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Parse a wire byte back into a conference type.
    pub fn from_byte(byte: u8) -> Result<Self, IdError> {
        match byte {
            0 => Ok(ConferenceType::Text),
            1 => Ok(ConferenceType::Av),
            other => Err(IdError::UnknownType(other)),
        }
    }
}

/// Globally unique conference identity: a type byte followed by a 32-byte
/// symmetric key that doubles as the shared conference secret.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConferenceId {
    kind: ConferenceType,
    key: [u8; 32],
}

impl ConferenceId {
    /// Assemble an identifier from its parts.
    pub fn new(kind: ConferenceType, key: [u8; 32]) -> Self {
        Self { kind, key }
    }

    /// The conference type encoded in this identifier.
    pub fn kind(&self) -> ConferenceType {
        self.kind
    }

    /// The 32-byte key portion.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Serialize to the 33-byte wire form: type byte followed by the key.
    pub fn to_bytes(&self) -> [u8; CONFERENCE_ID_LENGTH] {
        let mut out = [0u8; CONFERENCE_ID_LENGTH];
        out[0] = self.kind.as_byte();
        out[1..].copy_from_slice(&self.key);
        out
    }

    /// Parse the 33-byte wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        if bytes.len() != CONFERENCE_ID_LENGTH {
            return Err(IdError::BadLength {
                expected: CONFERENCE_ID_LENGTH,
                actual: bytes.len(),
            });
        }
        let kind = ConferenceType::from_byte(bytes[0])?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes[1..]);
        Ok(Self { kind, key })
    }
}

/// Handle for a friend connection owned by the outer transport layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FriendNumber(pub u32);

/// Per-conference unique peer id, constrained to the signed 24-bit range
/// so it packs into the wire encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(i32);

impl PeerId {
    /// Smallest representable peer id.
    pub const MIN: i32 = -(1 << 23);
    /// Largest representable peer id.
    pub const MAX: i32 = (1 << 23) - 1;

    /// Validate that `value` fits in 24 signed bits.
    pub fn new(value: i32) -> Result<Self, IdError> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(IdError::PeerIdRange(value))
        }
    }

    /// The raw id value.
    pub fn value(self) -> i32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conference_id_roundtrip() {
        let id = ConferenceId::new(ConferenceType::Av, [0x5A; 32]);
        let bytes = id.to_bytes();
        assert_eq!(bytes[0], 1);
        let parsed = ConferenceId::from_bytes(&bytes).expect("parse");
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_conference_id_rejects_bad_type() {
        let mut bytes = ConferenceId::new(ConferenceType::Text, [0; 32]).to_bytes();
        bytes[0] = 7;
        assert_eq!(
            ConferenceId::from_bytes(&bytes),
            Err(IdError::UnknownType(7))
        );
    }

    #[test]
    fn test_conference_id_rejects_bad_length() {
        assert!(matches!(
            ConferenceId::from_bytes(&[0u8; 32]),
            Err(IdError::BadLength { .. })
        ));
    }

    #[test]
    fn test_peer_id_range() {
        assert!(PeerId::new(0).is_ok());
        assert!(PeerId::new(PeerId::MAX).is_ok());
        assert!(PeerId::new(PeerId::MIN).is_ok());
        assert!(PeerId::new(PeerId::MAX + 1).is_err());
        assert!(PeerId::new(PeerId::MIN - 1).is_err());
    }
}
