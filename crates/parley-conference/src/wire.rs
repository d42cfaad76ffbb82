//! CBOR packet envelopes for the conference overlay.
//!
//! Every packet leads with the 33-byte conference identifier so the
//! receiving engine can route it before looking at anything else.
//! Reliable traffic travels as [`Packet`] over the lossless friend pipe;
//! sequence-numbered unreliable traffic travels as [`LossyPacket`] over
//! the lossy pipe.
//!
//! Flooded messages are [`Packet::Broadcast`]: the origin's public key,
//! a per-origin sequence number, and a kind-tagged payload. Receivers
//! deduplicate on `(origin, kind, message_number)` and re-emit to their
//! mesh neighbors, so a broadcast reaches the whole conference without
//! any peer knowing the full membership.

use serde::{Deserialize, Serialize};

use parley_crypto::PublicKey;
use parley_types::{ConferenceId, PeerId};

/// Error raised when a packet cannot be decoded.
#[derive(Debug, thiserror::Error)]
#[error("malformed packet: {0}")]
pub struct WireError(pub(crate) String);

/// A peer table entry as shipped in [`Packet::PeerList`] and
/// [`BroadcastData::NewPeer`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Long-term identity key.
    pub real_pk: PublicKey,
    /// Per-session key.
    pub temp_pk: PublicKey,
    /// Conference-unique peer id assigned by the introducing member.
    pub gid: PeerId,
    /// Current nickname, possibly empty.
    pub nick: Vec<u8>,
}

/// Payload of a flooded broadcast, tagged by kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastData {
    /// Mesh keepalive.
    Ping,
    /// A member introduces a newly joined peer.
    NewPeer(PeerEntry),
    /// A peer left (or was removed from) the conference.
    KillPeer { gid: PeerId },
    /// The origin changed its nickname.
    Name(Vec<u8>),
    /// The origin changed the conference title.
    Title(Vec<u8>),
    /// A chat message.
    Message(Vec<u8>),
    /// An action ("/me") message.
    Action(Vec<u8>),
}

impl BroadcastData {
    /// The per-peer dedup slot this kind occupies.
    pub fn dedup_slot(&self) -> usize {
        match self {
            BroadcastData::Ping => 0,
            BroadcastData::NewPeer(_) => 1,
            BroadcastData::KillPeer { .. } => 2,
            BroadcastData::Name(_) => 3,
            BroadcastData::Title(_) => 4,
            BroadcastData::Message(_) => 5,
            BroadcastData::Action(_) => 6,
        }
    }
}

/// A reliable conference packet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Invitation carrying the conference identity; what the invitee
    /// passes to `join_conference`.
    Invite { id: ConferenceId },

    /// Announce membership over a direct link: sent when accepting an
    /// invite, when rejoining, and when linking to a newly elected mesh
    /// neighbor. The receiver answers with [`Packet::PeerList`].
    Join {
        id: ConferenceId,
        /// The sender's session key.
        temp_pk: PublicKey,
        /// Pending-request token; echoed back in the peer list so the
        /// joiner can match the reply to its outstanding request. Zero
        /// when no reply validation is wanted (mesh link announcements).
        token: u64,
    },

    /// Peer table synchronization, also carrying the current title and
    /// the echoed join token (zero for unsolicited syncs).
    PeerList {
        id: ConferenceId,
        peers: Vec<PeerEntry>,
        title: Vec<u8>,
        token: u64,
    },

    /// A flooded message (see module docs).
    Broadcast {
        id: ConferenceId,
        origin: PublicKey,
        message_number: u32,
        data: BroadcastData,
    },
}

/// An unreliable conference packet. `data[0]` selects the registered
/// lossy handler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossyPacket {
    pub id: ConferenceId,
    pub origin: PublicKey,
    pub lossy_number: u16,
    pub data: Vec<u8>,
}

/// Encode a reliable packet.
pub fn encode(packet: &Packet) -> Vec<u8> {
    let mut out = Vec::new();
    // CBOR serialization of these enums cannot fail on an in-memory sink.
    if let Err(err) = ciborium::ser::into_writer(packet, &mut out) {
        tracing::error!(error = %err, "packet serialization failed");
        out.clear();
    }
    out
}

/// Decode a reliable packet.
pub fn decode(bytes: &[u8]) -> Result<Packet, WireError> {
    ciborium::de::from_reader(bytes).map_err(|e| WireError(e.to_string()))
}

/// Encode an unreliable packet.
pub fn encode_lossy(packet: &LossyPacket) -> Vec<u8> {
    let mut out = Vec::new();
    if let Err(err) = ciborium::ser::into_writer(packet, &mut out) {
        tracing::error!(error = %err, "lossy packet serialization failed");
        out.clear();
    }
    out
}

/// Decode an unreliable packet.
pub fn decode_lossy(bytes: &[u8]) -> Result<LossyPacket, WireError> {
    ciborium::de::from_reader(bytes).map_err(|e| WireError(e.to_string()))
}
