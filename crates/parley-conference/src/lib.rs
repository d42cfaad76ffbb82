//! # parley-conference
//!
//! Distributed, eventually-consistent conference (group chat) engine
//! layered over pairwise encrypted friend links.
//!
//! Each conference is identified by a 33-byte identifier (type byte plus a
//! shared symmetric key) and maintains a mesh of the peers whose public
//! keys are XOR-closest to ours. Messages flood across the mesh and are
//! deduplicated per `(peer, kind)` by sequence number; lossy packets
//! (audio frames) are deduplicated by a 256-entry sliding window per peer.
//!
//! The engine is single-threaded and cooperative: all state changes happen
//! inside [`Conferences::do_conferences`] or directly invoked entry
//! points, and packet I/O goes through the non-blocking
//! [`FriendTransport`] collaborator owned by the embedder.
//!
//! ## Modules
//!
//! - [`manager`] — the [`Conferences`] container and public surface
//! - [`conference`] — per-conference state, peer table, join machinery
//! - [`peer`] — peer entries, dedup records, the lossy window
//! - [`mesh`] — XOR-distance closest-peer election
//! - [`wire`] — CBOR packet envelopes
//! - [`transport`] — the friend-connection collaborator trait
//! - [`testing`] — an in-memory friend-link hub for deterministic tests
//!
//! ## Scheduling constants
//!
//! | Constant | Value |
//! |---|---|
//! | Mesh ping interval | 20 s |
//! | Peer inactivity expiry | 120 s |
//! | Join retry base delay | 10 s (doubled per failure) |
//! | Mesh re-election interval | 1 s |

pub mod conference;
pub mod manager;
pub mod mesh;
pub mod peer;
pub mod testing;
pub mod transport;
pub mod wire;

pub use manager::Conferences;
pub use transport::{FriendTransport, SendError};

/// Seconds between mesh keepalive pings.
pub const GROUP_PING_INTERVAL_SECS: u64 = 20;

/// Seconds of silence after which a peer is expired from the table.
pub const PEER_INACTIVITY_TIMEOUT_SECS: u64 = 120;

/// Seconds between closest-peer re-elections.
pub const CLOSE_CHECK_INTERVAL_SECS: u64 = 1;

/// Base delay between rejoin attempts; doubled per consecutive failure.
pub const JOIN_RETRY_BASE_SECS: u64 = 10;

/// Failure count at which rejoin attempts stop being retried faster.
pub const MAX_JOIN_FAILS: i8 = 6;

/// Dedup slots per peer, one per broadcast kind (two reserved).
pub const MAX_MESSAGE_KINDS: usize = 9;

/// Ticks a non-mesh friend connection is kept alive after a direct join.
pub const KEEP_CONNECTION_COUNT: u8 = 8;

/// Slots in the outstanding-join-request ring.
pub const JOIN_REQUEST_RING_SIZE: u32 = 64;

/// Seconds before an outstanding join request expires.
pub const JOIN_REQUEST_TIMEOUT_SECS: u64 = 30;

/// What changed when the peer name list changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatChange {
    /// A peer joined or left.
    Occurred = 0,
    /// A peer changed its name.
    PeerName = 1,
}

/// Kind of user message delivered to the message callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// A normal text message.
    Normal = 0,
    /// An action ("/me") message.
    Action = 1,
}

/// Error types for conference operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConferenceError {
    /// An argument was empty, too long, or otherwise out of range.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// The conference number does not refer to a live conference.
    #[error("no conference with number {0}")]
    InvalidGroup(u16),

    /// The peer number does not refer to a present peer.
    #[error("no peer with number {0}")]
    InvalidPeer(usize),

    /// The conference exists but is not connected.
    #[error("conference {0} is not connected")]
    NotConnected(u16),

    /// The friend-connection layer refused the packet.
    #[error("friend connection refused the packet")]
    SendFailed,

    /// The message number was already seen. Internal only; handlers
    /// swallow it rather than reporting upward.
    #[error("duplicate message")]
    Duplicate,
}

/// Convenience result type for conference operations.
pub type Result<T> = std::result::Result<T, ConferenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(GROUP_PING_INTERVAL_SECS, 20);
        assert_eq!(PEER_INACTIVITY_TIMEOUT_SECS, 120);
        assert_eq!(MAX_MESSAGE_KINDS, 9);
        assert_eq!(ChatChange::Occurred as u8, 0);
        assert_eq!(ChatChange::PeerName as u8, 1);
        assert_eq!(MessageType::Normal as u8, 0);
        assert_eq!(MessageType::Action as u8, 1);
    }
}
