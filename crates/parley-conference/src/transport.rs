//! The friend-connection collaborator.
//!
//! The engine never talks to the network directly. An external layer owns
//! the authenticated pairwise pipes between long-term public keys and
//! exposes them through this trait; sends enqueue and return immediately.
//! Inbound packets are pushed back into the engine by the embedder via
//! [`crate::Conferences::handle_lossless_packet`] and
//! [`crate::Conferences::handle_lossy_packet`].

use parley_crypto::PublicKey;
use parley_types::FriendNumber;

/// The friend-connection layer refused a packet (congestion, link down).
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("send refused")]
pub struct SendError;

/// Pairwise encrypted byte pipes keyed by friend number.
///
/// Connections are reference-counted by the implementing layer:
/// [`FriendTransport::connect_to`] takes a reference and
/// [`FriendTransport::disconnect`] releases it; the underlying link
/// outlives the engine's interest if anything else still holds it.
pub trait FriendTransport {
    /// Queue a reliable, ordered packet. Must not block.
    fn send_lossless(&mut self, friend: FriendNumber, packet: &[u8]) -> Result<(), SendError>;

    /// Queue an unreliable packet. Must not block.
    fn send_lossy(&mut self, friend: FriendNumber, packet: &[u8]) -> Result<(), SendError>;

    /// The long-term public key behind a friend number.
    fn friend_public_key(&self, friend: FriendNumber) -> Option<PublicKey>;

    /// Resolve a long-term public key to an existing friend number.
    fn friend_by_public_key(&self, pk: &PublicKey) -> Option<FriendNumber>;

    /// Open (or take another reference to) a connection to `pk`.
    ///
    /// Returns `None` when the peer is unreachable.
    fn connect_to(&mut self, pk: &PublicKey) -> Option<FriendNumber>;

    /// Whether the connection behind `friend` is currently up.
    fn is_connected(&self, friend: FriendNumber) -> bool;

    /// Release our reference to the connection behind `friend`.
    fn disconnect(&mut self, friend: FriendNumber);
}
