//! In-memory friend links for deterministic tests.
//!
//! [`MemoryNetwork`] simulates the friend-connection layer: every node is
//! a [`MemoryTransport`] endpoint, links are symmetric, and packets queue
//! in the receiver's inbox until the test pumps them into
//! [`crate::Conferences::handle_lossless_packet`] /
//! [`crate::Conferences::handle_lossy_packet`]. Nothing here sleeps or
//! spawns; delivery order is the order of sends.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use parley_crypto::PublicKey;
use parley_types::FriendNumber;

use crate::transport::{FriendTransport, SendError};

/// One queued inbound packet: the friend number the receiver knows the
/// sender by, whether it arrived on the lossy pipe, and the bytes.
pub type Delivery = (FriendNumber, bool, Vec<u8>);

struct Node {
    pk: PublicKey,
    friends: Vec<PublicKey>,
    inbox: VecDeque<Delivery>,
}

#[derive(Default)]
struct Inner {
    nodes: Vec<Node>,
}

impl Inner {
    fn node_index(&self, pk: &PublicKey) -> Option<usize> {
        self.nodes.iter().position(|n| n.pk == *pk)
    }

    fn register(&mut self, pk: PublicKey) -> usize {
        if let Some(index) = self.node_index(&pk) {
            return index;
        }
        self.nodes.push(Node {
            pk,
            friends: Vec::new(),
            inbox: VecDeque::new(),
        });
        self.nodes.len() - 1
    }

    fn friend_slot(&mut self, node: usize, pk: PublicKey) -> FriendNumber {
        if let Some(slot) = self.nodes[node].friends.iter().position(|f| *f == pk) {
            return FriendNumber(slot as u32);
        }
        self.nodes[node].friends.push(pk);
        FriendNumber((self.nodes[node].friends.len() - 1) as u32)
    }

    fn link(&mut self, a: usize, b: usize) -> (FriendNumber, FriendNumber) {
        let b_pk = self.nodes[b].pk;
        let a_pk = self.nodes[a].pk;
        (self.friend_slot(a, b_pk), self.friend_slot(b, a_pk))
    }
}

/// A simulated network of friend links.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Rc<RefCell<Inner>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or fetch) the endpoint for `pk`.
    pub fn endpoint(&self, pk: PublicKey) -> MemoryTransport {
        self.inner.borrow_mut().register(pk);
        MemoryTransport {
            pk,
            inner: self.inner.clone(),
        }
    }

    /// Create a symmetric friendship, returning the friend numbers each
    /// side knows the other by.
    pub fn befriend(&self, a: &PublicKey, b: &PublicKey) -> (FriendNumber, FriendNumber) {
        let mut inner = self.inner.borrow_mut();
        let a_idx = inner.register(*a);
        let b_idx = inner.register(*b);
        inner.link(a_idx, b_idx)
    }
}

/// One node's view of the network.
#[derive(Clone)]
pub struct MemoryTransport {
    pk: PublicKey,
    inner: Rc<RefCell<Inner>>,
}

impl MemoryTransport {
    /// The public key this endpoint was registered with.
    pub fn public_key(&self) -> PublicKey {
        self.pk
    }

    /// Take every queued inbound packet.
    pub fn drain_inbox(&self) -> Vec<Delivery> {
        let mut inner = self.inner.borrow_mut();
        let Some(index) = inner.node_index(&self.pk) else {
            return Vec::new();
        };
        inner.nodes[index].inbox.drain(..).collect()
    }

    fn deliver(&mut self, friend: FriendNumber, lossy: bool, packet: &[u8]) -> Result<(), SendError> {
        let mut inner = self.inner.borrow_mut();
        let me = inner.node_index(&self.pk).ok_or(SendError)?;
        let target_pk = *inner.nodes[me]
            .friends
            .get(friend.0 as usize)
            .ok_or(SendError)?;
        let target = inner.node_index(&target_pk).ok_or(SendError)?;
        let seen_as = inner.nodes[target]
            .friends
            .iter()
            .position(|f| *f == self.pk)
            .ok_or(SendError)?;
        inner.nodes[target]
            .inbox
            .push_back((FriendNumber(seen_as as u32), lossy, packet.to_vec()));
        Ok(())
    }
}

impl FriendTransport for MemoryTransport {
    fn send_lossless(&mut self, friend: FriendNumber, packet: &[u8]) -> Result<(), SendError> {
        self.deliver(friend, false, packet)
    }

    fn send_lossy(&mut self, friend: FriendNumber, packet: &[u8]) -> Result<(), SendError> {
        self.deliver(friend, true, packet)
    }

    fn friend_public_key(&self, friend: FriendNumber) -> Option<PublicKey> {
        let inner = self.inner.borrow();
        let me = inner.node_index(&self.pk)?;
        inner.nodes[me].friends.get(friend.0 as usize).copied()
    }

    fn friend_by_public_key(&self, pk: &PublicKey) -> Option<FriendNumber> {
        let inner = self.inner.borrow();
        let me = inner.node_index(&self.pk)?;
        inner.nodes[me]
            .friends
            .iter()
            .position(|f| f == pk)
            .map(|slot| FriendNumber(slot as u32))
    }

    fn connect_to(&mut self, pk: &PublicKey) -> Option<FriendNumber> {
        let mut inner = self.inner.borrow_mut();
        let me = inner.node_index(&self.pk)?;
        let them = inner.node_index(pk)?;
        let (mine, _theirs) = inner.link(me, them);
        Some(mine)
    }

    fn is_connected(&self, friend: FriendNumber) -> bool {
        let inner = self.inner.borrow();
        let Some(me) = inner.node_index(&self.pk) else {
            return false;
        };
        inner.nodes[me]
            .friends
            .get(friend.0 as usize)
            .and_then(|pk| inner.node_index(pk))
            .is_some()
    }

    fn disconnect(&mut self, _friend: FriendNumber) {
        // Links are shared with the friendship layer in production;
        // releasing our reference leaves them alive here.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(first: u8) -> PublicKey {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        PublicKey::from_bytes(bytes)
    }

    #[test]
    fn test_befriend_is_symmetric() {
        let network = MemoryNetwork::new();
        let (a, b) = (pk(1), pk(2));
        let a_end = network.endpoint(a);
        let b_end = network.endpoint(b);
        let (a_fn, b_fn) = network.befriend(&a, &b);

        assert_eq!(a_end.friend_public_key(a_fn), Some(b));
        assert_eq!(b_end.friend_public_key(b_fn), Some(a));
        assert_eq!(a_end.friend_by_public_key(&b), Some(a_fn));
    }

    #[test]
    fn test_send_queues_with_receiver_side_number() {
        let network = MemoryNetwork::new();
        let (a, b) = (pk(1), pk(2));
        let mut a_end = network.endpoint(a);
        let b_end = network.endpoint(b);
        let (a_fn, b_fn) = network.befriend(&a, &b);

        a_end.send_lossless(a_fn, b"hello").expect("send");
        a_end.send_lossy(a_fn, b"frame").expect("send");

        let inbox = b_end.drain_inbox();
        assert_eq!(
            inbox,
            vec![
                (b_fn, false, b"hello".to_vec()),
                (b_fn, true, b"frame".to_vec()),
            ]
        );
        assert!(b_end.drain_inbox().is_empty());
    }

    #[test]
    fn test_send_to_unknown_friend_fails() {
        let network = MemoryNetwork::new();
        let mut a_end = network.endpoint(pk(1));
        assert_eq!(a_end.send_lossless(FriendNumber(9), b"x"), Err(SendError));
    }

    #[test]
    fn test_connect_to_registers_link() {
        let network = MemoryNetwork::new();
        let (a, b) = (pk(1), pk(2));
        let mut a_end = network.endpoint(a);
        let b_end = network.endpoint(b);

        let friend = a_end.connect_to(&b).expect("connect");
        assert!(a_end.is_connected(friend));
        assert!(b_end.friend_by_public_key(&a).is_some());
        assert!(a_end.connect_to(&pk(9)).is_none());
    }
}
