//! Per-conference state.
//!
//! A conference owns its peer table, join-candidate list, sequence
//! counters, title, and elected mesh neighbors. Peer ids are allocated
//! from a counter and never reused while the conference lives. All
//! back-references are indices; nothing here points back at the manager.

use std::any::Any;

use parley_crypto::{rng, PublicKey};
use parley_types::{ConferenceId, PeerId};

use crate::mesh;
use crate::peer::Peer;

/// A candidate to re-enter the conference through, remembered across
/// disconnects.
pub struct JoinPeer {
    /// The candidate's long-term key.
    pub real_pk: PublicKey,
    /// Earliest time for the next attempt.
    pub next_try_time: u64,
    /// Consecutive failed attempts; drives the retry backoff.
    pub fails: i8,
    /// Whether the candidate is currently in the peer table.
    pub online: bool,
    /// Set once we give up on this candidate.
    pub unsubscribed: bool,
}

/// Membership change queued for delivery from the next tick.
pub(crate) enum PendingEvent {
    PeerJoin {
        peernumber: usize,
    },
    PeerLeave {
        peernumber: usize,
        object: Option<Box<dyn Any>>,
    },
    NickChange {
        peernumber: usize,
    },
}

/// Hook invoked when a peer joins: `(conference_number, peernumber)`.
pub type PeerJoinHook = Box<dyn FnMut(u16, usize)>;
/// Hook invoked when a peer leaves, receiving the peer's embedder object.
pub type PeerLeaveHook = Box<dyn FnMut(u16, usize, Option<Box<dyn Any>>)>;
/// Hook invoked when the conference is deleted, receiving its object.
pub type DeleteHook = Box<dyn FnMut(u16, Option<Box<dyn Any>>)>;

/// One conference: identity, peer table, counters, and mesh election.
pub struct Conference {
    pub(crate) id: ConferenceId,
    pub(crate) self_pk: PublicKey,
    pub(crate) self_temp_pk: PublicKey,
    pub(crate) self_gid: Option<PeerId>,
    pub(crate) peers: Vec<Peer>,
    pub(crate) join_peers: Vec<JoinPeer>,
    /// Outbound sequence counter for broadcasts.
    pub(crate) message_number: u32,
    /// Outbound sequence counter for lossy packets.
    pub(crate) lossy_message_number: u16,
    pub(crate) title: Vec<u8>,
    /// Elected mesh neighbors, ranked by distance.
    pub(crate) closest: Vec<PeerId>,
    pub(crate) live: bool,
    pub(crate) join_mode: bool,
    pub(crate) keep_leave: bool,
    pub(crate) auto_join: bool,
    pub(crate) disable_auto_join: bool,
    pub(crate) invite_called: bool,
    pub(crate) need_send_name: bool,
    pub(crate) title_changed: bool,
    pub(crate) dirty_list: bool,
    pub(crate) last_sent_ping: u64,
    pub(crate) next_join_check_time: u64,
    pub(crate) last_close_check_time: u64,
    next_gid: i32,
    pub(crate) pending_events: Vec<PendingEvent>,
    pub(crate) object: Option<Box<dyn Any>>,
    pub(crate) on_peer_join: Option<PeerJoinHook>,
    pub(crate) on_peer_leave: Option<PeerLeaveHook>,
    pub(crate) on_delete: Option<DeleteHook>,
}

impl Conference {
    /// Create an empty conference shell. The caller decides whether it
    /// starts live (founder) or forming (joiner).
    pub(crate) fn new(
        id: ConferenceId,
        self_pk: PublicKey,
        self_temp_pk: PublicKey,
        now: u64,
    ) -> Self {
        Self {
            id,
            self_pk,
            self_temp_pk,
            self_gid: None,
            peers: Vec::new(),
            join_peers: Vec::new(),
            message_number: rng::random_u32(),
            lossy_message_number: rng::random_u16(),
            title: Vec::new(),
            closest: Vec::new(),
            live: false,
            join_mode: false,
            keep_leave: false,
            auto_join: true,
            disable_auto_join: false,
            invite_called: false,
            need_send_name: false,
            title_changed: false,
            dirty_list: false,
            last_sent_ping: now,
            next_join_check_time: now,
            last_close_check_time: 0,
            next_gid: 0,
            pending_events: Vec::new(),
            object: None,
            on_peer_join: None,
            on_peer_leave: None,
            on_delete: None,
        }
    }

    /// Allocate a peer id unused by any current member. Ids only ever
    /// move forward, so a departed peer's id is not handed out again
    /// until the 24-bit space wraps.
    pub(crate) fn allocate_gid(&mut self) -> PeerId {
        loop {
            let candidate = self.next_gid;
            self.next_gid = if self.next_gid >= PeerId::MAX {
                0
            } else {
                self.next_gid + 1
            };
            if let Ok(gid) = PeerId::new(candidate) {
                if !self.peers.iter().any(|p| p.gid == gid) {
                    return gid;
                }
            }
        }
    }

    /// Next outbound broadcast sequence number.
    pub(crate) fn next_message_number(&mut self) -> u32 {
        self.message_number = self.message_number.wrapping_add(1);
        self.message_number
    }

    /// Next outbound lossy sequence number.
    pub(crate) fn next_lossy_number(&mut self) -> u16 {
        self.lossy_message_number = self.lossy_message_number.wrapping_add(1);
        self.lossy_message_number
    }

    /// Add a peer, queueing the join event and marking every connected
    /// member as owing a peer-table sync.
    pub(crate) fn add_peer(
        &mut self,
        real_pk: PublicKey,
        temp_pk: PublicKey,
        gid: PeerId,
        now: u64,
    ) -> usize {
        if real_pk == self.self_pk {
            self.self_gid = Some(gid);
        }
        for peer in &mut self.peers {
            if peer.connected {
                peer.need_send_peers = true;
            }
        }
        self.peers.push(Peer::new(real_pk, temp_pk, gid, now));
        let peernumber = self.peers.len() - 1;
        self.dirty_list = true;
        self.pending_events.push(PendingEvent::PeerJoin { peernumber });
        self.set_join_peer_online(&real_pk, true, now);
        tracing::debug!(
            conference = hex::encode(&self.id.to_bytes()[..5]),
            peer = hex::encode(&real_pk.as_bytes()[..8]),
            gid = gid.value(),
            "peer added"
        );
        peernumber
    }

    /// Remove a peer by id, queueing the leave event. Returns whether a
    /// peer was removed.
    pub(crate) fn remove_peer(&mut self, gid: PeerId, now: u64) -> bool {
        let Some(peernumber) = self.peers.iter().position(|p| p.gid == gid) else {
            return false;
        };
        let mut peer = self.peers.remove(peernumber);
        self.dirty_list = true;
        self.pending_events.push(PendingEvent::PeerLeave {
            peernumber,
            object: peer.object.take(),
        });
        self.set_join_peer_online(&peer.real_pk, false, now);
        tracing::debug!(
            conference = hex::encode(&self.id.to_bytes()[..5]),
            gid = gid.value(),
            "peer removed"
        );
        true
    }

    /// Index of the peer with `gid`.
    pub(crate) fn peer_index(&self, gid: PeerId) -> Option<usize> {
        self.peers.iter().position(|p| p.gid == gid)
    }

    /// Index of the peer with `real_pk`.
    pub(crate) fn peer_index_by_pk(&self, pk: &PublicKey) -> Option<usize> {
        self.peers.iter().position(|p| p.real_pk == *pk)
    }

    /// Whether the peer at `peernumber` is us.
    pub(crate) fn peer_is_self(&self, peernumber: usize) -> bool {
        self.peers
            .get(peernumber)
            .is_some_and(|p| p.real_pk == self.self_pk)
    }

    /// Set (or insert) the join-candidate entry for `pk`.
    pub(crate) fn set_join_peer_online(&mut self, pk: &PublicKey, online: bool, now: u64) {
        if *pk == self.self_pk {
            return;
        }
        if let Some(jp) = self.join_peers.iter_mut().find(|jp| jp.real_pk == *pk) {
            jp.online = online;
            if online {
                jp.fails = 0;
                jp.unsubscribed = false;
            } else {
                jp.next_try_time = now + crate::JOIN_RETRY_BASE_SECS;
            }
            return;
        }
        self.join_peers.push(JoinPeer {
            real_pk: *pk,
            next_try_time: now + crate::JOIN_RETRY_BASE_SECS,
            fails: 0,
            online,
            unsubscribed: false,
        });
    }

    /// Re-elect the mesh neighbors. Returns `(added, removed)` peer ids;
    /// both empty when the election is unchanged.
    pub(crate) fn elect_closest(&mut self) -> (Vec<PeerId>, Vec<PeerId>) {
        let desired = mesh::elect_closest(
            &self.self_pk,
            self.peers
                .iter()
                .filter(|p| p.real_pk != self.self_pk)
                .map(|p| (p.gid, p.real_pk)),
        );
        let added: Vec<PeerId> = desired
            .iter()
            .copied()
            .filter(|gid| !self.closest.contains(gid))
            .collect();
        let removed: Vec<PeerId> = self
            .closest
            .iter()
            .copied()
            .filter(|gid| !desired.contains(gid))
            .collect();
        self.closest = desired;
        (added, removed)
    }

    /// Install a title the caller has already bounds-checked. Returns
    /// whether it changed.
    pub(crate) fn set_title(&mut self, title: &[u8]) -> bool {
        if self.title == title {
            return false;
        }
        self.title = title.to_vec();
        true
    }

    /// Friend numbers of every peer with an up direct link, minus
    /// `except`.
    pub(crate) fn connected_friends(
        &self,
        except: Option<parley_types::FriendNumber>,
    ) -> Vec<parley_types::FriendNumber> {
        self.peers
            .iter()
            .filter(|p| p.connected)
            .filter_map(|p| p.friendcon)
            .filter(|f| Some(*f) != except)
            .collect()
    }
}
