//! The conference manager.
//!
//! [`Conferences`] owns every conference as an arena slot addressed by a
//! `u16` conference number, the embedder-facing callbacks, and the
//! [`FriendTransport`] endpoint. All mutation happens inside directly
//! invoked entry points or [`Conferences::do_conferences`]; a failure in
//! one conference never prevents the others from ticking.

use std::any::Any;
use std::sync::Arc;

use parley_crypto::{rng, PublicKey};
use parley_pending::PingArray;
use parley_types::{
    Clock, ConferenceId, ConferenceType, FriendNumber, PeerId, MAX_NICK_LENGTH, MAX_TITLE_LENGTH,
};

use crate::conference::{Conference, DeleteHook, PeerJoinHook, PeerLeaveHook, PendingEvent};
use crate::transport::FriendTransport;
use crate::wire::{self, BroadcastData, LossyPacket, Packet, PeerEntry};
use crate::{
    ChatChange, ConferenceError, MessageType, Result, CLOSE_CHECK_INTERVAL_SECS,
    GROUP_PING_INTERVAL_SECS, JOIN_REQUEST_RING_SIZE, JOIN_REQUEST_TIMEOUT_SECS,
    JOIN_RETRY_BASE_SECS, KEEP_CONNECTION_COUNT, MAX_JOIN_FAILS, PEER_INACTIVITY_TIMEOUT_SECS,
};

/// Invoked when a friend invites us: `(friend, type, invite data)`. The
/// data is what [`Conferences::join_conference`] accepts.
pub type InviteCallback = Box<dyn FnMut(FriendNumber, ConferenceType, &[u8])>;
/// Invoked for every accepted (deduplicated) message:
/// `(conference, peernumber, kind, message)`.
pub type MessageCallback = Box<dyn FnMut(u16, usize, MessageType, &[u8])>;
/// Invoked when a title is accepted; the peer is `None` on initial join.
pub type TitleCallback = Box<dyn FnMut(u16, Option<usize>, &[u8])>;
/// Invoked when the peer name list changes.
pub type NamelistCallback = Box<dyn FnMut(u16, usize, ChatChange)>;
/// Handles one lossy packet id byte; returns whether to relay.
pub type LossyHandler = Box<dyn FnMut(u16, usize, &[u8]) -> bool>;

/// The conference engine: an arena of conferences over one transport.
pub struct Conferences<T: FriendTransport> {
    transport: T,
    clock: Arc<dyn Clock>,
    self_pk: PublicKey,
    self_temp_pk: PublicKey,
    our_name: Vec<u8>,
    chats: Vec<Option<Conference>>,
    /// Outstanding join requests awaiting a peer-list reply.
    join_requests: PingArray,
    is_online: bool,
    invite_cb: Option<InviteCallback>,
    message_cb: Option<MessageCallback>,
    title_cb: Option<TitleCallback>,
    namelist_cb: Option<NamelistCallback>,
    /// The single registered lossy handler and the packet id byte that
    /// selects it.
    lossy_handler: Option<(u8, LossyHandler)>,
}

fn conf_ref(chats: &[Option<Conference>], gn: u16) -> Result<&Conference> {
    chats
        .get(gn as usize)
        .and_then(|slot| slot.as_ref())
        .ok_or(ConferenceError::InvalidGroup(gn))
}

fn conf_mut(chats: &mut [Option<Conference>], gn: u16) -> Result<&mut Conference> {
    chats
        .get_mut(gn as usize)
        .and_then(|slot| slot.as_mut())
        .ok_or(ConferenceError::InvalidGroup(gn))
}

/// Flood a broadcast to every connected peer. Succeeds trivially when
/// there is no one to send to; fails only when every send is refused.
fn flood_broadcast<T: FriendTransport>(
    transport: &mut T,
    conf: &mut Conference,
    data: BroadcastData,
) -> Result<u32> {
    let message_number = conf.next_message_number();
    let packet = Packet::Broadcast {
        id: conf.id,
        origin: conf.self_pk,
        message_number,
        data,
    };
    let bytes = wire::encode(&packet);
    let targets = conf.connected_friends(None);
    if targets.is_empty() {
        return Ok(message_number);
    }
    let mut sent = 0usize;
    for friend in targets {
        if transport.send_lossless(friend, &bytes).is_ok() {
            sent += 1;
        }
    }
    if sent == 0 {
        return Err(ConferenceError::SendFailed);
    }
    Ok(message_number)
}

/// Serialize the whole peer table (plus title) for one recipient,
/// echoing the join token that solicited it (zero when unsolicited).
fn send_peer_list<T: FriendTransport>(
    transport: &mut T,
    conf: &Conference,
    friend: FriendNumber,
    token: u64,
) -> Result<()> {
    let peers = conf
        .peers
        .iter()
        .map(|p| PeerEntry {
            real_pk: p.real_pk,
            temp_pk: p.temp_pk,
            gid: p.gid,
            nick: p.nick.clone(),
        })
        .collect();
    let packet = Packet::PeerList {
        id: conf.id,
        peers,
        title: conf.title.clone(),
        token,
    };
    transport
        .send_lossless(friend, &wire::encode(&packet))
        .map_err(|_| ConferenceError::SendFailed)
}

impl<T: FriendTransport> Conferences<T> {
    /// Create an engine bound to our long-term and session keys.
    ///
    /// The engine starts online; use [`Conferences::set_online`] to gate
    /// join attempts on the embedder's connectivity.
    pub fn new(transport: T, clock: Arc<dyn Clock>, real_pk: PublicKey, temp_pk: PublicKey) -> Self {
        let join_requests = PingArray::new(
            JOIN_REQUEST_RING_SIZE,
            JOIN_REQUEST_TIMEOUT_SECS,
            clock.clone(),
        )
        .expect("ring parameters are nonzero constants");
        Self {
            transport,
            clock,
            self_pk: real_pk,
            self_temp_pk: temp_pk,
            our_name: Vec::new(),
            chats: Vec::new(),
            join_requests,
            is_online: true,
            invite_cb: None,
            message_cb: None,
            title_cb: None,
            namelist_cb: None,
            lossy_handler: None,
        }
    }

    /// Whether join attempts may use the network.
    pub fn set_online(&mut self, online: bool) {
        self.is_online = online;
    }

    // --- lifecycle -----------------------------------------------------

    /// Create a conference with a freshly generated identifier and
    /// ourselves as the only member.
    pub fn add_conference(&mut self, kind: ConferenceType) -> Result<u16> {
        let id = ConferenceId::new(kind, rng::new_symmetric_key());
        self.add_conference_with_id(id)
    }

    /// Create a conference with a supplied identifier (e.g. restored from
    /// the embedder's own records).
    pub fn add_conference_with_id(&mut self, id: ConferenceId) -> Result<u16> {
        if self.conference_by_id(&id).is_some() {
            return Err(ConferenceError::InvalidArg("conference already exists"));
        }
        let now = self.clock.now_secs();
        let mut conf = Conference::new(id, self.self_pk, self.self_temp_pk, now);
        conf.live = true;
        let gid = conf.allocate_gid();
        let peernumber = conf.add_peer(self.self_pk, self.self_temp_pk, gid, now);
        conf.peers[peernumber].set_nick(&self.our_name);
        conf.peers[peernumber].connected = true;
        self.insert(conf)
    }

    fn insert(&mut self, conf: Conference) -> Result<u16> {
        if let Some(slot) = self.chats.iter().position(|c| c.is_none()) {
            self.chats[slot] = Some(conf);
            return Ok(slot as u16);
        }
        if self.chats.len() >= usize::from(u16::MAX) {
            return Err(ConferenceError::InvalidArg("too many conferences"));
        }
        self.chats.push(Some(conf));
        Ok((self.chats.len() - 1) as u16)
    }

    /// Delete a conference, invoking its delete hook.
    pub fn delete_conference(&mut self, gn: u16) -> Result<()> {
        // Tell the others we are leaving; best effort.
        if let Ok(conf) = conf_mut(&mut self.chats, gn) {
            if conf.live {
                if let Some(gid) = conf.self_gid {
                    let _ = flood_broadcast(
                        &mut self.transport,
                        conf,
                        BroadcastData::KillPeer { gid },
                    );
                }
            }
        }

        let mut conf = self
            .chats
            .get_mut(gn as usize)
            .and_then(|slot| slot.take())
            .ok_or(ConferenceError::InvalidGroup(gn))?;
        for peer in &conf.peers {
            if let Some(friend) = peer.friendcon {
                self.transport.disconnect(friend);
            }
        }
        let object = conf.object.take();
        if let Some(mut hook) = conf.on_delete.take() {
            hook(gn, object);
        }
        tracing::debug!(conference = gn, "conference deleted");
        Ok(())
    }

    /// Leave a conference. With `keep_leave` the conference object is
    /// preserved in a left state (no auto-rejoin) and no delete hook
    /// fires; without it this is [`Conferences::delete_conference`].
    pub fn leave_conference(&mut self, gn: u16, keep_leave: bool) -> Result<()> {
        if !keep_leave {
            return self.delete_conference(gn);
        }
        let now = self.clock.now_secs();
        let conf = conf_mut(&mut self.chats, gn)?;
        if conf.live {
            if let Some(gid) = conf.self_gid {
                let _ = flood_broadcast(&mut self.transport, conf, BroadcastData::KillPeer { gid });
            }
        }
        for peer in &mut conf.peers {
            if let Some(friend) = peer.friendcon.take() {
                self.transport.disconnect(friend);
            }
        }
        conf.peers.clear();
        conf.closest.clear();
        conf.self_gid = None;
        conf.live = false;
        conf.join_mode = true;
        conf.keep_leave = true;
        for jp in &mut conf.join_peers {
            jp.online = false;
            jp.next_try_time = now + JOIN_RETRY_BASE_SECS;
        }
        Ok(())
    }

    /// Re-enter a conference previously left with `keep_leave`.
    pub fn enter_conference(&mut self, gn: u16) -> Result<()> {
        let now = self.clock.now_secs();
        let our_name = self.our_name.clone();
        let conf = conf_mut(&mut self.chats, gn)?;
        if conf.live {
            return Ok(());
        }
        conf.keep_leave = false;
        conf.join_mode = true;
        conf.next_join_check_time = now;
        if conf.join_peers.iter().all(|jp| jp.unsubscribed) || conf.join_peers.is_empty() {
            // No one to rejoin through; refound the conference alone.
            conf.join_mode = false;
            conf.live = true;
            let self_pk = conf.self_pk;
            let self_temp_pk = conf.self_temp_pk;
            if conf.peer_index_by_pk(&self_pk).is_none() {
                let gid = conf.allocate_gid();
                let peernumber = conf.add_peer(self_pk, self_temp_pk, gid, now);
                conf.peers[peernumber].set_nick(&our_name);
                conf.peers[peernumber].connected = true;
            }
        }
        Ok(())
    }

    /// Suppress or re-enable automatic rejoin for a conference.
    pub fn set_disable_auto_join(&mut self, gn: u16, disable: bool) -> Result<()> {
        conf_mut(&mut self.chats, gn)?.disable_auto_join = disable;
        Ok(())
    }

    /// Release every conference, invoking each delete hook.
    pub fn kill(mut self) {
        for gn in 0..self.chats.len() {
            if let Some(mut conf) = self.chats[gn].take() {
                let object = conf.object.take();
                if let Some(mut hook) = conf.on_delete.take() {
                    hook(gn as u16, object);
                }
            }
        }
    }

    // --- invite / join -------------------------------------------------

    /// Send a conference invite over a friend's lossless pipe.
    pub fn invite_friend(&mut self, friend: FriendNumber, gn: u16) -> Result<()> {
        let conf = conf_mut(&mut self.chats, gn)?;
        if !conf.live {
            return Err(ConferenceError::NotConnected(gn));
        }
        let packet = Packet::Invite { id: conf.id };
        self.transport
            .send_lossless(friend, &wire::encode(&packet))
            .map_err(|_| ConferenceError::SendFailed)?;
        conf.invite_called = true;
        Ok(())
    }

    /// Accept an invite received from `friend`. `data` is the invite
    /// payload handed to the invite callback; `expected` guards against
    /// joining an audio conference as text or vice versa.
    pub fn join_conference(
        &mut self,
        friend: FriendNumber,
        expected: ConferenceType,
        data: &[u8],
    ) -> Result<u16> {
        let id = ConferenceId::from_bytes(data)
            .map_err(|_| ConferenceError::InvalidArg("malformed invite data"))?;
        if id.kind() != expected {
            return Err(ConferenceError::InvalidArg("unexpected conference type"));
        }
        let inviter_pk = self
            .transport
            .friend_public_key(friend)
            .ok_or(ConferenceError::InvalidArg("unknown friend"))?;
        if let Some(existing) = self.conference_by_id(&id) {
            let conf = conf_ref(&self.chats, existing)?;
            if conf.live {
                return Err(ConferenceError::InvalidArg("already in this conference"));
            }
        }

        let now = self.clock.now_secs();
        let (gn, created) = match self.conference_by_id(&id) {
            Some(gn) => (gn, false),
            None => {
                let conf = Conference::new(id, self.self_pk, self.self_temp_pk, now);
                (self.insert(conf)?, true)
            }
        };
        let self_temp_pk = self.self_temp_pk;
        let token = self.join_requests.add(&id.to_bytes());
        let conf = conf_mut(&mut self.chats, gn)?;
        conf.join_mode = true;
        conf.keep_leave = false;
        conf.set_join_peer_online(&inviter_pk, false, now);

        let packet = Packet::Join {
            id,
            temp_pk: self_temp_pk,
            token,
        };
        if self
            .transport
            .send_lossless(friend, &wire::encode(&packet))
            .is_err()
        {
            if created {
                self.chats[gn as usize] = None;
            }
            return Err(ConferenceError::SendFailed);
        }
        Ok(gn)
    }

    // --- messaging -----------------------------------------------------

    /// Send a chat message to the conference. The message is also
    /// delivered locally through the message callback.
    pub fn send_message(&mut self, gn: u16, message: &[u8]) -> Result<()> {
        self.send_user_broadcast(gn, message, MessageType::Normal)
    }

    /// Send an action ("/me") message to the conference.
    pub fn send_action(&mut self, gn: u16, action: &[u8]) -> Result<()> {
        self.send_user_broadcast(gn, action, MessageType::Action)
    }

    fn send_user_broadcast(&mut self, gn: u16, message: &[u8], kind: MessageType) -> Result<()> {
        if message.is_empty() {
            return Err(ConferenceError::InvalidArg("empty message"));
        }
        let conf = conf_mut(&mut self.chats, gn)?;
        if !conf.live {
            return Err(ConferenceError::NotConnected(gn));
        }
        let data = match kind {
            MessageType::Normal => BroadcastData::Message(message.to_vec()),
            MessageType::Action => BroadcastData::Action(message.to_vec()),
        };
        flood_broadcast(&mut self.transport, conf, data)?;
        // Our own messages come back through the message callback, like
        // everyone else's.
        let peernumber = conf
            .peer_index_by_pk(&self.self_pk)
            .ok_or(ConferenceError::NotConnected(gn))?;
        if let Some(cb) = self.message_cb.as_mut() {
            cb(gn, peernumber, kind, message);
        }
        Ok(())
    }

    /// Set the conference title and flood it to the mesh.
    pub fn set_title(&mut self, gn: u16, title: &[u8]) -> Result<()> {
        if title.is_empty() || title.len() > MAX_TITLE_LENGTH {
            return Err(ConferenceError::InvalidArg("title length out of range"));
        }
        let conf = conf_mut(&mut self.chats, gn)?;
        if !conf.live {
            return Err(ConferenceError::NotConnected(gn));
        }
        conf.set_title(title);
        match flood_broadcast(&mut self.transport, conf, BroadcastData::Title(title.to_vec())) {
            Ok(_) => {
                conf.title_changed = false;
                Ok(())
            }
            Err(err) => {
                // Keep the local title; retry the flood from the tick.
                conf.title_changed = true;
                Err(err)
            }
        }
    }

    /// Current title length.
    pub fn title_len(&self, gn: u16) -> Result<usize> {
        let conf = conf_ref(&self.chats, gn)?;
        if conf.title.is_empty() {
            return Err(ConferenceError::InvalidArg("no title set"));
        }
        Ok(conf.title.len())
    }

    /// Current title.
    pub fn title(&self, gn: u16) -> Result<Vec<u8>> {
        let conf = conf_ref(&self.chats, gn)?;
        if conf.title.is_empty() {
            return Err(ConferenceError::InvalidArg("no title set"));
        }
        Ok(conf.title.clone())
    }

    /// Send a lossy, sequence-numbered packet (e.g. an audio frame) to
    /// the mesh. `data[0]` selects the handler on receiving peers.
    pub fn send_lossy_packet(&mut self, gn: u16, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(ConferenceError::InvalidArg("empty lossy packet"));
        }
        let conf = conf_mut(&mut self.chats, gn)?;
        if !conf.live {
            return Err(ConferenceError::NotConnected(gn));
        }
        let packet = LossyPacket {
            id: conf.id,
            origin: conf.self_pk,
            lossy_number: conf.next_lossy_number(),
            data: data.to_vec(),
        };
        let bytes = wire::encode_lossy(&packet);
        let targets = conf.connected_friends(None);
        if targets.is_empty() {
            return Ok(());
        }
        let mut sent = 0usize;
        for friend in targets {
            if self.transport.send_lossy(friend, &bytes).is_ok() {
                sent += 1;
            }
        }
        if sent == 0 {
            return Err(ConferenceError::SendFailed);
        }
        Ok(())
    }

    /// Set our nickname and flood it to every live conference.
    pub fn set_name_all_conferences(&mut self, name: &[u8]) -> Result<()> {
        if name.len() > MAX_NICK_LENGTH {
            return Err(ConferenceError::InvalidArg("name too long"));
        }
        self.our_name = name.to_vec();
        let name = self.our_name.clone();
        for gn in 0..self.chats.len() {
            let Some(conf) = self.chats[gn].as_mut() else {
                continue;
            };
            if !conf.live {
                continue;
            }
            if let Some(peernumber) = conf.peer_index_by_pk(&self.self_pk) {
                if conf.peers[peernumber].set_nick(&name) {
                    conf.pending_events
                        .push(PendingEvent::NickChange { peernumber });
                    conf.dirty_list = true;
                }
            }
            match flood_broadcast(&mut self.transport, conf, BroadcastData::Name(name.clone())) {
                Ok(_) => conf.need_send_name = false,
                Err(_) => conf.need_send_name = true,
            }
        }
        Ok(())
    }

    // --- accessors -----------------------------------------------------

    /// Number of peers in the conference, including us.
    pub fn peer_count(&self, gn: u16) -> Result<usize> {
        Ok(conf_ref(&self.chats, gn)?.peers.len())
    }

    /// Nickname of a peer.
    pub fn peer_name(&self, gn: u16, peernumber: usize) -> Result<Vec<u8>> {
        let conf = conf_ref(&self.chats, gn)?;
        conf.peers
            .get(peernumber)
            .map(|p| p.nick.clone())
            .ok_or(ConferenceError::InvalidPeer(peernumber))
    }

    /// Nickname length of a peer.
    pub fn peer_name_len(&self, gn: u16, peernumber: usize) -> Result<usize> {
        let conf = conf_ref(&self.chats, gn)?;
        conf.peers
            .get(peernumber)
            .map(|p| p.nick.len())
            .ok_or(ConferenceError::InvalidPeer(peernumber))
    }

    /// All peer nicknames, in peer-number order.
    pub fn peer_names(&self, gn: u16) -> Result<Vec<Vec<u8>>> {
        let conf = conf_ref(&self.chats, gn)?;
        Ok(conf.peers.iter().map(|p| p.nick.clone()).collect())
    }

    /// Long-term public key of a peer.
    pub fn peer_public_key(&self, gn: u16, peernumber: usize) -> Result<PublicKey> {
        let conf = conf_ref(&self.chats, gn)?;
        conf.peers
            .get(peernumber)
            .map(|p| p.real_pk)
            .ok_or(ConferenceError::InvalidPeer(peernumber))
    }

    /// Whether a peer number refers to us.
    pub fn peer_number_is_ours(&self, gn: u16, peernumber: usize) -> Result<bool> {
        let conf = conf_ref(&self.chats, gn)?;
        if peernumber >= conf.peers.len() {
            return Err(ConferenceError::InvalidPeer(peernumber));
        }
        Ok(conf.peer_is_self(peernumber))
    }

    /// Public keys of the currently elected mesh neighbors, nearest
    /// first.
    pub fn closest_peers(&self, gn: u16) -> Result<Vec<PublicKey>> {
        let conf = conf_ref(&self.chats, gn)?;
        Ok(conf
            .closest
            .iter()
            .filter_map(|gid| conf.peer_index(*gid))
            .map(|i| conf.peers[i].real_pk)
            .collect())
    }

    /// The conference type.
    pub fn conference_type(&self, gn: u16) -> Result<ConferenceType> {
        Ok(conf_ref(&self.chats, gn)?.id.kind())
    }

    /// The 33-byte conference identifier.
    pub fn conference_id(&self, gn: u16) -> Result<ConferenceId> {
        Ok(conf_ref(&self.chats, gn)?.id)
    }

    /// Find a conference by identifier.
    pub fn conference_by_id(&self, id: &ConferenceId) -> Option<u16> {
        self.chats
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|c| c.id == *id))
            .map(|gn| gn as u16)
    }

    /// Number of live conference slots.
    pub fn chat_count(&self) -> usize {
        self.chats.iter().filter(|slot| slot.is_some()).count()
    }

    /// Conference numbers of every live slot.
    pub fn chat_list(&self) -> Vec<u16> {
        self.chats
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(gn, _)| gn as u16)
            .collect()
    }

    // --- embedder objects ----------------------------------------------

    /// Attach an embedder object to a conference.
    pub fn set_object(&mut self, gn: u16, object: Option<Box<dyn Any>>) -> Result<()> {
        conf_mut(&mut self.chats, gn)?.object = object;
        Ok(())
    }

    /// The embedder object attached to a conference.
    pub fn object_mut(&mut self, gn: u16) -> Result<Option<&mut (dyn Any + 'static)>> {
        Ok(conf_mut(&mut self.chats, gn)?.object.as_deref_mut())
    }

    /// Attach an embedder object to a peer.
    pub fn peer_set_object(
        &mut self,
        gn: u16,
        peernumber: usize,
        object: Option<Box<dyn Any>>,
    ) -> Result<()> {
        let conf = conf_mut(&mut self.chats, gn)?;
        let peer = conf
            .peers
            .get_mut(peernumber)
            .ok_or(ConferenceError::InvalidPeer(peernumber))?;
        peer.object = object;
        Ok(())
    }

    /// The embedder object attached to a peer.
    pub fn peer_object_mut(
        &mut self,
        gn: u16,
        peernumber: usize,
    ) -> Result<Option<&mut (dyn Any + 'static)>> {
        let conf = conf_mut(&mut self.chats, gn)?;
        let peer = conf
            .peers
            .get_mut(peernumber)
            .ok_or(ConferenceError::InvalidPeer(peernumber))?;
        Ok(peer.object.as_deref_mut())
    }

    // --- callbacks -----------------------------------------------------

    /// Set the invite callback.
    pub fn on_invite(&mut self, cb: InviteCallback) {
        self.invite_cb = Some(cb);
    }

    /// Set the message callback.
    pub fn on_message(&mut self, cb: MessageCallback) {
        self.message_cb = Some(cb);
    }

    /// Set the title callback.
    pub fn on_title(&mut self, cb: TitleCallback) {
        self.title_cb = Some(cb);
    }

    /// Set the name-list-change callback.
    pub fn on_namelist_change(&mut self, cb: NamelistCallback) {
        self.namelist_cb = Some(cb);
    }

    /// Register the lossy packet handler for one id byte.
    pub fn set_lossy_handler(&mut self, byte: u8, handler: LossyHandler) {
        self.lossy_handler = Some((byte, handler));
    }

    /// Set a conference's peer-join hook.
    pub fn on_peer_join(&mut self, gn: u16, hook: PeerJoinHook) -> Result<()> {
        conf_mut(&mut self.chats, gn)?.on_peer_join = Some(hook);
        Ok(())
    }

    /// Set a conference's peer-leave hook.
    pub fn on_peer_leave(&mut self, gn: u16, hook: PeerLeaveHook) -> Result<()> {
        conf_mut(&mut self.chats, gn)?.on_peer_leave = Some(hook);
        Ok(())
    }

    /// Set a conference's delete hook.
    pub fn on_conference_delete(&mut self, gn: u16, hook: DeleteHook) -> Result<()> {
        conf_mut(&mut self.chats, gn)?.on_delete = Some(hook);
        Ok(())
    }

    // --- inbound packets -----------------------------------------------

    /// Process a reliable packet delivered by the friend-connection
    /// layer.
    pub fn handle_lossless_packet(&mut self, friend: FriendNumber, data: &[u8]) -> Result<()> {
        let packet =
            wire::decode(data).map_err(|_| ConferenceError::InvalidArg("malformed packet"))?;
        match packet {
            Packet::Invite { id } => {
                if let Some(cb) = self.invite_cb.as_mut() {
                    cb(friend, id.kind(), &id.to_bytes());
                }
                Ok(())
            }
            Packet::Join { id, temp_pk, token } => self.handle_join(friend, id, temp_pk, token),
            Packet::PeerList {
                id,
                peers,
                title,
                token,
            } => self.handle_peer_list(friend, id, peers, title, token),
            Packet::Broadcast {
                id,
                origin,
                message_number,
                data,
            } => self.handle_broadcast(friend, id, origin, message_number, data),
        }
    }

    fn handle_join(
        &mut self,
        friend: FriendNumber,
        id: ConferenceId,
        temp_pk: PublicKey,
        token: u64,
    ) -> Result<()> {
        let Some(gn) = self.conference_by_id(&id) else {
            return Ok(());
        };
        let Some(sender_pk) = self.transport.friend_public_key(friend) else {
            return Ok(());
        };
        let now = self.clock.now_secs();
        let conf = conf_mut(&mut self.chats, gn)?;
        if !conf.live {
            return Ok(());
        }

        let known = conf.peer_index_by_pk(&sender_pk).is_some()
            || conf.join_peers.iter().any(|jp| jp.real_pk == sender_pk);
        if !conf.invite_called && !known {
            tracing::debug!(
                conference = gn,
                peer = hex::encode(&sender_pk.as_bytes()[..8]),
                "ignoring join from unknown peer"
            );
            return Ok(());
        }

        let peernumber = match conf.peer_index_by_pk(&sender_pk) {
            Some(peernumber) => peernumber,
            None => {
                let gid = conf.allocate_gid();
                let peernumber = conf.add_peer(sender_pk, temp_pk, gid, now);
                // Introduce the newcomer to everyone else.
                let entry = PeerEntry {
                    real_pk: sender_pk,
                    temp_pk,
                    gid,
                    nick: Vec::new(),
                };
                let _ = flood_broadcast(
                    &mut self.transport,
                    conf_mut(&mut self.chats, gn)?,
                    BroadcastData::NewPeer(entry),
                );
                peernumber
            }
        };

        let conf = conf_mut(&mut self.chats, gn)?;
        let peer = &mut conf.peers[peernumber];
        peer.temp_pk = temp_pk;
        peer.friendcon = Some(friend);
        peer.connected = true;
        peer.keep_connection = KEEP_CONNECTION_COUNT;
        peer.last_recv = now;
        peer.need_send_peers = false;
        send_peer_list(&mut self.transport, conf, friend, token)
    }

    fn handle_peer_list(
        &mut self,
        friend: FriendNumber,
        id: ConferenceId,
        entries: Vec<PeerEntry>,
        title: Vec<u8>,
        token: u64,
    ) -> Result<()> {
        let Some(gn) = self.conference_by_id(&id) else {
            return Ok(());
        };
        let Some(sender_pk) = self.transport.friend_public_key(friend) else {
            return Ok(());
        };
        let now = self.clock.now_secs();
        let our_name = self.our_name.clone();
        let self_pk = self.self_pk;

        let conf = conf_mut(&mut self.chats, gn)?;
        let joining = conf.join_mode;
        if joining {
            // A forming conference only installs a table it asked for:
            // the token must match an outstanding join request for this
            // identifier.
            let solicited = self
                .join_requests
                .check(token)
                .map(|stored| stored == id.to_bytes())
                .unwrap_or(false);
            if !solicited {
                tracing::debug!(conference = gn, "ignoring unsolicited peer list");
                return Ok(());
            }
        } else {
            // Only connected members may refresh our table.
            let known = conf
                .peer_index_by_pk(&sender_pk)
                .map(|i| conf.peers[i].connected)
                .unwrap_or(false);
            if !known {
                return Ok(());
            }
        }

        let mut title_installed = false;
        for entry in entries {
            if let Some(existing) = conf.peer_index_by_pk(&entry.real_pk) {
                let peer = &mut conf.peers[existing];
                peer.temp_pk = entry.temp_pk;
                if peer.real_pk != self_pk && peer.set_nick(&entry.nick) {
                    conf.pending_events.push(PendingEvent::NickChange {
                        peernumber: existing,
                    });
                    conf.dirty_list = true;
                }
                continue;
            }
            // A gid collision with a different key means divergent state;
            // drop the entry and let a later sync settle it.
            if conf.peer_index(entry.gid).is_some() {
                continue;
            }
            let peernumber = conf.add_peer(entry.real_pk, entry.temp_pk, entry.gid, now);
            if entry.real_pk == self_pk {
                conf.peers[peernumber].set_nick(&our_name);
                conf.peers[peernumber].connected = true;
            } else {
                conf.peers[peernumber].set_nick(&entry.nick);
            }
        }

        if joining {
            conf.live = true;
            conf.join_mode = false;
            conf.keep_leave = false;
            if let Some(jp) = conf
                .join_peers
                .iter_mut()
                .find(|jp| jp.real_pk == sender_pk)
            {
                jp.fails = 0;
                jp.online = true;
            }
            if !title.is_empty() && title.len() <= MAX_TITLE_LENGTH && conf.set_title(&title) {
                title_installed = true;
            }
        }

        if let Some(peernumber) = conf.peer_index_by_pk(&sender_pk) {
            let peer = &mut conf.peers[peernumber];
            peer.friendcon = Some(friend);
            peer.connected = true;
            peer.last_recv = now;
        }

        if title_installed {
            let title = conf.title.clone();
            if let Some(cb) = self.title_cb.as_mut() {
                cb(gn, None, &title);
            }
        }
        Ok(())
    }

    fn handle_broadcast(
        &mut self,
        friend: FriendNumber,
        id: ConferenceId,
        origin: PublicKey,
        message_number: u32,
        data: BroadcastData,
    ) -> Result<()> {
        let Some(gn) = self.conference_by_id(&id) else {
            return Ok(());
        };
        if origin == self.self_pk {
            // Our own flood coming back around.
            return Ok(());
        }
        let now = self.clock.now_secs();
        let self_pk = self.self_pk;

        let conf = conf_mut(&mut self.chats, gn)?;
        if !conf.live {
            return Ok(());
        }
        let Some(peernumber) = conf.peer_index_by_pk(&origin) else {
            return Ok(());
        };
        if !conf.peers[peernumber].accept_message_number(data.dedup_slot(), message_number) {
            // Seen before via another path; drop silently.
            return Ok(());
        }
        conf.peers[peernumber].last_recv = now;

        let mut relay = true;
        match &data {
            BroadcastData::Ping => {
                let peer = &mut conf.peers[peernumber];
                peer.keep_connection = peer.keep_connection.saturating_sub(1);
            }
            BroadcastData::NewPeer(entry) => {
                if entry.real_pk != self_pk
                    && conf.peer_index_by_pk(&entry.real_pk).is_none()
                    && conf.peer_index(entry.gid).is_none()
                {
                    let new_peernumber =
                        conf.add_peer(entry.real_pk, entry.temp_pk, entry.gid, now);
                    conf.peers[new_peernumber].set_nick(&entry.nick);
                }
            }
            BroadcastData::KillPeer { gid } => {
                if conf.self_gid == Some(*gid) {
                    // We were removed; fall back to forming and rejoin if
                    // allowed.
                    conf.live = false;
                    conf.join_mode = conf.auto_join && !conf.disable_auto_join;
                    conf.peers.clear();
                    conf.closest.clear();
                    conf.self_gid = None;
                    relay = false;
                } else {
                    conf.remove_peer(*gid, now);
                }
            }
            BroadcastData::Name(name) => {
                if conf.peers[peernumber].set_nick(name) {
                    conf.pending_events
                        .push(PendingEvent::NickChange { peernumber });
                    conf.dirty_list = true;
                }
            }
            BroadcastData::Title(title) => {
                if !title.is_empty() && title.len() <= MAX_TITLE_LENGTH && conf.set_title(title) {
                    let title = conf.title.clone();
                    if let Some(cb) = self.title_cb.as_mut() {
                        cb(gn, Some(peernumber), &title);
                    }
                }
            }
            BroadcastData::Message(message) => {
                if let Some(cb) = self.message_cb.as_mut() {
                    cb(gn, peernumber, MessageType::Normal, message);
                }
            }
            BroadcastData::Action(action) => {
                if let Some(cb) = self.message_cb.as_mut() {
                    cb(gn, peernumber, MessageType::Action, action);
                }
            }
        }

        if relay {
            let conf = conf_mut(&mut self.chats, gn)?;
            let origin_link = conf
                .peer_index_by_pk(&origin)
                .and_then(|i| conf.peers[i].friendcon);
            let packet = Packet::Broadcast {
                id,
                origin,
                message_number,
                data,
            };
            let bytes = wire::encode(&packet);
            for target in conf.connected_friends(Some(friend)) {
                if Some(target) == origin_link {
                    continue;
                }
                if let Err(err) = self.transport.send_lossless(target, &bytes) {
                    tracing::debug!(conference = gn, error = %err, "relay send refused");
                }
            }
        }
        Ok(())
    }

    /// Process a lossy packet delivered by the friend-connection layer.
    pub fn handle_lossy_packet(&mut self, friend: FriendNumber, data: &[u8]) -> Result<()> {
        let packet = wire::decode_lossy(data)
            .map_err(|_| ConferenceError::InvalidArg("malformed packet"))?;
        let Some(gn) = self.conference_by_id(&packet.id) else {
            return Ok(());
        };
        if packet.origin == self.self_pk {
            return Ok(());
        }
        if packet.data.is_empty() {
            return Err(ConferenceError::InvalidArg("empty lossy packet"));
        }
        let now = self.clock.now_secs();

        let conf = conf_mut(&mut self.chats, gn)?;
        if !conf.live {
            return Ok(());
        }
        let Some(peernumber) = conf.peer_index_by_pk(&packet.origin) else {
            return Ok(());
        };
        if !conf.peers[peernumber].accept_lossy_number(packet.lossy_number) {
            return Ok(());
        }
        conf.peers[peernumber].last_recv = now;

        let relay = match self.lossy_handler.as_mut() {
            Some((byte, handler)) if *byte == packet.data[0] => {
                handler(gn, peernumber, &packet.data)
            }
            _ => false,
        };

        if relay {
            let conf = conf_mut(&mut self.chats, gn)?;
            let origin_link = conf
                .peer_index_by_pk(&packet.origin)
                .and_then(|i| conf.peers[i].friendcon);
            let bytes = wire::encode_lossy(&packet);
            for target in conf.connected_friends(Some(friend)) {
                if Some(target) == origin_link {
                    continue;
                }
                let _ = self.transport.send_lossy(target, &bytes);
            }
        }
        Ok(())
    }

    // --- the periodic tick ---------------------------------------------

    /// Drive timeouts, pings, elections, join retries, deferred sends,
    /// and queued membership events. Call this regularly (once a second
    /// is plenty). A failure in one conference is logged and isolated.
    pub fn do_conferences(&mut self) {
        let now = self.clock.now_secs();
        for gn in 0..self.chats.len() {
            if self.chats[gn].is_none() {
                continue;
            }
            if let Err(err) = self.tick_conference(gn as u16, now) {
                tracing::warn!(conference = gn, error = %err, "conference tick failed");
            }
        }
    }

    fn tick_conference(&mut self, gn: u16, now: u64) -> Result<()> {
        let clock = self.clock.clone();
        let self_pk = self.self_pk;
        let self_temp_pk = self.self_temp_pk;
        let our_name = self.our_name.clone();

        {
            let conf = conf_mut(&mut self.chats, gn)?;
            if conf.live {
                // (a) never expire ourselves; expire silent peers.
                if let Some(i) = conf.peer_index_by_pk(&self_pk) {
                    conf.peers[i].last_recv = now;
                }
                let expired: Vec<PeerId> = conf
                    .peers
                    .iter()
                    .filter(|p| {
                        p.real_pk != self_pk
                            && clock.is_timeout(p.last_recv, PEER_INACTIVITY_TIMEOUT_SECS)
                    })
                    .map(|p| p.gid)
                    .collect();
                for gid in expired {
                    if let Some(i) = conf.peer_index(gid) {
                        if let Some(friend) = conf.peers[i].friendcon.take() {
                            self.transport.disconnect(friend);
                        }
                    }
                    conf.remove_peer(gid, now);
                }

                // (b) mesh keepalive.
                if clock.is_timeout(conf.last_sent_ping, GROUP_PING_INTERVAL_SECS) {
                    if flood_broadcast(&mut self.transport, conf, BroadcastData::Ping).is_ok() {
                        conf.last_sent_ping = now;
                    }
                }

                // (c) closest-peer election and link maintenance.
                if clock.is_timeout(conf.last_close_check_time, CLOSE_CHECK_INTERVAL_SECS) {
                    conf.last_close_check_time = now;
                    let (_added, removed) = conf.elect_closest();
                    for gid in removed {
                        let Some(i) = conf.peer_index(gid) else {
                            continue;
                        };
                        let peer = &mut conf.peers[i];
                        if peer.keep_connection == 0 {
                            if let Some(friend) = peer.friendcon.take() {
                                self.transport.disconnect(friend);
                            }
                            peer.connected = false;
                        }
                    }
                    let elected = conf.closest.clone();
                    for gid in elected {
                        let Some(i) = conf.peer_index(gid) else {
                            continue;
                        };
                        let peer_pk = conf.peers[i].real_pk;
                        if conf.peers[i].friendcon.is_none() {
                            conf.peers[i].friendcon = self
                                .transport
                                .friend_by_public_key(&peer_pk)
                                .or_else(|| self.transport.connect_to(&peer_pk));
                        }
                        let Some(friend) = conf.peers[i].friendcon else {
                            continue;
                        };
                        if !conf.peers[i].connected && self.transport.is_connected(friend) {
                            conf.peers[i].connected = true;
                            conf.peers[i].need_send_peers = true;
                            let packet = Packet::Join {
                                id: conf.id,
                                temp_pk: self_temp_pk,
                                token: 0,
                            };
                            let _ = self.transport.send_lossless(friend, &wire::encode(&packet));
                        }
                    }
                }

                // (e) deferred name / title / peer-table sends.
                if conf.need_send_name && !our_name.is_empty() {
                    if flood_broadcast(
                        &mut self.transport,
                        conf,
                        BroadcastData::Name(our_name.clone()),
                    )
                    .is_ok()
                    {
                        conf.need_send_name = false;
                    }
                }
                if conf.title_changed && !conf.title.is_empty() {
                    let title = conf.title.clone();
                    if flood_broadcast(&mut self.transport, conf, BroadcastData::Title(title))
                        .is_ok()
                    {
                        conf.title_changed = false;
                    }
                }
                let owed: Vec<(usize, FriendNumber)> = conf
                    .peers
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.need_send_peers && p.connected)
                    .filter_map(|(i, p)| p.friendcon.map(|f| (i, f)))
                    .collect();
                for (i, friend) in owed {
                    if send_peer_list(&mut self.transport, conf, friend, 0).is_ok() {
                        conf.peers[i].need_send_peers = false;
                    }
                }
            } else if conf.join_mode && !conf.keep_leave && self.is_online {
                // (d) rejoin attempts with exponential backoff.
                if now >= conf.next_join_check_time {
                    conf.next_join_check_time = now + 1;
                    let id = conf.id;
                    for jp in &mut conf.join_peers {
                        if jp.online || jp.unsubscribed || now < jp.next_try_time {
                            continue;
                        }
                        let friend = self
                            .transport
                            .friend_by_public_key(&jp.real_pk)
                            .or_else(|| self.transport.connect_to(&jp.real_pk));
                        if let Some(friend) = friend {
                            if self.transport.is_connected(friend) {
                                let packet = Packet::Join {
                                    id,
                                    temp_pk: self_temp_pk,
                                    token: self.join_requests.add(&id.to_bytes()),
                                };
                                let _ = self
                                    .transport
                                    .send_lossless(friend, &wire::encode(&packet));
                            }
                        }
                        jp.fails = jp.fails.saturating_add(1);
                        let shift = jp.fails.clamp(0, MAX_JOIN_FAILS) as u32;
                        jp.next_try_time = now + (JOIN_RETRY_BASE_SECS << shift);
                        if jp.fails > 2 * MAX_JOIN_FAILS {
                            jp.unsubscribed = true;
                        }
                    }
                }
            }
        }

        // (f) deliver queued membership events.
        let (events, mut join_hook, mut leave_hook) = {
            let conf = conf_mut(&mut self.chats, gn)?;
            conf.dirty_list = false;
            (
                std::mem::take(&mut conf.pending_events),
                conf.on_peer_join.take(),
                conf.on_peer_leave.take(),
            )
        };
        for event in events {
            match event {
                PendingEvent::PeerJoin { peernumber } => {
                    if let Some(hook) = join_hook.as_mut() {
                        hook(gn, peernumber);
                    }
                    if let Some(cb) = self.namelist_cb.as_mut() {
                        cb(gn, peernumber, ChatChange::Occurred);
                    }
                }
                PendingEvent::PeerLeave { peernumber, object } => {
                    if let Some(hook) = leave_hook.as_mut() {
                        hook(gn, peernumber, object);
                    } else {
                        drop(object);
                    }
                    if let Some(cb) = self.namelist_cb.as_mut() {
                        cb(gn, peernumber, ChatChange::Occurred);
                    }
                }
                PendingEvent::NickChange { peernumber } => {
                    if let Some(cb) = self.namelist_cb.as_mut() {
                        cb(gn, peernumber, ChatChange::PeerName);
                    }
                }
            }
        }
        if let Ok(conf) = conf_mut(&mut self.chats, gn) {
            if join_hook.is_some() {
                conf.on_peer_join = join_hook;
            }
            if leave_hook.is_some() {
                conf.on_peer_leave = leave_hook;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryNetwork;
    use parley_types::ManualClock;

    fn engine() -> Conferences<crate::testing::MemoryTransport> {
        let network = MemoryNetwork::new();
        let pk = PublicKey::from_bytes([1; 32]);
        let transport = network.endpoint(pk);
        Conferences::new(
            transport,
            Arc::new(ManualClock::new(1_000)),
            pk,
            PublicKey::from_bytes([2; 32]),
        )
    }

    #[test]
    fn test_create_and_enumerate() {
        let mut conferences = engine();
        let gn = conferences
            .add_conference(ConferenceType::Text)
            .expect("create");
        assert_eq!(gn, 0);
        assert_eq!(conferences.chat_count(), 1);
        assert_eq!(conferences.chat_list(), vec![0]);
        assert_eq!(
            conferences.conference_type(0).expect("type"),
            ConferenceType::Text
        );
        assert_eq!(conferences.peer_count(0).expect("count"), 1);
        assert!(conferences.peer_number_is_ours(0, 0).expect("ours"));
    }

    #[test]
    fn test_conference_id_lookup() {
        let mut conferences = engine();
        let gn = conferences
            .add_conference(ConferenceType::Av)
            .expect("create");
        let id = conferences.conference_id(gn).expect("id");
        assert_eq!(id.to_bytes()[0], 1);
        assert_eq!(conferences.conference_by_id(&id), Some(gn));
        conferences.delete_conference(gn).expect("delete");
        assert_eq!(conferences.conference_by_id(&id), None);
    }

    #[test]
    fn test_slot_reuse_after_delete() {
        let mut conferences = engine();
        let a = conferences
            .add_conference(ConferenceType::Text)
            .expect("create");
        let b = conferences
            .add_conference(ConferenceType::Text)
            .expect("create");
        assert_eq!((a, b), (0, 1));
        conferences.delete_conference(a).expect("delete");
        let c = conferences
            .add_conference(ConferenceType::Text)
            .expect("create");
        assert_eq!(c, 0);
        assert_eq!(conferences.chat_count(), 2);
    }

    #[test]
    fn test_title_bounds() {
        let mut conferences = engine();
        let gn = conferences
            .add_conference(ConferenceType::Text)
            .expect("create");

        assert!(matches!(
            conferences.set_title(gn, b""),
            Err(ConferenceError::InvalidArg(_))
        ));
        assert!(matches!(
            conferences.set_title(gn, &[b'x'; MAX_TITLE_LENGTH + 1]),
            Err(ConferenceError::InvalidArg(_))
        ));

        conferences.set_title(gn, b"hello").expect("set title");
        assert_eq!(conferences.title_len(gn).expect("len"), 5);
        assert_eq!(conferences.title(gn).expect("title"), b"hello");
    }

    #[test]
    fn test_title_unset_is_error() {
        let mut conferences = engine();
        let gn = conferences
            .add_conference(ConferenceType::Text)
            .expect("create");
        assert!(conferences.title(gn).is_err());
        assert!(conferences.title_len(gn).is_err());
    }

    #[test]
    fn test_invalid_group_errors() {
        let mut conferences = engine();
        assert_eq!(
            conferences.peer_count(7),
            Err(ConferenceError::InvalidGroup(7))
        );
        assert_eq!(
            conferences.send_message(7, b"hi"),
            Err(ConferenceError::InvalidGroup(7))
        );
        assert_eq!(
            conferences.delete_conference(7),
            Err(ConferenceError::InvalidGroup(7))
        );
    }

    #[test]
    fn test_message_requires_content() {
        let mut conferences = engine();
        let gn = conferences
            .add_conference(ConferenceType::Text)
            .expect("create");
        assert!(matches!(
            conferences.send_message(gn, b""),
            Err(ConferenceError::InvalidArg(_))
        ));
    }

    #[test]
    fn test_own_message_delivered_locally() {
        let mut conferences = engine();
        let gn = conferences
            .add_conference(ConferenceType::Text)
            .expect("create");
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = seen.clone();
        conferences.on_message(Box::new(move |gn, pn, kind, msg| {
            sink.borrow_mut().push((gn, pn, kind, msg.to_vec()));
        }));
        conferences.send_message(gn, b"to myself").expect("send");
        assert_eq!(
            *seen.borrow(),
            vec![(gn, 0, MessageType::Normal, b"to myself".to_vec())]
        );
    }

    #[test]
    fn test_embedder_objects() {
        let mut conferences = engine();
        let gn = conferences
            .add_conference(ConferenceType::Text)
            .expect("create");
        conferences
            .set_object(gn, Some(Box::new(41u32)))
            .expect("set");
        let object = conferences.object_mut(gn).expect("get").expect("present");
        if let Some(n) = object.downcast_mut::<u32>() {
            *n += 1;
        }
        let object = conferences.object_mut(gn).expect("get").expect("present");
        assert_eq!(object.downcast_ref::<u32>(), Some(&42));

        conferences
            .peer_set_object(gn, 0, Some(Box::new("tag")))
            .expect("set");
        assert!(conferences
            .peer_object_mut(gn, 0)
            .expect("get")
            .is_some());
        assert!(conferences.peer_object_mut(gn, 1).is_err());
    }

    #[test]
    fn test_duplicate_identifier_rejected() {
        let mut conferences = engine();
        let gn = conferences
            .add_conference(ConferenceType::Text)
            .expect("create");
        let id = conferences.conference_id(gn).expect("id");
        assert!(matches!(
            conferences.add_conference_with_id(id),
            Err(ConferenceError::InvalidArg(_))
        ));
    }
}
