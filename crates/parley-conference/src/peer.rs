//! Conference peer entries.
//!
//! A peer is known by its long-term `real_pk` and a per-session
//! `temp_pk`, carries a conference-unique [`PeerId`], and keeps one
//! highest-accepted sequence number per broadcast kind for flood
//! deduplication. Peers that exchange lossy traffic lazily allocate a
//! 256-entry sliding bit window.

use std::any::Any;

use parley_crypto::PublicKey;
use parley_types::{FriendNumber, PeerId, MAX_LOSSY_COUNT, MAX_NICK_LENGTH};

use crate::MAX_MESSAGE_KINDS;

/// Half the u32 sequence space; numbers further ahead than this are
/// treated as stale rather than new.
const DEDUP_WINDOW: u32 = 1 << 31;

/// A member of one conference.
pub struct Peer {
    /// Long-term identity key.
    pub real_pk: PublicKey,
    /// Per-session key.
    pub temp_pk: PublicKey,
    /// Conference-unique id, never reused while the conference lives.
    pub gid: PeerId,
    /// Nickname, at most [`MAX_NICK_LENGTH`] bytes.
    pub nick: Vec<u8>,
    /// Last time any broadcast from this peer was accepted.
    pub last_recv: u64,
    /// Highest accepted sequence number per broadcast kind.
    last_message_number: [Option<u32>; MAX_MESSAGE_KINDS],
    /// Friend connection carrying our direct link, if any.
    pub friendcon: Option<FriendNumber>,
    /// Whether the direct link is currently up.
    pub connected: bool,
    /// Countdown keeping a non-mesh link alive; decremented per inbound
    /// ping, the link closes only at zero.
    pub keep_connection: u8,
    /// Peer table sync owed to this peer.
    pub need_send_peers: bool,
    /// Lossy dedup window, allocated on first lossy packet.
    pub lossy: Option<LossyWindow>,
    /// Embedder-owned slot; the engine never touches its contents.
    pub object: Option<Box<dyn Any>>,
}

impl Peer {
    /// Create a fresh peer entry first seen at `now`.
    pub fn new(real_pk: PublicKey, temp_pk: PublicKey, gid: PeerId, now: u64) -> Self {
        Self {
            real_pk,
            temp_pk,
            gid,
            nick: Vec::new(),
            last_recv: now,
            last_message_number: [None; MAX_MESSAGE_KINDS],
            friendcon: None,
            connected: false,
            keep_connection: 0,
            need_send_peers: false,
            lossy: None,
            object: None,
        }
    }

    /// Record `number` for `slot` if it is newer than everything accepted
    /// so far. Returns `false` for duplicates and stale reorderings.
    ///
    /// "Newer" is strictly-greater within a half-range window, so the
    /// comparison survives u32 wraparound.
    pub fn accept_message_number(&mut self, slot: usize, number: u32) -> bool {
        let fresh = match self.last_message_number[slot] {
            None => true,
            Some(last) => {
                let ahead = number.wrapping_sub(last);
                ahead != 0 && ahead < DEDUP_WINDOW
            }
        };
        if fresh {
            self.last_message_number[slot] = Some(number);
        }
        fresh
    }

    /// Set the nickname, truncating to [`MAX_NICK_LENGTH`]. Returns
    /// whether it changed.
    pub fn set_nick(&mut self, nick: &[u8]) -> bool {
        let bounded = &nick[..nick.len().min(MAX_NICK_LENGTH)];
        if self.nick == bounded {
            return false;
        }
        self.nick = bounded.to_vec();
        true
    }

    /// Accept a lossy sequence number, allocating the window on first
    /// use. Returns `false` for duplicates and numbers behind the window.
    pub fn accept_lossy_number(&mut self, number: u16) -> bool {
        match &mut self.lossy {
            Some(window) => window.accept(number),
            None => {
                self.lossy = Some(LossyWindow::starting_at(number));
                true
            }
        }
    }
}

/// Sliding dedup window over the last [`MAX_LOSSY_COUNT`] lossy sequence
/// numbers of one peer.
#[derive(Clone, Debug)]
pub struct LossyWindow {
    /// Oldest sequence number still tracked.
    bottom: u16,
    /// Newest sequence number accepted.
    top: u16,
    /// One bit per number in `[bottom, top]`, indexed by `number % 256`.
    received: [u64; MAX_LOSSY_COUNT / 64],
}

impl LossyWindow {
    /// Create a window whose first accepted number is `number`.
    pub fn starting_at(number: u16) -> Self {
        let mut window = Self {
            bottom: number.wrapping_sub((MAX_LOSSY_COUNT - 1) as u16),
            top: number,
            received: [0; MAX_LOSSY_COUNT / 64],
        };
        window.set_bit(number);
        window
    }

    fn bit_index(number: u16) -> (usize, u64) {
        let idx = (number as usize) % MAX_LOSSY_COUNT;
        (idx / 64, 1u64 << (idx % 64))
    }

    fn set_bit(&mut self, number: u16) {
        let (word, mask) = Self::bit_index(number);
        self.received[word] |= mask;
    }

    fn clear_bit(&mut self, number: u16) {
        let (word, mask) = Self::bit_index(number);
        self.received[word] &= !mask;
    }

    fn is_set(&self, number: u16) -> bool {
        let (word, mask) = Self::bit_index(number);
        self.received[word] & mask != 0
    }

    /// Accept `number` if it is inside the window and unseen, or ahead of
    /// the window (which slides forward, forgetting what falls out).
    /// Numbers behind the window and duplicates are rejected.
    pub fn accept(&mut self, number: u16) -> bool {
        let behind = self.top.wrapping_sub(number);
        if (behind as usize) < MAX_LOSSY_COUNT {
            // Inside the current window.
            if self.is_set(number) {
                return false;
            }
            self.set_bit(number);
            return true;
        }

        let ahead = number.wrapping_sub(self.top);
        if ahead >= 1 << 15 {
            // Far behind: stale.
            return false;
        }

        // Ahead of the window: slide, clearing every position that the
        // new range covers for the first time.
        if (ahead as usize) >= MAX_LOSSY_COUNT {
            self.received = [0; MAX_LOSSY_COUNT / 64];
        } else {
            for step in 1..=ahead {
                self.clear_bit(self.top.wrapping_add(step));
            }
        }
        self.top = number;
        self.bottom = number.wrapping_sub((MAX_LOSSY_COUNT - 1) as u16);
        self.set_bit(number);
        true
    }

    /// Oldest tracked sequence number.
    pub fn bottom(&self) -> u16 {
        self.bottom
    }

    /// Newest accepted sequence number.
    pub fn top(&self) -> u16 {
        self.top
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new(
            PublicKey::from_bytes([1; 32]),
            PublicKey::from_bytes([2; 32]),
            PeerId::new(5).expect("gid"),
            100,
        )
    }

    #[test]
    fn test_first_message_number_accepted() {
        let mut p = peer();
        assert!(p.accept_message_number(0, 0));
        assert!(p.accept_message_number(1, u32::MAX));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut p = peer();
        assert!(p.accept_message_number(5, 10));
        assert!(!p.accept_message_number(5, 10));
        assert!(!p.accept_message_number(5, 9));
        assert!(p.accept_message_number(5, 11));
    }

    #[test]
    fn test_dedup_survives_wraparound() {
        let mut p = peer();
        assert!(p.accept_message_number(5, u32::MAX - 1));
        assert!(p.accept_message_number(5, u32::MAX));
        assert!(p.accept_message_number(5, 0));
        assert!(!p.accept_message_number(5, u32::MAX));
        assert!(p.accept_message_number(5, 1));
    }

    #[test]
    fn test_far_future_number_is_stale() {
        let mut p = peer();
        assert!(p.accept_message_number(5, 100));
        assert!(!p.accept_message_number(5, 100u32.wrapping_add(1 << 31)));
    }

    #[test]
    fn test_kinds_tracked_independently() {
        let mut p = peer();
        assert!(p.accept_message_number(0, 7));
        assert!(p.accept_message_number(1, 7));
        assert!(!p.accept_message_number(0, 7));
    }

    #[test]
    fn test_nick_bounded() {
        let mut p = peer();
        assert!(p.set_nick(&[b'x'; 300]));
        assert_eq!(p.nick.len(), MAX_NICK_LENGTH);
        assert!(!p.set_nick(&[b'x'; 300]));
    }

    #[test]
    fn test_lossy_window_basics() {
        let mut w = LossyWindow::starting_at(10);
        assert!(!w.accept(10));
        assert!(w.accept(11));
        assert!(w.accept(9));
        assert!(!w.accept(9));
        assert_eq!(w.top(), 11);
    }

    #[test]
    fn test_lossy_window_slides() {
        let mut w = LossyWindow::starting_at(0);
        assert!(w.accept(255));
        assert_eq!(w.top(), 255);
        // 0 is still inside the 256-wide window and already seen.
        assert!(!w.accept(0));
        // Sliding past it forgets it, but it is now behind the window.
        assert!(w.accept(300));
        assert!(!w.accept(0));
        assert_eq!(w.bottom(), 300 - 255);
    }

    #[test]
    fn test_lossy_window_big_jump_clears_all() {
        let mut w = LossyWindow::starting_at(5);
        assert!(w.accept(5000));
        assert!(w.accept(4999));
        assert!(!w.accept(5));
        assert!(!w.accept(5000 - 256));
    }

    #[test]
    fn test_lossy_window_rejects_half_range_behind() {
        let mut w = LossyWindow::starting_at(40_000);
        assert!(!w.accept(8_000));
        let mut w = LossyWindow::starting_at(100);
        // 16 bits wrap: 65_000 is behind 100, not ahead.
        assert!(!w.accept(65_000));
    }

    #[test]
    fn test_lossy_reuse_after_slide() {
        let mut w = LossyWindow::starting_at(0);
        assert!(w.accept(256));
        // Slot 0 was recycled for 256; number 0 itself is now behind.
        assert!(!w.accept(0));
        assert!(w.accept(1));
    }

    #[test]
    fn test_peer_lazy_window() {
        let mut p = peer();
        assert!(p.lossy.is_none());
        assert!(p.accept_lossy_number(9));
        assert!(p.lossy.is_some());
        assert!(!p.accept_lossy_number(9));
    }
}
