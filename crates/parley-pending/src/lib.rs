//! # parley-pending
//!
//! A fixed-capacity, time-expiring ring of outstanding requests.
//!
//! Request/response protocols hand out an opaque 64-bit token with every
//! request they send, store the request payload here, and match a reply by
//! presenting the token. The slot index is embedded in the low bits of the
//! token (`token % capacity == slot`), so lookup is O(1) without a hash
//! table, while the random high bits keep tokens unforgeable within the
//! `2^64 / capacity` key space.
//!
//! Entries expire after a fixed timeout and are evicted lazily from the
//! tail; when the ring is full the oldest live entry is force-evicted.
//! A token is single-use: a successful [`PingArray::check`] clears the
//! slot.

use std::sync::Arc;

use parley_crypto::rng;
use parley_types::Clock;

/// Error types for the pending-request ring.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PendingError {
    /// The ring capacity must be nonzero.
    #[error("ring capacity must be nonzero")]
    InvalidSize,

    /// The entry timeout must be nonzero.
    #[error("entry timeout must be nonzero")]
    InvalidTimeout,

    /// The token is zero, stale, expired, or already consumed.
    #[error("unknown or expired token")]
    UnknownToken,
}

/// Convenience result type for ring operations.
pub type Result<T> = std::result::Result<T, PendingError>;

#[derive(Default)]
struct Entry {
    data: Option<Vec<u8>>,
    time: u64,
    token: u64,
}

impl Entry {
    fn clear(&mut self) {
        self.data = None;
        self.time = 0;
        self.token = 0;
    }
}

/// Ring of outstanding request payloads keyed by single-use tokens.
///
/// Live slots are exactly `[last_deleted, last_added)` modulo the
/// capacity; both counters only ever grow (wrapping), so
/// `last_added - last_deleted` is the live count.
pub struct PingArray {
    entries: Vec<Entry>,
    last_deleted: u32,
    last_added: u32,
    timeout_secs: u64,
    clock: Arc<dyn Clock>,
}

impl PingArray {
    /// Create a ring with `capacity` slots whose entries expire after
    /// `timeout_secs`.
    ///
    /// Any positive capacity works; powers of two make the slot modulo
    /// cheap.
    ///
    /// # Errors
    ///
    /// [`PendingError::InvalidSize`] or [`PendingError::InvalidTimeout`]
    /// when the corresponding argument is zero.
    pub fn new(capacity: u32, timeout_secs: u64, clock: Arc<dyn Clock>) -> Result<Self> {
        if capacity == 0 {
            return Err(PendingError::InvalidSize);
        }
        if timeout_secs == 0 {
            return Err(PendingError::InvalidTimeout);
        }

        let mut entries = Vec::with_capacity(capacity as usize);
        entries.resize_with(capacity as usize, Entry::default);

        Ok(Self {
            entries,
            last_deleted: 0,
            last_added: 0,
            timeout_secs,
            clock,
        })
    }

    /// Number of slots in the ring.
    pub fn capacity(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Evict expired entries from the tail until a live one remains.
    fn clear_timed_out(&mut self) {
        while self.last_deleted != self.last_added {
            let index = (self.last_deleted % self.capacity()) as usize;
            if !self
                .clock
                .is_timeout(self.entries[index].time, self.timeout_secs)
            {
                break;
            }
            self.entries[index].clear();
            self.last_deleted = self.last_deleted.wrapping_add(1);
        }
    }

    /// Store `data` and return its token.
    ///
    /// The token is never zero and always satisfies
    /// `token % capacity == slot index`. Zero is reserved as the invalid
    /// token. If the ring is full the oldest entry is evicted to make
    /// room.
    pub fn add(&mut self, data: &[u8]) -> u64 {
        self.clear_timed_out();

        let capacity = self.capacity();
        let index = (self.last_added % capacity) as usize;

        // Ring full: drop the slot's previous occupant.
        if self.entries[index].data.is_some() {
            self.last_deleted = self.last_added.wrapping_sub(capacity);
            self.entries[index].clear();
        }

        self.entries[index].data = Some(data.to_vec());
        self.entries[index].time = self.clock.now_secs();
        self.last_added = self.last_added.wrapping_add(1);

        let capacity = u64::from(capacity);
        let mut token = (rng::random_u64() / capacity) * capacity + index as u64;
        if token == 0 {
            token += capacity;
        }
        self.entries[index].token = token;
        token
    }

    /// Redeem a token, returning the stored payload.
    ///
    /// Tokens are single-use: a successful check clears the slot, and any
    /// further check with the same token fails.
    ///
    /// # Errors
    ///
    /// [`PendingError::UnknownToken`] when the token is zero, does not
    /// match the slot it points at, has expired, or was already consumed.
    pub fn check(&mut self, token: u64) -> Result<Vec<u8>> {
        if token == 0 {
            return Err(PendingError::UnknownToken);
        }

        let index = (token % u64::from(self.capacity())) as usize;
        if self.entries[index].token != token {
            return Err(PendingError::UnknownToken);
        }
        if self
            .clock
            .is_timeout(self.entries[index].time, self.timeout_secs)
        {
            return Err(PendingError::UnknownToken);
        }

        let data = self.entries[index]
            .data
            .take()
            .ok_or(PendingError::UnknownToken)?;
        self.entries[index].clear();
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::ManualClock;

    fn ring(capacity: u32, timeout: u64) -> (PingArray, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let ring = PingArray::new(capacity, timeout, clock.clone()).expect("ring");
        (ring, clock)
    }

    #[test]
    fn test_zero_arguments_rejected() {
        let clock = Arc::new(ManualClock::new(0));
        assert!(matches!(
            PingArray::new(0, 10, clock.clone()),
            Err(PendingError::InvalidSize)
        ));
        assert!(matches!(
            PingArray::new(8, 0, clock),
            Err(PendingError::InvalidTimeout)
        ));
    }

    #[test]
    fn test_add_check_roundtrip_is_single_use() {
        let (mut ring, _) = ring(8, 10);
        let token = ring.add(b"request payload");
        assert_ne!(token, 0);

        assert_eq!(ring.check(token).expect("first check"), b"request payload");
        assert_eq!(ring.check(token), Err(PendingError::UnknownToken));
    }

    #[test]
    fn test_token_embeds_slot_index() {
        let (mut ring, _) = ring(8, 10);
        for expected_index in 0..8u64 {
            let token = ring.add(&[expected_index as u8]);
            assert_ne!(token, 0);
            assert_eq!(token % 8, expected_index);
        }
    }

    #[test]
    fn test_non_power_of_two_capacity() {
        let (mut ring, _) = ring(5, 10);
        for i in 0..5u64 {
            let token = ring.add(&[i as u8]);
            assert_eq!(token % 5, i);
            assert_eq!(ring.check(token).expect("check"), vec![i as u8]);
        }
    }

    #[test]
    fn test_entries_expire() {
        let (mut ring, clock) = ring(8, 10);
        let token = ring.add(b"soon stale");
        clock.advance(11);
        assert_eq!(ring.check(token), Err(PendingError::UnknownToken));
    }

    #[test]
    fn test_entry_survives_just_under_timeout() {
        let (mut ring, clock) = ring(8, 10);
        let token = ring.add(b"still fresh");
        clock.advance(9);
        assert_eq!(ring.check(token).expect("check"), b"still fresh");
    }

    #[test]
    fn test_full_ring_evicts_oldest() {
        let (mut ring, _) = ring(4, 1_000);
        let first = ring.add(b"oldest");
        for i in 0..4u8 {
            ring.add(&[i]);
        }
        // The slot that held `first` was reused; its token is dead.
        assert_eq!(ring.check(first), Err(PendingError::UnknownToken));
    }

    #[test]
    fn test_expiry_frees_tail_for_reuse() {
        let (mut ring, clock) = ring(2, 10);
        let a = ring.add(b"a");
        let b = ring.add(b"b");
        clock.advance(11);

        let c = ring.add(b"c");
        assert_eq!(ring.check(a), Err(PendingError::UnknownToken));
        assert_eq!(ring.check(b), Err(PendingError::UnknownToken));
        assert_eq!(ring.check(c).expect("check"), b"c");
    }

    #[test]
    fn test_zero_token_rejected() {
        let (mut ring, _) = ring(8, 10);
        ring.add(b"x");
        assert_eq!(ring.check(0), Err(PendingError::UnknownToken));
    }
}
