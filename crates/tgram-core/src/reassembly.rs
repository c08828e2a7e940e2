//! Reassembly of grams into complete messages.
//!
//! Fragments may arrive in any order, be duplicated, or never arrive at all.
//! Partial messages are held in a bounded table keyed by sender and msgid and
//! are discarded once they outlive [`REASSEMBLY_TTL`], complete or not.

use crate::gram::{Gram, MAX_FRAGMENTS};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// How long a partial message may wait for its remaining fragments.
pub const REASSEMBLY_TTL: Duration = Duration::from_secs(3);

/// Result of feeding one gram to the [`Reassembler`].
#[derive(Debug, PartialEq, Eq)]
pub enum Reassembly {
    /// The gram completed its message; the bytes are returned in index order.
    Complete(Vec<u8>),
    /// The gram was stored; more fragments are needed.
    Pending,
    /// The gram was dropped.
    Rejected(RejectReason),
}

/// Why a gram was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Every slot of the table holds a live partial message.
    TableFull,
    /// The fragment's slot was already filled; the partial message was discarded.
    DuplicateFragment,
    /// The fragment disagrees with its message's fragment count; the partial
    /// message was discarded.
    InconsistentCount,
    /// `total` is zero or above [`MAX_FRAGMENTS`], or `index` is out of range.
    BadHeader,
}

/// A message whose fragments are still arriving.
#[derive(Debug)]
struct PartialMessage {
    total: u32,
    slots: Vec<Option<Vec<u8>>>,
    filled: u32,
    created_at: Instant,
}

impl PartialMessage {
    fn new(total: u32, now: Instant) -> Self {
        Self {
            total,
            slots: vec![None; total as usize],
            filled: 0,
            created_at: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.filled == self.total
    }

    fn into_bytes(self) -> Vec<u8> {
        let len = self.slots.iter().flatten().map(Vec::len).sum();
        let mut message = Vec::with_capacity(len);
        for slot in self.slots.into_iter().flatten() {
            message.extend(slot);
        }
        message
    }
}

/// Bounded table of partial messages.
#[derive(Debug)]
pub struct Reassembler {
    capacity: usize,
    ttl: Duration,
    messages: HashMap<(SocketAddr, u64), PartialMessage>,
}

impl Reassembler {
    /// Create a reassembler holding at most `capacity` partial messages.
    pub fn new(capacity: usize) -> Self {
        Self::with_ttl(capacity, REASSEMBLY_TTL)
    }

    /// Create a reassembler with an explicit partial-message TTL.
    pub fn with_ttl(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            messages: HashMap::new(),
        }
    }

    /// Feed one gram received from `origin`.
    pub fn accept(&mut self, origin: SocketAddr, gram: Gram) -> Reassembly {
        self.accept_at(origin, gram, Instant::now())
    }

    fn accept_at(&mut self, origin: SocketAddr, gram: Gram, now: Instant) -> Reassembly {
        if gram.total == 0 || gram.total > MAX_FRAGMENTS || gram.index >= gram.total {
            warn!(
                peer = %origin,
                msgid = gram.msgid,
                total = gram.total,
                index = gram.index,
                "gram header out of range"
            );
            return Reassembly::Rejected(RejectReason::BadHeader);
        }

        let key = (origin, gram.msgid);

        // Drop an expired entry under the same key before reusing it.
        if let Some(existing) = self.messages.get(&key) {
            if now.duration_since(existing.created_at) > self.ttl {
                self.messages.remove(&key);
            }
        }

        if !self.messages.contains_key(&key) {
            if self.messages.len() >= self.capacity {
                self.sweep_at(now);
            }
            if self.messages.len() >= self.capacity {
                warn!(
                    peer = %origin,
                    msgid = gram.msgid,
                    capacity = self.capacity,
                    "reassembly table full, dropping gram"
                );
                return Reassembly::Rejected(RejectReason::TableFull);
            }
            self.messages
                .insert(key, PartialMessage::new(gram.total, now));
        }

        let Some(partial) = self.messages.get_mut(&key) else {
            return Reassembly::Pending;
        };

        if partial.total != gram.total {
            warn!(
                peer = %origin,
                msgid = gram.msgid,
                expected = partial.total,
                got = gram.total,
                "inconsistent fragment count, discarding message"
            );
            self.messages.remove(&key);
            return Reassembly::Rejected(RejectReason::InconsistentCount);
        }

        let slot = &mut partial.slots[gram.index as usize];
        if slot.is_some() {
            warn!(
                peer = %origin,
                msgid = gram.msgid,
                index = gram.index,
                "duplicate fragment, discarding message"
            );
            self.messages.remove(&key);
            return Reassembly::Rejected(RejectReason::DuplicateFragment);
        }

        trace!(
            peer = %origin,
            msgid = gram.msgid,
            index = gram.index,
            total = gram.total,
            len = gram.payload.len(),
            "fragment stored"
        );
        *slot = Some(gram.payload);
        partial.filled += 1;

        if !partial.is_complete() {
            return Reassembly::Pending;
        }

        match self.messages.remove(&key) {
            Some(partial) => {
                let message = partial.into_bytes();
                debug!(peer = %origin, msgid = key.1, len = message.len(), "message reassembled");
                Reassembly::Complete(message)
            }
            None => Reassembly::Pending,
        }
    }

    /// Discard partial messages older than the TTL.
    ///
    /// Returns the number of messages removed.
    pub fn sweep(&mut self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.messages.len();
        self.messages
            .retain(|_, partial| now.duration_since(partial.created_at) <= ttl);
        let removed = before - self.messages.len();
        if removed > 0 {
            debug!(count = removed, "GC removed expired partial messages");
        }
        removed
    }

    /// Number of partial messages currently held.
    pub fn pending(&self) -> usize {
        self.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gram::{split, split_with};

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn feed(reassembler: &mut Reassembler, grams: Vec<Gram>) -> Option<Vec<u8>> {
        let mut result = None;
        for gram in grams {
            if let Reassembly::Complete(message) = reassembler.accept(peer(), gram) {
                assert!(result.is_none(), "message completed twice");
                result = Some(message);
            }
        }
        result
    }

    #[test]
    fn in_order_and_reversed_delivery() {
        let message: Vec<u8> = (0..100u8).collect();
        let mut reassembler = Reassembler::new(4);

        let grams = split_with(&message, 1, 7).unwrap();
        assert_eq!(feed(&mut reassembler, grams.clone()), Some(message.clone()));

        let mut reversed = grams;
        reversed.reverse();
        assert_eq!(feed(&mut reassembler, reversed), Some(message));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn arbitrary_permutations_complete() {
        let message: Vec<u8> = b"the quick brown fox jumps over the lazy dog".to_vec();
        let grams = split_with(&message, 77, 5).unwrap();
        let n = grams.len();
        let mut reassembler = Reassembler::new(4);

        // Rotations and a stride permutation cover every slot as the first
        // and the last fragment.
        for shift in 0..n {
            let rotated: Vec<Gram> = (0..n).map(|i| grams[(i + shift) % n].clone()).collect();
            assert_eq!(feed(&mut reassembler, rotated), Some(message.clone()));
        }
        let strided: Vec<Gram> = (0..n).map(|i| grams[(i * 4) % n].clone()).collect();
        assert_eq!(n % 2, 1, "stride 4 must be coprime with the gram count");
        assert_eq!(feed(&mut reassembler, strided), Some(message));
    }

    #[test]
    fn nul_bytes_survive() {
        let mut message = vec![0u8, 1, 0, 0, 255, 0];
        message.extend(vec![0u8; 40]);
        let mut reassembler = Reassembler::new(1);
        let grams = split_with(&message, 3, 8).unwrap();
        assert_eq!(feed(&mut reassembler, grams), Some(message));
    }

    #[test]
    fn empty_message_completes() {
        let mut reassembler = Reassembler::new(1);
        assert_eq!(feed(&mut reassembler, split(b"", 5).unwrap()), Some(Vec::new()));
    }

    #[test]
    fn missing_fragment_never_completes_and_expires() {
        let mut reassembler = Reassembler::new(1);
        let mut grams = split_with(b"0123456789", 12, 3).unwrap();
        grams.remove(2);
        assert_eq!(feed(&mut reassembler, grams), None);
        assert_eq!(reassembler.pending(), 1);

        let later = Instant::now() + REASSEMBLY_TTL + Duration::from_millis(10);
        assert_eq!(reassembler.sweep_at(later), 1);
        assert_eq!(reassembler.pending(), 0);

        // The msgid and the slot are free again.
        let fresh = split_with(b"abc", 12, 3).unwrap();
        assert_eq!(feed(&mut reassembler, fresh), Some(b"abc".to_vec()));
    }

    #[test]
    fn duplicate_fragment_discards_message() {
        let mut reassembler = Reassembler::new(2);
        let grams = split_with(b"abcdef", 1, 2).unwrap();
        assert_eq!(reassembler.accept(peer(), grams[0].clone()), Reassembly::Pending);
        assert_eq!(
            reassembler.accept(peer(), grams[0].clone()),
            Reassembly::Rejected(RejectReason::DuplicateFragment)
        );
        assert_eq!(reassembler.pending(), 0);

        // The remaining fragments start a new partial message that can no
        // longer complete without slot 0.
        assert_eq!(reassembler.accept(peer(), grams[1].clone()), Reassembly::Pending);
        assert_eq!(reassembler.accept(peer(), grams[2].clone()), Reassembly::Pending);
    }

    #[test]
    fn inconsistent_count_discards_message() {
        let mut reassembler = Reassembler::new(2);
        let grams = split_with(b"abcdef", 1, 2).unwrap();
        assert_eq!(reassembler.accept(peer(), grams[0].clone()), Reassembly::Pending);
        let mut liar = grams[1].clone();
        liar.total = 4;
        assert_eq!(
            reassembler.accept(peer(), liar),
            Reassembly::Rejected(RejectReason::InconsistentCount)
        );
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn bad_header_rejected() {
        let mut reassembler = Reassembler::new(2);
        let bad = [
            Gram { msgid: 1, total: 0, index: 0, payload: vec![1] },
            Gram { msgid: 1, total: 2, index: 2, payload: vec![1] },
            Gram { msgid: 1, total: MAX_FRAGMENTS + 1, index: 0, payload: vec![1] },
        ];
        for gram in bad {
            assert_eq!(
                reassembler.accept(peer(), gram),
                Reassembly::Rejected(RejectReason::BadHeader)
            );
        }
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn full_table_rejects_new_msgids() {
        let mut reassembler = Reassembler::new(2);
        for msgid in 1..=2 {
            let grams = split_with(b"abcd", msgid, 2).unwrap();
            assert_eq!(reassembler.accept(peer(), grams[0].clone()), Reassembly::Pending);
        }
        let third = split_with(b"abcd", 3, 2).unwrap();
        assert_eq!(
            reassembler.accept(peer(), third[0].clone()),
            Reassembly::Rejected(RejectReason::TableFull)
        );

        // Fragments of messages already in the table are still accepted.
        let first = split_with(b"abcd", 1, 2).unwrap();
        assert_eq!(
            reassembler.accept(peer(), first[1].clone()),
            Reassembly::Complete(b"abcd".to_vec())
        );
        assert_eq!(reassembler.accept(peer(), third[0].clone()), Reassembly::Pending);
    }

    #[test]
    fn full_table_makes_room_from_expired_entries() {
        let mut reassembler = Reassembler::with_ttl(1, Duration::from_millis(5));
        let start = Instant::now();
        let stale = split_with(b"abcd", 1, 2).unwrap();
        assert_eq!(
            reassembler.accept_at(peer(), stale[0].clone(), start),
            Reassembly::Pending
        );

        let fresh = split_with(b"xy", 2, 2).unwrap();
        let later = start + Duration::from_millis(50);
        assert_eq!(
            reassembler.accept_at(peer(), fresh[0].clone(), later),
            Reassembly::Complete(b"xy".to_vec())
        );
    }

    #[test]
    fn same_msgid_from_different_peers_is_separate() {
        let mut reassembler = Reassembler::new(4);
        let other: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        let a = split_with(b"aaaa", 1, 2).unwrap();
        let b = split_with(b"bbbb", 1, 2).unwrap();
        assert_eq!(reassembler.accept(peer(), a[0].clone()), Reassembly::Pending);
        assert_eq!(reassembler.accept(other, b[0].clone()), Reassembly::Pending);
        assert_eq!(
            reassembler.accept(other, b[1].clone()),
            Reassembly::Complete(b"bbbb".to_vec())
        );
        assert_eq!(
            reassembler.accept(peer(), a[1].clone()),
            Reassembly::Complete(b"aaaa".to_vec())
        );
    }
}
