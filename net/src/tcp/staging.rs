//! Sequence-ordered packet queue, used on both sides of the pipeline:
//! throttled output waiting for window space, and out-of-order input
//! waiting for the gap in front of it to fill.
//!
//! Insertion keeps packets sorted in sequence space, so a retransmitted
//! packet automatically lines up ahead of newer data, and duplicate
//! sequence numbers are rejected.

use std::collections::VecDeque;

use crate::packet::Packet;
use crate::tcp::seq::seq_lt;

#[derive(Debug, Default)]
pub(crate) struct SeqQueue {
    /// Sorted ascending in sequence space.
    packets: VecDeque<Packet>,
    /// Total payload bytes held.
    bytes: usize,
}

impl SeqQueue {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Insert in sequence order. Returns false (dropping the new copy) if a
    /// packet with the same sequence number is already queued.
    ///
    /// The scan runs from the back because the common case is appending
    /// fresh data past everything already staged.
    pub fn insert(&mut self, packet: Packet) -> bool {
        let seq = packet.seq();
        let mut idx = self.packets.len();
        while idx > 0 {
            let existing = self.packets[idx - 1].seq();
            if existing == seq {
                return false;
            }
            if seq_lt(existing, seq) {
                break;
            }
            idx -= 1;
        }
        self.bytes += packet.payload_len();
        self.packets.insert(idx, packet);
        true
    }

    /// Lowest-sequence packet, without removing it.
    #[inline]
    pub fn peek(&self) -> Option<&Packet> {
        self.packets.front()
    }

    /// Remove and return the lowest-sequence packet.
    pub fn pop(&mut self) -> Option<Packet> {
        let packet = self.packets.pop_front()?;
        self.bytes -= packet.payload_len();
        Some(packet)
    }
}
