//! Retransmission ledger: a copy of every sequence-consuming packet that
//! has left the connection and is not yet acknowledged.
//!
//! A cumulative ACK releases a contiguous sequence range; a drop report
//! takes one packet back out so it can be queued for retransmission.
//! Control packets with sequence number zero never enter the ledger.

use std::collections::BTreeMap;

use crate::packet::Packet;

#[derive(Debug, Default)]
pub(crate) struct RetransmitLedger {
    /// In-flight packets keyed by sequence number.
    packets: BTreeMap<u32, Packet>,
    /// Total payload bytes held, mirrored on every insert/remove.
    bytes: usize,
}

impl RetransmitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload bytes currently in flight.
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

    /// Store a copy of a packet that is about to hit the wire. A
    /// retransmitted packet replaces its previous copy.
    pub fn record(&mut self, packet: Packet) {
        let seq = packet.seq();
        self.bytes += packet.payload_len();
        if let Some(old) = self.packets.insert(seq, packet) {
            self.bytes -= old.payload_len();
        }
    }

    /// Pull one packet back out, e.g. after the wire reported it dropped.
    pub fn take(&mut self, seq: u32) -> Option<Packet> {
        let packet = self.packets.remove(&seq)?;
        self.bytes -= packet.payload_len();
        Some(packet)
    }

    /// Release every packet in `[from, to)`, walking sequence space so the
    /// range may wrap through `u32::MAX`.
    pub fn release_range(&mut self, from: u32, to: u32) {
        let mut seq = from;
        while seq != to {
            if let Some(old) = self.packets.remove(&seq) {
                self.bytes -= old.payload_len();
            }
            seq = seq.wrapping_add(1);
        }
    }
}
