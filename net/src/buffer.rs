//! Socket buffers.

use std::collections::VecDeque;

use crate::packet::Packet;

/// A packet FIFO accounted in payload bytes.
///
/// Models one side of a socket: the read buffer the application drains, or
/// the write buffer the simulated NIC drains. Capacity bounds the payload
/// bytes held; zero-payload control packets always fit.
#[derive(Debug)]
pub struct SocketBuffer {
    packets: VecDeque<Packet>,
    bytes: usize,
    capacity: usize,
}

impl SocketBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            packets: VecDeque::new(),
            bytes: 0,
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Payload bytes currently held.
    #[inline]
    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    #[inline]
    pub fn len_packets(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    #[inline]
    pub fn space_available(&self) -> usize {
        self.capacity.saturating_sub(self.bytes)
    }

    /// Append a packet if its payload fits; returns false (and drops the
    /// clone) otherwise.
    pub fn push(&mut self, packet: Packet) -> bool {
        if packet.payload_len() > self.space_available() {
            return false;
        }
        self.bytes += packet.payload_len();
        self.packets.push_back(packet);
        true
    }

    pub fn pop(&mut self) -> Option<Packet> {
        let packet = self.packets.pop_front()?;
        self.bytes -= packet.payload_len();
        Some(packet)
    }

    pub fn peek(&self) -> Option<&Packet> {
        self.packets.front()
    }

    /// Resize to an autotuned capacity. Never shrinks below the bytes
    /// already held.
    pub fn autotune(&mut self, capacity: usize) {
        self.capacity = capacity.max(self.bytes);
    }
}
