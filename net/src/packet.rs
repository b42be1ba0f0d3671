//! In-memory packet values.
//!
//! The simulator never serializes traffic: a packet is a header plus a
//! shared payload allocation, cloned cheaply as it moves through queues and
//! ledgers. A [`Packet`] is immutable once built; the one header rewrite the
//! engine needs (stamping the current ack and window immediately before
//! send) goes through the short-lived [`PacketBuilder`] and produces a new
//! value.

use std::net::SocketAddrV4;
use std::sync::Arc;

use bitflags::bitflags;

bitflags! {
    /// TCP control flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
    }
}

/// Packet header. Everything is host-order; `window` counts packets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpHeader {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u32,
}

impl TcpHeader {
    #[inline]
    pub fn is_syn(&self) -> bool {
        self.flags.contains(TcpFlags::SYN)
    }

    #[inline]
    pub fn is_ack(&self) -> bool {
        self.flags.contains(TcpFlags::ACK)
    }

    #[inline]
    pub fn is_rst(&self) -> bool {
        self.flags.contains(TcpFlags::RST)
    }

    #[inline]
    pub fn is_syn_ack(&self) -> bool {
        self.flags.contains(TcpFlags::SYN | TcpFlags::ACK)
    }

    /// A FIN that consumes a sequence number, i.e. the peer closing its
    /// stream.
    ///
    /// Distinct from a sequence-0 FIN+ACK, which only acknowledges a FIN of
    /// ours and carries no stream position.
    #[inline]
    pub fn is_stream_fin(&self) -> bool {
        self.flags.contains(TcpFlags::FIN) && self.seq != 0
    }
}

/// An immutable simulated packet.
#[derive(Clone, Debug)]
pub struct Packet {
    header: TcpHeader,
    payload: Arc<[u8]>,
}

impl Packet {
    /// Build a payload-free control packet (SYN, ACK, RST, FIN and
    /// combinations).
    pub fn control(
        src: SocketAddrV4,
        dst: SocketAddrV4,
        flags: TcpFlags,
        seq: u32,
        ack: u32,
        window: u32,
    ) -> Self {
        let payload: Arc<[u8]> = Arc::new([]);
        Self {
            header: TcpHeader {
                src,
                dst,
                seq,
                ack,
                flags,
                window,
            },
            payload,
        }
    }

    /// Build a data packet. Ack, window, and the ACK flag are stamped later,
    /// when the packet actually leaves the send pipeline.
    pub fn data(src: SocketAddrV4, dst: SocketAddrV4, seq: u32, payload: &[u8]) -> Self {
        Self {
            header: TcpHeader {
                src,
                dst,
                seq,
                ack: 0,
                flags: TcpFlags::empty(),
                window: 0,
            },
            payload: Arc::from(payload),
        }
    }

    #[inline]
    pub fn header(&self) -> &TcpHeader {
        &self.header
    }

    #[inline]
    pub fn seq(&self) -> u32 {
        self.header.seq
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Copy payload bytes starting at `offset` into `dst`; returns the
    /// number of bytes copied.
    pub fn copy_payload(&self, offset: usize, dst: &mut [u8]) -> usize {
        let start = offset.min(self.payload.len());
        let src = &self.payload[start..];
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        n
    }

    /// Begin restamping this packet's header for send. The payload
    /// allocation is shared, not copied.
    pub fn restamp(&self) -> PacketBuilder {
        PacketBuilder {
            header: self.header,
            payload: Arc::clone(&self.payload),
        }
    }
}

/// Short-lived builder producing the final header of an outgoing packet.
#[derive(Debug)]
pub struct PacketBuilder {
    header: TcpHeader,
    payload: Arc<[u8]>,
}

impl PacketBuilder {
    /// Set the acknowledgment number and raise the ACK flag.
    pub fn ack(mut self, ack: u32) -> Self {
        self.header.ack = ack;
        self.header.flags.insert(TcpFlags::ACK);
        self
    }

    /// Set the advertised window (packets).
    pub fn window(mut self, window: u32) -> Self {
        self.header.window = window;
        self
    }

    pub fn finish(self) -> Packet {
        Packet {
            header: self.header,
            payload: self.payload,
        }
    }
}
