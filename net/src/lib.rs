//! Simulated TCP engine.
//!
//! A from-scratch TCP for a discrete-event network simulator: handshake,
//! teardown, cumulative acknowledgment with a retransmission ledger, slow
//! start + AIMD congestion control, flow-control windows, and listen/accept
//! with per-peer child connections multiplexed off the listener.
//!
//! # Architecture
//!
//! Packets move between simulated hosts as in-memory values ([`Packet`]);
//! there is no wire format, no checksum, and no corruption. Sequencing is
//! **packet-granular**: every data, SYN, and close-FIN packet consumes one
//! sequence number, and all windows are counted in packets, not bytes.
//!
//! Loss is explicit. The simulated network either delivers a packet to
//! [`ConnTable::process_packet`] on the receiving host or hands it back to
//! the sender via [`ConnTable::on_packet_dropped`]; the engine carries no
//! retransmission timers and infers nothing from duplicate ACKs. The single
//! timer in the system is the TimeWait expiry, scheduled through the
//! [`Dependencies`] seam the host implements.
//!
//! Connections live in a slotmap arena owned by [`ConnTable`]; the host
//! addresses them by [`ConnId`] handles and polls readiness through
//! [`SocketStatus`].

pub mod buffer;
pub mod deps;
pub mod packet;
pub mod status;
pub mod tcp;

#[cfg(test)]
mod testkit;

pub use buffer::SocketBuffer;
pub use deps::{BufferSizes, Dependencies};
pub use packet::{Packet, TcpFlags, TcpHeader};
pub use status::SocketStatus;
pub use tcp::table::ConnTable;
pub use tcp::{
    AcceptError, ConnId, ConnectError, RecvError, SendError, TcpConfig, TcpError, TcpInfo,
    TcpState,
};
