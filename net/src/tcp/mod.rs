//! TCP engine internals.
//!
//! # Architecture
//!
//! One concern per file, glued together by [`table::ConnTable`]:
//!
//! - [`seq`]: packet-granular sequence spaces and wrapping comparisons
//! - [`congestion`]: slow start + AIMD, in packet units
//! - [`retransmit`]: the in-flight ledger released by cumulative ACKs
//! - [`staging`]: sequence-ordered queues on both sides of the pipeline
//! - [`server`]: listener state (child map, accept queue, backlog)
//! - [`connection`]: the per-connection state machine and flush loop
//! - [`table`]: the arena and the host-facing API
//!
//! Everything below [`table`] is crate-internal; hosts hold [`ConnId`]
//! handles and never touch a connection directly.

use bitflags::bitflags;
use slotmap::new_key_type;
use wraith_lib::time::{SimDuration, SimTime};

pub(crate) mod congestion;
pub(crate) mod connection;
pub(crate) mod retransmit;
pub(crate) mod seq;
pub(crate) mod server;
pub(crate) mod staging;
pub mod table;

#[cfg(test)]
mod congestion_tests;
#[cfg(test)]
mod transfer_tests;

// =============================================================================
// Constants
// =============================================================================

/// Default maximum segment size in bytes: the payload capacity of one
/// packet, and the divisor turning buffer space into a packet window.
pub const DEFAULT_MSS: usize = 1460;

/// Initial congestion window, and the peer window assumed before the peer
/// has advertised one (packets).
pub const INITIAL_WINDOW: u32 = 10;

/// Default read-buffer capacity (bytes).
pub const DEFAULT_RECV_BUFFER: usize = 128 * 1024;

/// Default write-buffer capacity (bytes).
pub const DEFAULT_SEND_BUFFER: usize = 128 * 1024;

/// TimeWait hold-down before the slot may be released (2 × MSL, MSL = 30s).
pub const TIME_WAIT_DELAY: SimDuration = SimDuration::from_secs(60);

/// Minimum listen backlog.
pub const BACKLOG_MIN: usize = 1;

/// Maximum listen backlog.
pub const BACKLOG_MAX: usize = 128;

new_key_type! {
    /// Handle of a connection in the table's arena.
    pub struct ConnId;
}

// =============================================================================
// TCP state machine states
// =============================================================================

/// Connection state per RFC 793 §3.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// Human-readable name for logging.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
        }
    }

    /// Can the application still queue data in this state?
    pub const fn can_send(self) -> bool {
        matches!(self, Self::Established | Self::CloseWait)
    }

    /// Teardown is already under way; a user close is a no-op.
    pub const fn is_teardown(self) -> bool {
        matches!(
            self,
            Self::FinWait1 | Self::FinWait2 | Self::Closing | Self::LastAck | Self::TimeWait
        )
    }
}

// =============================================================================
// Per-connection flag and error bitsets
// =============================================================================

bitflags! {
    /// Lifecycle flags. Set-only; nothing here is ever cleared.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ConnFlags: u8 {
        /// We queued our FIN (or closed before establishment).
        const LOCAL_CLOSED = 0x01;
        /// The peer's FIN or RST arrived.
        const REMOTE_CLOSED = 0x02;
        /// The one-shot zero-byte EOF read has been consumed.
        const EOF_SIGNALED = 0x04;
        /// An inbound RST was processed.
        const RESET_SIGNALED = 0x08;
        /// The connection reached Established at least once.
        const WAS_ESTABLISHED = 0x10;
        /// Listener close is waiting for its children to finish closing.
        const CLOSE_PENDING = 0x20;
    }
}

bitflags! {
    /// Sticky error conditions surfaced through the user-facing calls.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ConnError: u8 {
        const CONNECTION_RESET = 0x01;
        const SEND_EOF = 0x02;
        const RECV_EOF = 0x04;
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Tunables copied into each connection at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpConfig {
    /// Maximum segment size (bytes per packet).
    pub mss: usize,
    /// Initial congestion window (packets).
    pub initial_window: u32,
    /// Read-buffer capacity before autotuning (bytes).
    pub recv_buffer: usize,
    /// Write-buffer capacity before autotuning (bytes).
    pub send_buffer: usize,
    /// TimeWait hold-down.
    pub time_wait_delay: SimDuration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            mss: DEFAULT_MSS,
            initial_window: INITIAL_WINDOW,
            recv_buffer: DEFAULT_RECV_BUFFER,
            send_buffer: DEFAULT_SEND_BUFFER,
            time_wait_delay: TIME_WAIT_DELAY,
        }
    }
}

// =============================================================================
// Telemetry
// =============================================================================

/// Raw per-connection counters behind [`TcpInfo`]. Written on the data
/// path, read only by diagnostics; nothing here feeds back into control
/// flow.
#[derive(Clone, Copy, Debug, Default)]
pub struct Telemetry {
    pub rtt: Option<SimDuration>,
    pub retransmit_count: u32,
    pub last_data_sent: Option<SimTime>,
    pub last_ack_sent: Option<SimTime>,
    pub last_data_received: Option<SimTime>,
    pub last_ack_received: Option<SimTime>,
}

/// Snapshot returned by `ConnTable::info`, the simulator's equivalent of
/// `getsockopt(TCP_INFO)`.
#[derive(Clone, Copy, Debug)]
pub struct TcpInfo {
    pub state: TcpState,
    /// Most recent round-trip sample.
    pub rtt: Option<SimDuration>,
    pub retransmit_count: u32,
    pub last_data_sent: Option<SimTime>,
    pub last_ack_sent: Option<SimTime>,
    pub last_data_received: Option<SimTime>,
    pub last_ack_received: Option<SimTime>,
}

// =============================================================================
// User-facing error enums
// =============================================================================

/// Errors from table-level bookkeeping operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpError {
    /// No connection for this handle (EBADF).
    NotFound,
    /// Connection is in the wrong state for the requested operation (EINVAL).
    InvalidState,
}

/// Connect initiation and progress, reported explicitly rather than through
/// an errno side channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectError {
    /// Handshake started; poll for completion (EINPROGRESS).
    InProgress,
    /// A connect is already in flight (EALREADY).
    AlreadyInProgress,
    /// The connection is already established (EISCONN).
    AlreadyConnected,
    /// Peer reset the handshake before establishment (ECONNREFUSED).
    Refused,
    /// Peer reset an established connection (ECONNRESET).
    Reset,
    /// The handle cannot connect, being a listener or stale (EINVAL).
    Invalid,
    /// Closed without ever connecting (ENOTCONN).
    NotConnected,
}

/// Errors from `accept`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptError {
    /// Nothing pending (EAGAIN).
    WouldBlock,
    /// Not a listening socket (EINVAL).
    Invalid,
    /// The head pending child was reset before acceptance (ECONNABORTED).
    Aborted,
    /// Stale handle (EBADF).
    NotFound,
}

/// Errors from `send_user_data`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendError {
    /// No buffer space right now (EAGAIN).
    WouldBlock,
    /// The stream is closed for writing (ENOTCONN).
    Eof,
    /// Connection was reset by the peer (ECONNRESET).
    Reset,
    /// Stale handle (EBADF).
    NotFound,
}

/// Errors from `receive_user_data`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvError {
    /// No data right now (EAGAIN).
    WouldBlock,
    /// End of stream, already signaled once (ENOTCONN).
    Eof,
    /// Connection was reset by the peer (ECONNRESET).
    Reset,
    /// Stale handle (EBADF).
    NotFound,
}
