//! Sequence-number arithmetic and the send/receive sequence spaces.
//!
//! Sequence numbers count packets, not bytes, and wrap at `u32::MAX`; all
//! comparisons go through the wrapping helpers below. Window fields are
//! likewise packet counts.

/// `a < b` in sequence space (RFC 1982 serial arithmetic).
#[inline]
pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space.
#[inline]
pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// `a > b` in sequence space.
#[inline]
pub(crate) fn seq_gt(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) < 0
}

/// `a >= b` in sequence space.
#[inline]
pub(crate) fn seq_ge(a: u32, b: u32) -> bool {
    a == b || seq_gt(a, b)
}

/// Send-side sequence state (RFC 793 SND.*, in packets).
#[derive(Clone, Copy, Debug)]
pub(crate) struct SendSeq {
    /// Oldest unacknowledged sequence number (SND.UNA).
    pub unacked: u32,
    /// Next sequence number to assign (SND.NXT).
    pub next: u32,
    /// Effective send window: min of congestion and peer windows.
    pub window: u32,
    /// One past our FIN's sequence number, once a FIN has been queued.
    pub end: Option<u32>,
    /// Acknowledgment number carried by the last packet we emitted.
    pub last_ack_sent: u32,
    /// Window we last advertised to the peer.
    pub last_window_sent: u32,
}

impl SendSeq {
    pub fn new(iss: u32, initial_window: u32) -> Self {
        Self {
            unacked: iss,
            next: iss,
            window: initial_window,
            end: None,
            last_ack_sent: 0,
            last_window_sent: 0,
        }
    }

    /// Packets sent but not yet acknowledged.
    #[inline]
    pub fn in_flight(&self) -> u32 {
        self.next.wrapping_sub(self.unacked)
    }

    /// `unacked <= next` must hold at every quiescent point.
    #[inline]
    pub fn check(&self) {
        debug_assert!(seq_le(self.unacked, self.next));
    }
}

/// Receive-side sequence state (RFC 793 RCV.*, in packets).
#[derive(Clone, Copy, Debug)]
pub(crate) struct RecvSeq {
    /// First sequence number of the stream (the peer's SYN).
    pub start: u32,
    /// Next sequence number expected in order (RCV.NXT).
    pub next: u32,
    /// Receive window we advertise (packets of buffer space).
    pub window: u32,
    /// Sequence number of the peer's FIN, once one has arrived.
    pub end: Option<u32>,
}

impl RecvSeq {
    pub fn new(initial_window: u32) -> Self {
        Self { start: 0, next: 0, window: initial_window, end: None }
    }

    /// `start <= next` must hold at every quiescent point.
    #[inline]
    pub fn check(&self) {
        debug_assert!(seq_le(self.start, self.next));
    }
}
