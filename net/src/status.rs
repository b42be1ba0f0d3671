//! Socket readiness flags.

use bitflags::bitflags;

bitflags! {
    /// Readiness bits mirrored to the descriptor layer after every state
    /// change, forming the poll/select view of a connection.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SocketStatus: u8 {
        /// The connection participates in traffic (established, listening,
        /// or an accepted child).
        const ACTIVE = 0x01;
        /// A read would make progress: buffered data, a pending accept, or
        /// an EOF/error to report.
        const READABLE = 0x02;
        /// A write would make progress.
        const WRITABLE = 0x04;
        /// The connection reached CLOSED and awaits release.
        const CLOSED = 0x08;
    }
}
