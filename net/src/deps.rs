//! Host integration seam.

use wraith_lib::time::{SimDuration, SimTime};

use crate::tcp::ConnId;

/// Buffer sizes chosen by the host's autotuning policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferSizes {
    pub receive: usize,
    pub send: usize,
}

/// What the engine needs from the simulation host.
///
/// The host event loop owns the clock and the timer queue; the engine asks
/// for the current instant and one deferred callback per TimeWait entry.
/// Telemetry hooks default to no-ops.
pub trait Dependencies {
    /// Current simulated time.
    fn now(&self) -> SimTime;

    /// Arm the TimeWait close timer: after `delay` the host must call
    /// `ConnTable::on_close_timer_expired` with `conn`. Timers are never
    /// cancelled; a late firing against a gone or re-used slot is a no-op
    /// on the engine side.
    fn schedule_close_timer(&mut self, conn: ConnId, delay: SimDuration);

    /// One-shot buffer sizing query, made the first time a connection
    /// reaches Established. `None` keeps the configured defaults.
    fn autotuned_buffer_sizes(&mut self, _conn: ConnId) -> Option<BufferSizes> {
        None
    }

    /// Read-buffer occupancy sample, reported after every flush.
    fn record_buffer_occupancy(&mut self, _conn: ConnId, _used: usize, _capacity: usize) {}

    /// A connection reached CLOSED; the descriptor layer owning the handle
    /// should release it when its last reference drops.
    fn on_connection_closed(&mut self, _conn: ConnId) {}
}
