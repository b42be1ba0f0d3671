//! Congestion control: slow start with an AIMD steady state.
//!
//! The window is a packet count. Growth is driven by `on_ack` with the
//! number of packets the ACK newly covered; `on_loss` halves the window
//! and, on the first loss, records the slow-start threshold.

/// Per-connection congestion state.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Congestion {
    /// Current congestion window (packets).
    window: u32,
    /// Slow-start threshold, unset until the first loss.
    threshold: Option<u32>,
    /// Still in exponential growth?
    slow_start: bool,
}

impl Congestion {
    pub fn new(initial_window: u32) -> Self {
        Self { window: initial_window.max(1), threshold: None, slow_start: true }
    }

    #[inline]
    pub fn window(&self) -> u32 {
        self.window
    }

    #[inline]
    pub fn in_slow_start(&self) -> bool {
        self.slow_start
    }

    /// Grow the window for `acked` newly acknowledged packets.
    pub fn on_ack(&mut self, acked: u32) {
        if acked == 0 {
            return;
        }
        if self.slow_start {
            self.window = self.window.saturating_add(acked);
            if let Some(threshold) = self.threshold
                && self.window >= threshold
            {
                // Crossing the threshold ends slow start; clamp to it so a
                // burst of ACKs cannot overshoot.
                self.window = threshold;
                self.slow_start = false;
            }
        } else {
            // Additive increase, scaled so that a full window of ACKs grows
            // the window by roughly `acked` packets.
            let n = u64::from(acked);
            let w = u64::from(self.window.max(1));
            let grow = (n * n).div_ceil(w);
            self.window = self.window.saturating_add(grow.min(u64::from(u32::MAX)) as u32);
        }
    }

    /// Multiplicative decrease after a lost packet.
    pub fn on_loss(&mut self) {
        self.window = self.window.div_ceil(2).max(1);
        if self.slow_start && self.threshold.is_none() {
            // First loss defines the slow-start threshold.
            self.threshold = Some(self.window);
        }
    }
}
