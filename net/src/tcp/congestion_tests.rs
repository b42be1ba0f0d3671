//! Unit tests for slow start and the AIMD steady state.

use crate::tcp::congestion::Congestion;

// ============================================================================
// 1. Slow start
// ============================================================================

#[test]
fn slow_start_grows_by_packets_acked() {
    let mut congestion = Congestion::new(10);
    assert!(congestion.in_slow_start());
    congestion.on_ack(3);
    assert_eq!(congestion.window(), 13);
    congestion.on_ack(13);
    assert_eq!(congestion.window(), 26);
    assert!(congestion.in_slow_start());
}

#[test]
fn zero_acked_changes_nothing() {
    let mut congestion = Congestion::new(10);
    congestion.on_ack(0);
    assert_eq!(congestion.window(), 10);
    assert!(congestion.in_slow_start());
}

#[test]
fn crossing_threshold_ends_slow_start_clamped() {
    let mut congestion = Congestion::new(10);
    congestion.on_loss();
    // Halved to 5; the threshold is set there, and slow start resumes
    // toward it.
    assert_eq!(congestion.window(), 5);
    assert!(congestion.in_slow_start());
    congestion.on_ack(8);
    // 5 + 8 would overshoot; the window clamps to the threshold.
    assert_eq!(congestion.window(), 5);
    assert!(!congestion.in_slow_start());
}

// ============================================================================
// 2. Loss response
// ============================================================================

#[test]
fn loss_halves_window_rounding_up() {
    let mut congestion = Congestion::new(9);
    congestion.on_loss();
    assert_eq!(congestion.window(), 5);
    congestion.on_loss();
    assert_eq!(congestion.window(), 3);
}

#[test]
fn window_never_drops_below_one() {
    let mut congestion = Congestion::new(1);
    congestion.on_loss();
    assert_eq!(congestion.window(), 1);
    congestion.on_loss();
    assert_eq!(congestion.window(), 1);
}

// ============================================================================
// 3. Additive increase
// ============================================================================

#[test]
fn steady_state_grows_sublinearly() {
    let mut congestion = Congestion::new(10);
    congestion.on_loss();
    congestion.on_ack(5);
    assert_eq!(congestion.window(), 5);
    assert!(!congestion.in_slow_start());
    // ceil(2*2 / 5) = 1
    congestion.on_ack(2);
    assert_eq!(congestion.window(), 6);
    // ceil(3*3 / 6) = 2
    congestion.on_ack(3);
    assert_eq!(congestion.window(), 8);
    // A single-packet ACK still makes progress: ceil(1 / 8) = 1.
    congestion.on_ack(1);
    assert_eq!(congestion.window(), 9);
}

#[test]
fn later_losses_keep_halving_in_steady_state() {
    let mut congestion = Congestion::new(16);
    congestion.on_loss();
    congestion.on_ack(8);
    assert!(!congestion.in_slow_start());
    assert_eq!(congestion.window(), 8);
    congestion.on_loss();
    assert_eq!(congestion.window(), 4);
    assert!(!congestion.in_slow_start());
}
