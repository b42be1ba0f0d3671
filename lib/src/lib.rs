//! Shared simulation primitives.
//!
//! Everything the network engine and the surrounding simulator agree on but
//! that belongs to neither: simulated time. The event loop that owns the
//! clock lives outside this workspace; these types are the contract with it.

pub mod time;

pub use time::{SimDuration, SimTime};
