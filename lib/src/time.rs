//! Simulated time.
//!
//! The simulator advances a virtual clock; nothing here ever consults the
//! host's wall clock. Both types are nanosecond counts in newtypes so that
//! instants and durations cannot be mixed up in arithmetic.

use core::ops::{Add, AddAssign, Sub};

// =============================================================================
// SimDuration
// =============================================================================

/// A span of simulated time, in nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimDuration(u64);

impl SimDuration {
    pub const ZERO: Self = Self(0);

    pub const NANOS_PER_MICRO: u64 = 1_000;
    pub const NANOS_PER_MILLI: u64 = 1_000_000;
    pub const NANOS_PER_SEC: u64 = 1_000_000_000;

    #[inline]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros * Self::NANOS_PER_MICRO)
    }

    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * Self::NANOS_PER_MILLI)
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * Self::NANOS_PER_SEC)
    }

    #[inline]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn as_micros(self) -> u64 {
        self.0 / Self::NANOS_PER_MICRO
    }

    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0 / Self::NANOS_PER_MILLI
    }

    #[inline]
    pub const fn as_secs(self) -> u64 {
        self.0 / Self::NANOS_PER_SEC
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Add for SimDuration {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sub for SimDuration {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

// =============================================================================
// SimTime
// =============================================================================

/// An instant on the simulated clock: nanoseconds since simulation start.
///
/// The clock never runs backwards, so subtraction saturates at zero rather
/// than wrapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimTime(u64);

impl SimTime {
    /// Simulation start.
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * SimDuration::NANOS_PER_MILLI)
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * SimDuration::NANOS_PER_SEC)
    }

    #[inline]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier` (zero if `earlier` is in the future).
    #[inline]
    pub const fn duration_since(self, earlier: SimTime) -> SimDuration {
        SimDuration(self.0.saturating_sub(earlier.0))
    }
}

impl Add<SimDuration> for SimTime {
    type Output = Self;

    #[inline]
    fn add(self, rhs: SimDuration) -> Self {
        Self(self.0.saturating_add(rhs.as_nanos()))
    }
}

impl AddAssign<SimDuration> for SimTime {
    #[inline]
    fn add_assign(&mut self, rhs: SimDuration) {
        *self = *self + rhs;
    }
}
