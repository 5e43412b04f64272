//! Monotonic time source.
//!
//! Every timeout-bounded wait in the drivers (controller readiness, command
//! completion, request reaping) reads time through a [`Clock`] handed in at
//! construction instead of a global tick counter.  Board code wraps the
//! AArch64 generic timer; simulations use [`ManualClock`].

use core::sync::atomic::{AtomicU64, Ordering};

pub trait Clock {
    /// Nanoseconds since an arbitrary fixed origin; never decreases.
    fn monotonic_ns(&self) -> u64;

    /// Busy-wait (or sleep) for at least `us` microseconds.
    fn delay_us(&self, us: u64);

    #[inline]
    fn uptime_ms(&self) -> u64 {
        self.monotonic_ns() / 1_000_000
    }

    #[inline]
    fn uptime_sec(&self) -> u64 {
        self.monotonic_ns() / 1_000_000_000
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn monotonic_ns(&self) -> u64 {
        (**self).monotonic_ns()
    }

    #[inline]
    fn delay_us(&self, us: u64) {
        (**self).delay_us(us)
    }
}

/// Clock that only moves when told to, or when somebody delays on it.
///
/// Lets polling loops run to their timeout instantly in simulation while
/// still observing the exact same elapsed-time arithmetic as on hardware.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    pub const fn new() -> Self {
        Self {
            now_ns: AtomicU64::new(0),
        }
    }

    pub fn advance_us(&self, us: u64) {
        self.now_ns.fetch_add(us.saturating_mul(1_000), Ordering::AcqRel);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance_us(ms.saturating_mul(1_000));
    }
}

impl Clock for ManualClock {
    #[inline]
    fn monotonic_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Acquire)
    }

    #[inline]
    fn delay_us(&self, us: u64) {
        self.advance_us(us);
    }
}
