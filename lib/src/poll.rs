//! Bounded polling with backoff.
//!
//! The single wait loop behind controller enable/disable and command
//! completion.  Each round evaluates the condition, gives up once the bound
//! has elapsed, then sleeps for the current delay (clamped to the time left)
//! and grows the delay by the policy's factor up to its ceiling.

use fsdk_abi::{DriverError, DriverResult};

use crate::clock::Clock;

/// How long to wait and how the sleep between checks evolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Upper bound on the whole wait.
    pub timeout_ms: u64,
    /// First sleep.  Zero means pure spinning.
    pub initial_delay_us: u64,
    /// Ceiling for the sleep.
    pub max_delay_us: u64,
    /// Growth factor numerator.
    pub growth_num: u64,
    /// Growth factor denominator.
    pub growth_den: u64,
}

impl PollPolicy {
    /// 1 ms first sleep, growing by 3/2 up to 1 s.
    pub const fn geometric(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            initial_delay_us: 1_000,
            max_delay_us: 1_000_000,
            growth_num: 3,
            growth_den: 2,
        }
    }

    /// Constant sleep between checks.
    pub const fn fixed(timeout_ms: u64, delay_us: u64) -> Self {
        Self {
            timeout_ms,
            initial_delay_us: delay_us,
            max_delay_us: delay_us,
            growth_num: 1,
            growth_den: 1,
        }
    }

    #[inline]
    fn next_delay(&self, current: u64) -> u64 {
        if self.growth_den == 0 {
            return current;
        }
        (current.saturating_mul(self.growth_num) / self.growth_den).min(self.max_delay_us)
    }
}

/// Poll `condition` until it yields a value, fails, or the bound elapses.
///
/// `condition` returns `Ok(Some(v))` when done, `Ok(None)` to keep waiting
/// and `Err(e)` to abort with `e`.  Expiry returns [`DriverError::Timeout`].
/// The condition is always evaluated once more at (or after) the deadline,
/// so a state reached during the last sleep is still observed.
pub fn poll_until<C, T, F>(clock: &C, policy: &PollPolicy, mut condition: F) -> DriverResult<T>
where
    C: Clock + ?Sized,
    F: FnMut() -> DriverResult<Option<T>>,
{
    let start = clock.monotonic_ns();
    let bound_ns = policy.timeout_ms.saturating_mul(1_000_000);
    let mut delay_us = policy.initial_delay_us;

    loop {
        if let Some(value) = condition()? {
            return Ok(value);
        }

        let elapsed = clock.monotonic_ns().saturating_sub(start);
        if elapsed >= bound_ns {
            return Err(DriverError::Timeout);
        }

        if delay_us == 0 {
            core::hint::spin_loop();
            continue;
        }

        let remaining_us = (bound_ns - elapsed).div_ceil(1_000);
        clock.delay_us(delay_us.min(remaining_us));
        delay_us = policy.next_delay(delay_us);
    }
}
