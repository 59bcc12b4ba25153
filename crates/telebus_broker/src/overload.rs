//! Overload controller
//!
//! Admission control for the broker as a whole. A gauge counts requests that
//! have been admitted and not yet finished; once it reaches `threshold` new
//! requests are shed with a `retry_after` hint instead of queueing. The hint
//! doubles with each consecutive shed (bounded by `max_retry_after`) and
//! resets on the next admission.
//!
//! Everything here is a handful of atomic ops: no locks, no I/O. The gauge
//! is claimed with a compare-and-swap loop and never exceeds `threshold`.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub const DEFAULT_OVERLOAD_THRESHOLD: usize = 1024;
pub const DEFAULT_RETRY_AFTER_BASE: Duration = Duration::from_millis(50);
pub const DEFAULT_RETRY_AFTER_MAX: Duration = Duration::from_secs(5);

// 2^16 × base is far beyond any sane cap; keeps the shift in range.
const MAX_SHED_EXPONENT: u32 = 16;

#[derive(Debug)]
pub enum Admission<'a> {
    Admit(AdmissionPermit<'a>),
    Shed { retry_after_ms: u32 },
}

/// Held while an admitted request is in flight; releases its slot on drop.
#[derive(Debug)]
pub struct AdmissionPermit<'a> {
    controller: &'a OverloadController,
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.controller.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
pub struct OverloadController {
    in_flight: AtomicUsize,
    shed_streak: AtomicU32,
    threshold: usize,
    retry_after_base_ms: u32,
    retry_after_max_ms: u32,
}

impl Default for OverloadController {
    fn default() -> Self {
        Self::new(
            DEFAULT_OVERLOAD_THRESHOLD,
            DEFAULT_RETRY_AFTER_BASE,
            DEFAULT_RETRY_AFTER_MAX,
        )
    }
}

impl OverloadController {
    pub fn new(threshold: usize, retry_after_base: Duration, retry_after_max: Duration) -> Self {
        let base = millis_u32(retry_after_base).max(1);
        Self {
            in_flight: AtomicUsize::new(0),
            shed_streak: AtomicU32::new(0),
            threshold,
            retry_after_base_ms: base,
            retry_after_max_ms: millis_u32(retry_after_max).max(base),
        }
    }

    pub fn admit(&self) -> Admission<'_> {
        // A shed request never touches the gauge.
        let claimed = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.threshold).then_some(n + 1)
            });
        if claimed.is_ok() {
            self.shed_streak.store(0, Ordering::Relaxed);
            return Admission::Admit(AdmissionPermit { controller: self });
        }

        let streak = self.shed_streak.fetch_add(1, Ordering::Relaxed);
        Admission::Shed {
            retry_after_ms: self.retry_after_for(streak),
        }
    }

    /// Requests currently admitted and unfinished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    fn retry_after_for(&self, streak: u32) -> u32 {
        let factor = 1u64 << streak.min(MAX_SHED_EXPONENT);
        let hint = u64::from(self.retry_after_base_ms).saturating_mul(factor);
        u32::try_from(hint.min(u64::from(self.retry_after_max_ms))).unwrap_or(u32::MAX)
    }
}

fn millis_u32(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}
