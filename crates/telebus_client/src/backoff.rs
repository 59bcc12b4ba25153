//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(200);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.2;

// Past this the doubling has long since hit any reasonable cap.
const MAX_EXPONENT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_BACKOFF_JITTER)
    }
}

impl Backoff {
    /// `jitter` is the largest extra delay as a fraction of the computed one,
    /// clamped to `0.0..=1.0`.
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            base,
            max: max.max(base),
            jitter,
        }
    }

    /// Delay before retry number `attempt` (1-based) without jitter:
    /// `base * 2^(attempt-1)`, capped at `max`.
    pub fn exponential(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Full delay for `attempt`. `unit` in `0.0..=1.0` scales the jitter; a
    /// broker `retry_after` hint can only lengthen the result.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>, unit: f64) -> Duration {
        let exp = self.exponential(attempt);
        let delay = exp + exp.mul_f64(self.jitter * unit.clamp(0.0, 1.0));
        match retry_after {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }

    pub fn delay_with<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        retry_after: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        self.delay(attempt, retry_after, rng.gen_range(0.0..=1.0))
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}
