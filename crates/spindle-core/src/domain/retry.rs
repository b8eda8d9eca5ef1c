//! Retry policy: how many failures a task may accumulate and how long it
//! waits between attempts.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Maps a row's fail count (1 after the first failure) to the delay before
/// it becomes eligible again.
#[derive(Clone)]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed(Duration),

    /// `base * multiplier^(fail_count - 1)`, capped at `max`.
    ///
    /// With base=2s, multiplier=2.0:
    /// - first failure: 2s
    /// - second: 4s
    /// - third: 8s
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },

    /// Caller-supplied function.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl Backoff {
    pub fn exponential(base: Duration, multiplier: f64, max: Duration) -> Self {
        Backoff::Exponential {
            base,
            multiplier,
            max,
        }
    }

    pub fn custom(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Backoff::Custom(Arc::new(f))
    }

    pub fn delay(&self, fail_count: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential {
                base,
                multiplier,
                max,
            } => {
                let exponent = i32::try_from(fail_count.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = base.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
            Backoff::Custom(f) => f(fail_count),
        }
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Backoff::Exponential {
                base,
                multiplier,
                max,
            } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("multiplier", multiplier)
                .field("max", max)
                .finish(),
            Backoff::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::exponential(Duration::from_secs(2), 2.0, Duration::from_secs(3600))
    }
}

/// Retry policy for one task name.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// A row is dead once its fail count reaches this value.
    pub max_retries: u32,

    pub backoff: Backoff,

    /// Fraction of the delay randomly added or removed (0.0 disables).
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt, jitter applied.
    pub fn next_delay(&self, fail_count: u32) -> Duration {
        let delay = self.backoff.delay(fail_count);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Backoff::default())
    }
}
