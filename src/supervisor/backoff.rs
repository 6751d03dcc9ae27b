//! Reconnect backoff policies
//!
//! The supervisor asks its [`Backoff`] for a delay after every lost
//! connection, passing the 1-based number of consecutive reconnect attempts
//! since the last successful connect. The default is a constant 10 seconds.
//!
//! ```rust
//! use std::time::Duration;
//! use busagent::supervisor::backoff::{Backoff, BackoffPolicy};
//!
//! let policy = BackoffPolicy::Exponential {
//!     first: Duration::from_secs(1),
//!     max: Duration::from_secs(30),
//!     factor: 2.0,
//! };
//!
//! assert_eq!(policy.delay(1), Duration::from_secs(1));
//! assert_eq!(policy.delay(3), Duration::from_secs(4));
//! assert_eq!(policy.delay(10), Duration::from_secs(30));
//! ```

use rand::Rng;
use std::time::Duration;

/// Default reconnect delay
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Maps a reconnect attempt number (1-based) to the wait before it
pub trait Backoff: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

impl<F> Backoff for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// Built-in backoff shapes
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    /// Same delay for every attempt
    Constant { delay: Duration },
    /// `first * factor^(attempt - 1)`, clamped to `max`
    Exponential {
        first: Duration,
        max: Duration,
        factor: f64,
    },
    /// Walk through `steps`, then stay at `sustained`
    Pattern {
        steps: Vec<Duration>,
        sustained: Duration,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Constant {
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl BackoffPolicy {
    /// Wrap this policy with a jitter strategy
    pub fn with_jitter(self, jitter: Jitter) -> Jittered<Self> {
        Jittered {
            inner: self,
            jitter,
        }
    }
}

impl Backoff for BackoffPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1);

        match self {
            Self::Constant { delay } => *delay,
            Self::Exponential { first, max, factor } => {
                let exponent = index.min(i32::MAX as u32) as i32;
                let secs = first.as_secs_f64() * factor.powi(exponent);
                if !secs.is_finite() || secs < 0.0 || secs > max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
            Self::Pattern { steps, sustained } => steps
                .get(index as usize)
                .copied()
                .unwrap_or(*sustained),
        }
    }
}

/// Randomization applied on top of a base delay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Jitter {
    #[default]
    None,
    /// Uniform in `[0, base]`
    Full,
    /// Uniform in `[base / 2, base]`
    Equal,
}

impl Jitter {
    /// Apply jitter to a base delay
    pub fn apply(&self, base: Duration) -> Duration {
        let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
        if base_ms == 0 {
            return base;
        }

        match self {
            Jitter::None => base,
            Jitter::Full => Duration::from_millis(rand::thread_rng().gen_range(0..=base_ms)),
            Jitter::Equal => {
                let half = base_ms / 2;
                Duration::from_millis(rand::thread_rng().gen_range(half..=base_ms))
            }
        }
    }
}

/// A backoff with jitter applied to every delay it yields
///
/// The base delay is always derived from the attempt number, so jitter never
/// feeds back into later attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct Jittered<B> {
    inner: B,
    jitter: Jitter,
}

impl<B: Backoff> Backoff for Jittered<B> {
    fn delay(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.inner.delay(attempt))
    }
}
