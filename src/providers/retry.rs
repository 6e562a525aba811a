//! Retry policy, backoff calculation and the retry decision.
//!
//! [`decide`] is a pure function: given the error from an attempt, the
//! attempt number and the policy, it says whether to sleep and try again,
//! hand over to the fallback chain, or surface the error. The orchestrator
//! owns the I/O around it.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::SkirnirError;

/// Configuration for retry behaviour on transient errors.
///
/// ```rust
/// # use skirnir::RetryPolicy;
/// # use std::time::Duration;
/// let policy = RetryPolicy::new()
///     .max_retries(5)
///     .initial_delay(Duration::from_millis(200));
/// assert_eq!(policy.max_attempts(), 6);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt. Default: 3.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay. Default: 500ms.
    #[serde(default = "default_initial_delay", with = "millis", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Cap on any single delay. Default: 30s.
    #[serde(default = "default_max_delay", with = "millis", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Scale delays by a random factor in [0.5, 1.0). Default: true.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before attempt `k` (k ≥ 1): `min(initial * 2^k * jitter, max)`.
    pub fn backoff_delay(&self, k: u32, jitter: f64) -> Duration {
        let factor = 2f64.powi(k.min(62) as i32) * jitter.clamp(0.0, 1.0);
        let delay = self.initial_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay)
    }

    /// A jitter factor per this policy: uniform in [0.5, 1.0), or 1.0 when disabled.
    pub fn sample_jitter(&self) -> f64 {
        if self.jitter {
            rand::thread_rng().gen_range(0.5..1.0)
        } else {
            1.0
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Sleep for `delay`, then try again.
    Retry { delay: Duration },
    /// Stop retrying and try the fallback chain.
    Fallback,
    /// Surface the error to the caller.
    Throw,
}

/// Decide what follows a failed attempt.
///
/// `attempt` is the zero-based index of the attempt that just failed.
/// Transient errors retry until the policy is exhausted, then fall back.
/// Quota rejections fall back without retrying. Everything else is thrown.
pub fn decide(error: &SkirnirError, attempt: u32, policy: &RetryPolicy, jitter: f64) -> Decision {
    if error.is_transient() && attempt < policy.max_retries {
        return Decision::Retry {
            delay: policy.backoff_delay(attempt + 1, jitter),
        };
    }
    if error.allows_fallback() {
        Decision::Fallback
    } else {
        Decision::Throw
    }
}

/// Serde helper storing a `Duration` as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
