//! Retry policy for bundle retrieval.
//!
//! Two backoff shapes:
//! - Fixed: the same delay between every attempt (5s by default)
//! - Exponential: 2^n growth from an initial delay, capped, optionally
//!   with full jitter so a fleet of Followers does not poll in lockstep
//!
//! The policy only computes delays. The retry loop itself lives in
//! `distribution::client`, which owns attempt accounting.

use rand::Rng;
use std::time::Duration;

/// Default number of attempts before a Follower gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 50;

/// Default fixed delay between attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// Default cap for exponential backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Delay shape between consecutive attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential {
        initial: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(DEFAULT_BACKOFF)
    }
}

/// Bounded retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                initial,
                max,
                jitter: true,
            },
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    ///
    /// Returns `None` once `attempt` has reached `max_attempts`: there is
    /// nothing left to wait for.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        Some(self.backoff.delay_for(attempt))
    }

    /// Upper bound on total time spent sleeping across a full campaign.
    pub fn worst_case_wait(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| self.backoff.ceiling_for(attempt))
            .sum()
    }
}

impl Backoff {
    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { jitter: false, .. } => self.ceiling_for(attempt),
            Backoff::Exponential { jitter: true, .. } => {
                let ceiling = self.ceiling_for(attempt);
                let millis = ceiling.as_millis().min(u64::MAX as u128) as u64;
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
            }
        }
    }

    /// Largest delay the policy can produce after attempt `attempt`.
    fn ceiling_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max, .. } => {
                // 2^(attempt-1) * initial, saturating well before overflow
                let exponent = attempt.saturating_sub(1).min(31);
                initial
                    .checked_mul(1u32 << exponent)
                    .unwrap_or(max)
                    .min(max)
            }
        }
    }
}
