// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Capped exponential backoff with multiplicative jitter.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Backoff shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// First delay.
    pub base: Duration,
    /// Cap on the nominal delay.
    pub max: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Fraction of the nominal delay that may be shaved off at random, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay for the zero-based `attempt`, capped at `max`.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Stateful delay generator; one per retry loop.
#[derive(Debug, Clone)]
pub struct Backoff<R = StdRng> {
    policy: BackoffPolicy,
    attempt: u32,
    rng: R,
}

impl Backoff<StdRng> {
    /// Backoff seeded from the OS.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }
}

impl<R: Rng> Backoff<R> {
    /// Backoff drawing jitter from `rng`.
    pub fn with_rng(policy: BackoffPolicy, rng: R) -> Self {
        Self {
            policy,
            attempt: 0,
            rng,
        }
    }

    /// Delay before the next attempt; advances the attempt counter.
    ///
    /// Always within `[(1 - jitter) * nominal, nominal]`, so never above the cap.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.policy.nominal(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return nominal;
        }
        let shave: f64 = self.rng.gen_range(0.0..jitter);
        nominal.mul_f64(1.0 - shave)
    }

    /// Attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start over from `base`.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Policy in use.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}
