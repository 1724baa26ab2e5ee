//! Randomized exponential backoff.
//!
//! Delays start at `initial_delay`, grow by `backoff_factor` per call and
//! are capped at `max_delay`. Each delay carries a jitter of up to
//! `± jitter_factor × base / 2` so that concurrent clients spread out.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Tunables for an exponential backoff sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// 0.0 disables jitter; 1.0 spreads delays over `[0.5, 1.5) × base`.
    pub jitter_factor: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 1.5,
            jitter_factor: 1.0,
        }
    }
}

impl BackoffSettings {
    /// Base delay that follows `current` (zero means "no delay issued yet").
    pub fn next_base(&self, current: Duration) -> Duration {
        if current.is_zero() {
            return self.initial_delay.min(self.max_delay);
        }
        current.mul_f64(self.backoff_factor).min(self.max_delay)
    }

    /// Apply jitter to `base`; `unit` is a uniform sample from `[0, 1)`.
    pub fn jittered(&self, base: Duration, unit: f64) -> Duration {
        let base_secs = base.as_secs_f64();
        let jitter = (unit - 0.5) * self.jitter_factor * base_secs;
        let secs = (base_secs + jitter).max(0.0);
        Duration::from_secs_f64(secs).min(self.max_delay)
    }
}

/// Stateful backoff sequence.
///
/// Generic over the random source so tests can inject a seeded generator.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff<R = StdRng> {
    settings: BackoffSettings,
    current_base: Duration,
    attempts: u32,
    jump_to_max: bool,
    rng: R,
}

impl ExponentialBackoff<StdRng> {
    pub fn new(settings: BackoffSettings) -> Self {
        Self::with_rng(settings, StdRng::from_os_rng())
    }

    /// Deterministic sequence for a given seed.
    pub fn with_seed(settings: BackoffSettings, seed: u64) -> Self {
        Self::with_rng(settings, StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> ExponentialBackoff<R> {
    pub fn with_rng(settings: BackoffSettings, rng: R) -> Self {
        Self {
            settings,
            current_base: Duration::ZERO,
            attempts: 0,
            jump_to_max: false,
            rng,
        }
    }

    /// Next delay in the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let base = if self.jump_to_max {
            self.jump_to_max = false;
            self.settings.max_delay
        } else {
            self.settings.next_base(self.current_base)
        };
        self.current_base = base;
        self.attempts += 1;

        let unit: f64 = self.rng.random();
        self.settings.jittered(base, unit)
    }

    /// Restart the sequence at `initial_delay`.
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
        self.attempts = 0;
        self.jump_to_max = false;
    }

    /// Make the next delay the maximum (used after resource exhaustion).
    pub fn reset_to_max(&mut self) {
        self.jump_to_max = true;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn settings(&self) -> &BackoffSettings {
        &self.settings
    }

    /// Sleep for the next delay.
    pub async fn backoff_and_wait(&mut self) -> Duration {
        let delay = self.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        delay
    }
}

// =============================================================================
// Tests
// =============================================================================
