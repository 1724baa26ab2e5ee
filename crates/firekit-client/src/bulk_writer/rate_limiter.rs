//! Token-bucket rate limiter with a ramp-up schedule.
//!
//! Capacity equals the current rate. The rate grows by `ramp_multiplier`
//! every `ramp_interval` without contention, up to `max_ops_per_second`,
//! and halves whenever the writer reports contention.

use std::time::Duration;

use tokio::time::Instant;

/// Initial bulk-writer rate.
pub const DEFAULT_INITIAL_OPS_PER_SECOND: f64 = 500.0;

/// Rate ceiling.
pub const DEFAULT_MAX_OPS_PER_SECOND: f64 = 10_000.0;

/// Rate never drops below this.
pub const MIN_OPS_PER_SECOND: f64 = 1.0;

/// Absorbs float error when a sleep ends exactly on the refill boundary.
const TOKEN_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// When false every request is admitted immediately.
    pub enabled: bool,
    pub initial_ops_per_second: f64,
    pub max_ops_per_second: f64,
    pub ramp_multiplier: f64,
    pub ramp_interval: Duration,
    /// Resource-exhausted results in one batch that count as contention.
    pub contention_threshold: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_ops_per_second: DEFAULT_INITIAL_OPS_PER_SECOND,
            max_ops_per_second: DEFAULT_MAX_OPS_PER_SECOND,
            ramp_multiplier: 1.5,
            ramp_interval: Duration::from_secs(5 * 60),
            contention_threshold: 1,
        }
    }
}

impl RateLimiterConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    rate: f64,
    tokens: f64,
    last_refill: Instant,
    /// Start of the current contention-free window.
    window_start: Instant,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig, now: Instant) -> Self {
        let rate = config
            .initial_ops_per_second
            .clamp(MIN_OPS_PER_SECOND, config.max_ops_per_second.max(MIN_OPS_PER_SECOND));
        Self {
            config,
            rate,
            tokens: rate,
            last_refill: now,
            window_start: now,
        }
    }

    /// Current allowed operations per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn contention_threshold(&self) -> usize {
        self.config.contention_threshold.max(1)
    }

    /// Largest request the bucket can ever admit at the current rate.
    pub fn capacity(&self) -> usize {
        if !self.config.enabled {
            return usize::MAX;
        }
        (self.rate.floor() as usize).max(1)
    }

    fn advance(&mut self, now: Instant) {
        while now.saturating_duration_since(self.window_start) >= self.config.ramp_interval
            && !self.config.ramp_interval.is_zero()
        {
            self.window_start += self.config.ramp_interval;
            self.rate = (self.rate * self.config.ramp_multiplier).min(self.config.max_ops_per_second);
        }

        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        self.last_refill = now;
    }

    /// Take `n` tokens if available.
    pub fn try_make_request(&mut self, n: usize, now: Instant) -> bool {
        if !self.config.enabled {
            return true;
        }
        self.advance(now);
        let needed = n.min(self.capacity()) as f64;
        if self.tokens + TOKEN_EPSILON >= needed {
            self.tokens = (self.tokens - needed).max(0.0);
            true
        } else {
            false
        }
    }

    /// Time until `n` tokens are available.
    pub fn next_request_delay(&mut self, n: usize, now: Instant) -> Duration {
        if !self.config.enabled {
            return Duration::ZERO;
        }
        self.advance(now);
        let needed = n.min(self.capacity()) as f64;
        if self.tokens + TOKEN_EPSILON >= needed {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((needed - self.tokens) / self.rate)
    }

    /// Halve the rate and restart the ramp window.
    pub fn on_contention(&mut self, now: Instant) {
        self.advance(now);
        self.rate = (self.rate / 2.0).max(MIN_OPS_PER_SECOND);
        self.tokens = self.tokens.min(self.rate);
        self.window_start = now;
    }
}
