//! Exponential backoff used when restarting the stream.
use std::time::Duration;

/// Configuration for stream restart backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay slept after the first failed restart attempt (default: 1s).
    pub initial_delay: Duration,
    /// Multiplier applied after each failed attempt (default: 3).
    pub factor: u32,
    /// Upper bound for a single delay (default: 300s).
    pub max_delay: Duration,
    /// Ceiling on the cumulative delay before giving up (default: 300s).
    pub max_elapsed: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            factor: 3,
            max_delay: Duration::from_secs(300),
            max_elapsed: Duration::from_secs(300),
        }
    }
}

/// Stateful delay generator for one restart cycle.
///
/// Delays grow as `initial_delay * factor^n`, each capped at `max_delay`.
/// Once the slept total has exceeded `max_elapsed`, [`Backoff::next_delay`]
/// returns `None` and the cycle is exhausted.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    next: Duration,
    elapsed: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let next = config.initial_delay.min(config.max_delay);
        Self {
            config,
            next,
            elapsed: Duration::ZERO,
            attempts: 0,
        }
    }

    /// Delay to sleep before the next attempt, or `None` when exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.elapsed > self.config.max_elapsed {
            return None;
        }
        let delay = self.next;
        self.elapsed += delay;
        self.attempts += 1;
        self.next = delay
            .saturating_mul(self.config.factor.max(1))
            .min(self.config.max_delay);
        Some(delay)
    }

    /// Start a fresh cycle after a successful connection.
    pub fn reset(&mut self) {
        self.next = self.config.initial_delay.min(self.config.max_delay);
        self.elapsed = Duration::ZERO;
        self.attempts = 0;
    }

    /// Number of delays handed out in this cycle.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Total delay handed out in this cycle.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}
