//! Tether runtime configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (runtime)
//! 3. Library defaults (`config::defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_runtime::config::RuntimeConfig;
//!
//! // Use defaults with env overrides
//! let config = RuntimeConfig::from_env();
//!
//! // Or customize programmatically
//! let config = RuntimeConfig::from_env()
//!     .pool_size(8)
//!     .timer_tick(Duration::from_micros(500));
//! ```

pub mod defaults;

use std::time::Duration;
use tether_core::constants::MAX_QUEUE_WEIGHT;
use tether_core::env::{env_get, env_get_list};

/// Runtime configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of run loops in the pool
    pub pool_size: usize,
    /// Longest idle wait of a run loop before it re-checks its queue
    pub loop_max_wait: Duration,
    /// Timer thread check granularity
    pub timer_tick: Duration,
    /// Shortest timer thread sleep
    pub timer_min_sleep: Duration,
    /// Weights (percent) of the fair write queue's prioritized queues
    pub queue_weights: Vec<u32>,
    /// Credit granted when the base queue had nothing to flush
    pub round_bonus: u64,
    /// Delay before retrying a flush skipped for lack of credit
    pub retry_delay: Duration,
    /// Prefix of run loop thread names
    pub thread_name_prefix: String,
    /// Stack size of run loop threads (None = system default)
    pub stack_size: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn default_pool_size() -> usize {
    if defaults::POOL_SIZE > 0 {
        return defaults::POOL_SIZE;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(defaults::MAX_POOL_SIZE)
}

impl RuntimeConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `TETHER_POOL_SIZE` - Number of run loops
    /// - `TETHER_LOOP_MAX_WAIT_MS` - Longest idle wait of a loop
    /// - `TETHER_TIMER_TICK_US` - Timer check granularity
    /// - `TETHER_TIMER_MIN_SLEEP_US` - Shortest timer thread sleep
    /// - `TETHER_QUEUE_WEIGHTS` - Comma-separated queue weights, e.g. `50,25`
    /// - `TETHER_ROUND_BONUS` - Credit per idle-base round
    /// - `TETHER_RETRY_DELAY_MS` - Skipped-flush retry delay
    pub fn from_env() -> Self {
        Self {
            pool_size: env_get("TETHER_POOL_SIZE", default_pool_size()),
            loop_max_wait: Duration::from_millis(env_get(
                "TETHER_LOOP_MAX_WAIT_MS",
                defaults::LOOP_MAX_WAIT_MS,
            )),
            timer_tick: Duration::from_micros(env_get(
                "TETHER_TIMER_TICK_US",
                defaults::TIMER_TICK_US,
            )),
            timer_min_sleep: Duration::from_micros(env_get(
                "TETHER_TIMER_MIN_SLEEP_US",
                defaults::TIMER_MIN_SLEEP_US,
            )),
            queue_weights: env_get_list("TETHER_QUEUE_WEIGHTS", defaults::QUEUE_WEIGHTS.to_vec()),
            round_bonus: env_get("TETHER_ROUND_BONUS", defaults::ROUND_BONUS),
            retry_delay: Duration::from_millis(env_get(
                "TETHER_RETRY_DELAY_MS",
                defaults::RETRY_DELAY_MS,
            )),
            thread_name_prefix: defaults::THREAD_NAME_PREFIX.to_string(),
            stack_size: None,
        }
    }

    /// Create config with explicit defaults (no env override).
    /// Useful for testing or when you want full control.
    pub fn new() -> Self {
        Self {
            pool_size: default_pool_size(),
            loop_max_wait: Duration::from_millis(defaults::LOOP_MAX_WAIT_MS),
            timer_tick: Duration::from_micros(defaults::TIMER_TICK_US),
            timer_min_sleep: Duration::from_micros(defaults::TIMER_MIN_SLEEP_US),
            queue_weights: defaults::QUEUE_WEIGHTS.to_vec(),
            round_bonus: defaults::ROUND_BONUS,
            retry_delay: Duration::from_millis(defaults::RETRY_DELAY_MS),
            thread_name_prefix: defaults::THREAD_NAME_PREFIX.to_string(),
            stack_size: None,
        }
    }

    // Builder methods

    pub fn pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    pub fn loop_max_wait(mut self, d: Duration) -> Self {
        self.loop_max_wait = d;
        self
    }

    pub fn timer_tick(mut self, d: Duration) -> Self {
        self.timer_tick = d;
        self
    }

    pub fn timer_min_sleep(mut self, d: Duration) -> Self {
        self.timer_min_sleep = d;
        self
    }

    pub fn queue_weights(mut self, weights: impl Into<Vec<u32>>) -> Self {
        self.queue_weights = weights.into();
        self
    }

    pub fn round_bonus(mut self, bonus: u64) -> Self {
        self.round_bonus = bonus;
        self
    }

    pub fn retry_delay(mut self, d: Duration) -> Self {
        self.retry_delay = d;
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::InvalidValue("pool_size must be > 0"));
        }
        if self.pool_size > defaults::MAX_POOL_SIZE {
            return Err(ConfigError::InvalidValue("pool_size must be <= 256"));
        }
        if self.loop_max_wait.is_zero() {
            return Err(ConfigError::InvalidValue("loop_max_wait must be > 0"));
        }
        if self.timer_tick.is_zero() {
            return Err(ConfigError::InvalidValue("timer_tick must be > 0"));
        }
        if self.timer_min_sleep > self.timer_tick {
            return Err(ConfigError::InvalidValue(
                "timer_min_sleep must be <= timer_tick",
            ));
        }
        if let Some(&w) = self
            .queue_weights
            .iter()
            .find(|&&w| w == 0 || w > MAX_QUEUE_WEIGHT)
        {
            return Err(ConfigError::QueueWeight(w));
        }
        if self.round_bonus == 0 {
            return Err(ConfigError::InvalidValue("round_bonus must be > 0"));
        }
        Ok(())
    }

    /// Log the effective configuration
    pub fn log_summary(&self) {
        tracing::debug!(
            pool_size = self.pool_size,
            loop_max_wait = ?self.loop_max_wait,
            timer_tick = ?self.timer_tick,
            timer_min_sleep = ?self.timer_min_sleep,
            queue_weights = ?self.queue_weights,
            round_bonus = self.round_bonus,
            retry_delay = ?self.retry_delay,
            "tether runtime configuration"
        );
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),

    #[error("invalid config: queue weight {0} outside 1..=100")]
    QueueWeight(u32),
}
