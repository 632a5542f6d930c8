//! Compile-time configuration defaults

/// Run loops in a pool (0 = one per available CPU)
pub const POOL_SIZE: usize = 0;

/// Upper bound of a single idle wait inside a run loop
pub const LOOP_MAX_WAIT_MS: u64 = 100;

/// Timer thread check granularity (longest sleep between polls)
pub const TIMER_TICK_US: u64 = 1_000;

/// Shortest sleep the timer thread takes (prevents busy-spinning)
pub const TIMER_MIN_SLEEP_US: u64 = 50;

/// Weights (percent) of the fair write queue's prioritized queues
pub const QUEUE_WEIGHTS: [u32; 2] = [50, 25];

/// Credit granted per round when the base queue had nothing to flush
pub const ROUND_BONUS: u64 = 4_096;

/// Delay before retrying a flush that was skipped for lack of credit
pub const RETRY_DELAY_MS: u64 = 1;

/// Prefix of run loop thread names
pub const THREAD_NAME_PREFIX: &str = "tether-loop";

/// Hard ceiling on pool size
pub const MAX_POOL_SIZE: usize = 256;
