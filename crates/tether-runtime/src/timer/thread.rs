//! Timer thread
//!
//! Single thread that pops expired entries and offers them to their
//! target loops.
//!
//! # Design
//!
//! The timer thread:
//! 1. Pops every due entry (and compacts the heap when needed)
//! 2. Offers each entry to its target loop, outside the heap lock
//! 3. Parks until the next deadline, bounded by `max_sleep`; with no
//!    entries it parks until a schedule call unparks it

use super::service::ServiceShared;
use crate::config::RuntimeConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configuration for the timer thread
#[derive(Debug, Clone)]
pub struct TimerThreadConfig {
    /// Longest park while entries are pending
    pub max_sleep: Duration,

    /// Shortest park (prevents busy-spinning on near deadlines)
    pub min_sleep: Duration,

    /// Thread name
    pub thread_name: String,

    /// Stack size for the timer thread (None = system default)
    pub stack_size: Option<usize>,
}

impl Default for TimerThreadConfig {
    fn default() -> Self {
        Self::from(&RuntimeConfig::new())
    }
}

impl From<&RuntimeConfig> for TimerThreadConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            max_sleep: config.timer_tick,
            min_sleep: config.timer_min_sleep,
            thread_name: "tether-timer".into(),
            stack_size: config.stack_size,
        }
    }
}

/// Main timer loop
pub(super) fn timer_loop(shared: Arc<ServiceShared>, config: TimerThreadConfig) {
    let mut expired = Vec::new();

    tracing::trace!(thread = %config.thread_name, "timer thread entering");

    while !shared.is_shutdown() {
        let next = shared.poll(Instant::now(), &mut expired);
        for entry in expired.drain(..) {
            shared.dispatch(entry);
        }

        let sleep = calculate_sleep(next, &config);
        if sleep != Some(Duration::ZERO) {
            shared.park(sleep);
        }
    }

    tracing::trace!(thread = %config.thread_name, "timer thread exiting");
}

/// How long to park before the next poll (`None` = until unparked)
#[inline]
fn calculate_sleep(next: Option<Instant>, config: &TimerThreadConfig) -> Option<Duration> {
    let deadline = next?;
    let now = Instant::now();
    if deadline <= now {
        return Some(Duration::ZERO);
    }
    Some((deadline - now).min(config.max_sleep).max(config.min_sleep))
}
