//! Run loop parking mechanism
//!
//! Provides efficient sleep/wake for an idle run loop.
//! Platform-specific implementations use the most efficient primitive available.
//!
//! Each parking instance has exactly one waiter (the loop thread, or the
//! timer thread) and any number of wakers. Wake signals are sticky: an
//! `unpark` issued while nobody is parked is consumed by the next `park`,
//! which returns immediately. This closes the race between "queue looked
//! empty" and "loop went to sleep".

use std::time::Duration;

/// Platform-specific parking for a single waiter
pub trait LoopParking: Send + Sync {
    /// Park the calling thread until unparked or timeout
    ///
    /// Returns:
    /// - `true` if woken by a signal (including one pending before the call)
    /// - `false` on timeout or spurious wakeup
    ///
    /// Callers re-check for work after returning regardless of the value.
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Wake the waiter, or leave a pending signal for its next park
    fn unpark(&self);

    /// Whether the waiter is currently parked (hint, may be stale)
    fn is_parked(&self) -> bool;
}

// Platform-specific implementations
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::FallbackParking as PlatformParking;
    }
}

/// Create a new platform-appropriate parking instance
pub fn new_parking() -> Box<dyn LoopParking> {
    Box::new(PlatformParking::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_timeout() {
        let parking = new_parking();
        let start = Instant::now();
        let woken = parking.park(Some(Duration::from_millis(50)));
        let elapsed = start.elapsed();

        assert!(!woken);
        assert!(elapsed >= Duration::from_millis(40)); // Allow some slack
    }

    #[test]
    fn test_unpark_wakes_parked_thread() {
        let parking = Arc::new(PlatformParking::new());
        let parking2 = Arc::clone(&parking);

        let handle = thread::spawn(move || parking2.park(Some(Duration::from_secs(10))));

        // Give thread time to park
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        parking.unpark();

        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_pending_signal_is_sticky() {
        let parking = new_parking();
        parking.unpark();

        let start = Instant::now();
        assert!(parking.park(Some(Duration::from_secs(10))));
        assert!(start.elapsed() < Duration::from_secs(5));

        // Signal was consumed
        assert!(!parking.park(Some(Duration::from_millis(10))));
    }
}
