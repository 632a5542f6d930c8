//! Fallback parking using a condition variable
//!
//! Used on platforms without futex support.
//! Less efficient but portable.

use super::LoopParking;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Condvar-based parking (fallback)
pub struct FallbackParking {
    /// Wake pending flag
    pending: Mutex<bool>,

    /// Condition variable
    condvar: Condvar,

    /// Waiter is inside `park`
    parked: AtomicBool,
}

impl FallbackParking {
    /// Create a new fallback parking instance
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            condvar: Condvar::new(),
            parked: AtomicBool::new(false),
        }
    }
}

impl Default for FallbackParking {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopParking for FallbackParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        let mut pending = self.pending.lock();
        self.parked.store(true, Ordering::Release);

        if !*pending {
            match timeout {
                Some(t) => {
                    let deadline = Instant::now() + t;
                    while !*pending {
                        if self.condvar.wait_until(&mut pending, deadline).timed_out() {
                            break;
                        }
                    }
                }
                None => {
                    while !*pending {
                        self.condvar.wait(&mut pending);
                    }
                }
            }
        }

        self.parked.store(false, Ordering::Release);
        std::mem::replace(&mut *pending, false)
    }

    fn unpark(&self) {
        let mut pending = self.pending.lock();
        if !*pending {
            *pending = true;
            self.condvar.notify_one();
        }
    }

    fn is_parked(&self) -> bool {
        self.parked.load(Ordering::Relaxed)
    }
}
