//! Linux futex-based loop parking
//!
//! Futex word semantics:
//! - 0 = no wake pending
//! - 1 = wake pending (consumed by the next park)
//!
//! Parking:
//! 1. Publish `parked = true`
//! 2. Consume a pending signal if there is one and return
//! 3. FUTEX_WAIT while the word is still 0
//!
//! Unparking:
//! 1. Set the word to 1
//! 2. FUTEX_WAKE only if the word was 0 and the waiter is parked

use super::LoopParking;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Linux futex-based parking
pub struct FutexParking {
    /// Futex word: 0 = sleep, 1 = wake pending
    futex: AtomicU32,

    /// Waiter is inside `park`
    parked: AtomicBool,
}

impl FutexParking {
    /// Create a new futex parking instance
    pub fn new() -> Self {
        Self {
            futex: AtomicU32::new(0),
            parked: AtomicBool::new(false),
        }
    }
}

impl Default for FutexParking {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopParking for FutexParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        self.parked.store(true, Ordering::SeqCst);

        if self.futex.swap(0, Ordering::SeqCst) == 1 {
            self.parked.store(false, Ordering::SeqCst);
            return true;
        }

        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });

        let timespec_ptr = match &timespec {
            Some(ts) => ts as *const libc::timespec,
            None => std::ptr::null(),
        };

        // Safety: the futex word lives as long as `self`; all other
        // arguments are plain values or null.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0u32,                    // Expected value (sleep if futex == 0)
                timespec_ptr,            // Relative timeout
                std::ptr::null::<u32>(), // uaddr2 (unused)
                0u32,                    // val3 (unused)
            );
        }

        self.parked.store(false, Ordering::SeqCst);

        // ETIMEDOUT, EAGAIN and EINTR all land here; the word tells
        // whether a signal actually arrived.
        self.futex.swap(0, Ordering::SeqCst) == 1
    }

    fn unpark(&self) {
        if self.futex.swap(1, Ordering::SeqCst) == 1 {
            return; // Signal already pending
        }
        if !self.parked.load(Ordering::SeqCst) {
            return; // Next park consumes the signal
        }

        // Safety: see `park`.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32, // Single waiter
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn is_parked(&self) -> bool {
        self.parked.load(Ordering::Relaxed)
    }
}
