//! Timer service for the Tether runtime
//!
//! Deferred work is kept in a deadline-ordered heap owned by one dedicated
//! timer thread. The timer thread never runs application code: when an
//! entry expires it is handed to the entry's target run loop with `offer`.
//!
//! # Architecture
//!
//! ```text
//!   schedule() (any thread)
//!         │
//!         ▼
//!   ┌───────────────┐  earlier head?   ┌──────────────┐
//!   │   TimerHeap   │ ───── unpark ──► │ timer thread │
//!   │ (+tombstones) │ ◄── pop_expired ─┤              │
//!   └───────────────┘                  └──────┬───────┘
//!                                             │ offer(Fired)
//!                                             ▼
//!                                         RunLoop ──After(d)──► re-insert
//! ```
//!
//! # Cancellation
//!
//! Each entry shares one atomic state with its [`TimerHandle`]. Cancelling
//! a pending entry flips the state and leaves a tombstone in the heap; the
//! timer thread discards tombstones as they surface and compacts the heap
//! when they outnumber live entries.

mod entry;
mod heap;
mod service;
mod thread;

pub use entry::{TimerHandle, TimerState};
pub use service::TimerService;
pub use thread::TimerThreadConfig;

/// Counter snapshot of a timer service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerStats {
    /// Timer thread poll iterations
    pub polls: u64,
    /// Entries handed to their target loop
    pub fired: u64,
    /// Successful cancellations
    pub cancelled: u64,
    /// Periodic re-insertions
    pub rescheduled: u64,
    /// Expired entries whose target loop was already closed
    pub dropped: u64,
    /// Heap compactions
    pub compactions: u64,
    /// Largest number of entries fired in one poll
    pub max_batch: usize,
}
