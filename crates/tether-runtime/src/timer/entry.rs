//! Timer entry and handle types

use crate::run_loop::RunLoop;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tether_core::Task;

/// Lifecycle of a scheduled entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimerState {
    /// Waiting in the heap for its deadline
    Pending = 0,
    /// Handed to the target loop
    Dispatched = 1,
    /// Cancelled before dispatch (tombstone)
    Cancelled = 2,
    /// Cancelled while dispatched; never re-armed
    Stopped = 3,
}

impl TimerState {
    #[inline]
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TimerState::Pending,
            1 => TimerState::Dispatched,
            2 => TimerState::Cancelled,
            _ => TimerState::Stopped,
        }
    }
}

/// Cancellation counters shared by a heap and the handles it issued
#[derive(Debug, Default)]
pub(crate) struct CancelCounters {
    /// Cancelled entries still physically in the heap (approximate)
    pub(crate) tombstones: AtomicUsize,
    /// Successful cancellations
    pub(crate) cancelled: AtomicU64,
}

impl CancelCounters {
    /// Forget up to `n` tombstones
    pub(crate) fn forget(&self, n: usize) {
        let _ = self
            .tombstones
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                Some(t.saturating_sub(n))
            });
    }
}

struct HandleShared {
    id: u64,
    state: AtomicU8,
    counters: Arc<CancelCounters>,
}

/// Handle to a scheduled entry
///
/// Clones refer to the same entry. A periodic entry keeps its handle across
/// firings, so one `cancel` stops the whole series.
#[derive(Clone)]
pub struct TimerHandle {
    shared: Arc<HandleShared>,
}

impl TimerHandle {
    pub(crate) fn new(counters: Arc<CancelCounters>) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self {
            shared: Arc::new(HandleShared {
                id: COUNTER.fetch_add(1, Ordering::Relaxed),
                state: AtomicU8::new(TimerState::Pending as u8),
                counters,
            }),
        }
    }

    /// Process-unique id (for logging)
    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Current state
    #[inline]
    pub fn state(&self) -> TimerState {
        TimerState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Whether the entry was cancelled before dispatch
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state() == TimerState::Cancelled
    }

    /// Cancel the entry
    ///
    /// Returns `true` if a pending entry was cancelled. Returns `false` if
    /// the entry was already dispatched (the current firing is not
    /// prevented, but a periodic entry will not be re-inserted) or already
    /// cancelled.
    pub fn cancel(&self) -> bool {
        let shared = &*self.shared;
        loop {
            match self.state() {
                TimerState::Pending => {
                    if shared
                        .state
                        .compare_exchange(
                            TimerState::Pending as u8,
                            TimerState::Cancelled as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        shared.counters.tombstones.fetch_add(1, Ordering::AcqRel);
                        shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                        return true;
                    }
                }
                TimerState::Dispatched => {
                    // Loses to a concurrent re-arm, then retries as Pending
                    if shared
                        .state
                        .compare_exchange(
                            TimerState::Dispatched as u8,
                            TimerState::Stopped as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return false;
                    }
                }
                TimerState::Cancelled | TimerState::Stopped => return false,
            }
        }
    }

    /// Pending → Dispatched (timer thread, under the heap lock)
    pub(crate) fn try_dispatch(&self) -> bool {
        self.shared
            .state
            .compare_exchange(
                TimerState::Pending as u8,
                TimerState::Dispatched as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Dispatched → Pending for a periodic re-insertion
    ///
    /// Fails if a cancel arrived during the firing.
    pub(crate) fn try_rearm(&self) -> bool {
        self.shared
            .state
            .compare_exchange(
                TimerState::Dispatched as u8,
                TimerState::Pending as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl PartialEq for TimerHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for TimerHandle {}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Entry stored in the timer heap
pub(crate) struct TimerEntry {
    /// Absolute expiry time
    pub(crate) deadline: Instant,
    /// Insertion order, breaks deadline ties
    pub(crate) seq: u64,
    /// Loop that runs the task
    pub(crate) target: RunLoop,
    /// Deferred work
    pub(crate) task: Box<dyn Task>,
    /// State shared with the caller
    pub(crate) handle: TimerHandle,
}

impl fmt::Debug for TimerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEntry")
            .field("deadline", &self.deadline)
            .field("seq", &self.seq)
            .field("target", &self.target.id())
            .field("handle", &self.handle)
            .finish()
    }
}
