//! BinaryHeap of timer entries with lazy (tombstone) cancellation
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1) (state flip on the handle, no heap access)
//! - Pop expired: O(k log n) where k = expired + surfaced tombstones
//! - Compact: O(n), only when tombstones outnumber live entries
//!
//! Not thread-safe on its own; the service keeps it behind a mutex.

use super::entry::{CancelCounters, TimerEntry, TimerState};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// Wrapper for heap ordering (min-heap by deadline, then sequence)
struct HeapEntry(TimerEntry);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.seq == other.0.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for min-heap (earliest deadline first)
        match other.0.deadline.cmp(&self.0.deadline) {
            CmpOrdering::Equal => other.0.seq.cmp(&self.0.seq),
            ord => ord,
        }
    }
}

pub(crate) struct TimerHeap {
    heap: BinaryHeap<HeapEntry>,
    counters: Arc<CancelCounters>,
    compactions: u64,
}

impl TimerHeap {
    pub(crate) fn new(counters: Arc<CancelCounters>) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(256),
            counters,
            compactions: 0,
        }
    }

    pub(crate) fn push(&mut self, entry: TimerEntry) {
        self.heap.push(HeapEntry(entry));
    }

    /// Pop every entry due at `now`, marking each dispatched
    ///
    /// Tombstones that surface are dropped.
    pub(crate) fn pop_expired(&mut self, now: Instant, out: &mut Vec<TimerEntry>) {
        while let Some(head) = self.heap.peek() {
            if head.0.deadline > now {
                break; // Heap is sorted, no more expired
            }
            let Some(HeapEntry(entry)) = self.heap.pop() else {
                break;
            };
            if entry.handle.try_dispatch() {
                out.push(entry);
            } else {
                self.counters.forget(1);
            }
        }
    }

    /// Earliest live deadline; discards tombstones sitting at the head
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(head) = self.heap.peek() {
            if head.0.handle.state() != TimerState::Cancelled {
                return Some(head.0.deadline);
            }
            self.heap.pop();
            self.counters.forget(1);
        }
        None
    }

    /// Rebuild without tombstones once they outnumber live entries
    ///
    /// Returns `true` if the heap was compacted.
    pub(crate) fn maybe_compact(&mut self) -> bool {
        let tombstones = self.counters.tombstones.load(Ordering::Acquire);
        let live = self.heap.len().saturating_sub(tombstones);
        if tombstones == 0 || tombstones <= live {
            return false;
        }

        let before = self.heap.len();
        self.heap
            .retain(|e| e.0.handle.state() != TimerState::Cancelled);
        let removed = before - self.heap.len();
        self.counters.forget(removed);
        self.compactions += 1;

        tracing::trace!(removed, live = self.heap.len(), "timer heap compacted");
        true
    }

    /// Live (non-cancelled) entries, approximate under concurrent cancels
    pub(crate) fn len(&self) -> usize {
        self.heap
            .len()
            .saturating_sub(self.counters.tombstones.load(Ordering::Acquire))
    }

    /// Physical size including tombstones
    #[cfg(test)]
    pub(crate) fn raw_len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn compactions(&self) -> u64 {
        self.compactions
    }

    /// Remove every entry (service shutdown); returns the live ones dropped
    pub(crate) fn clear(&mut self) -> usize {
        let live = self
            .heap
            .drain()
            .filter(|e| e.0.handle.state() == TimerState::Pending)
            .count();
        self.counters.tombstones.store(0, Ordering::Release);
        live
    }
}
