//! Identifier types for run loops and selections

use core::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Unique identifier for a run loop
///
/// Ids are never reused within a process, so a loop that was closed and
/// substituted by the pool is always distinguishable from its successor.
/// The maximum value (u32::MAX) is reserved as a sentinel for "no loop".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct LoopId(u32);

impl LoopId {
    /// Sentinel value indicating no run loop
    pub const NONE: LoopId = LoopId(u32::MAX);

    /// Allocate the next process-wide loop id
    #[inline]
    pub fn next() -> Self {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        LoopId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }
}

impl fmt::Debug for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "LoopId(NONE)")
        } else {
            write!(f, "LoopId({})", self.0)
        }
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a selection (client, transport, owner) used as a pool key
///
/// The pool compares selections by this id only. `NONE` stands for an
/// absent selection and is rejected by every assignment API.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SelectionId(u64);

impl SelectionId {
    /// Sentinel value indicating an absent selection
    pub const NONE: SelectionId = SelectionId(u64::MAX);

    /// Create a selection id from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        SelectionId(id)
    }

    /// Allocate a fresh, process-unique selection id
    #[inline]
    pub fn unique() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1 << 32);
        SelectionId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    /// Convert to Option
    #[inline]
    pub const fn to_option(self) -> Option<SelectionId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl From<u64> for SelectionId {
    #[inline]
    fn from(id: u64) -> Self {
        SelectionId(id)
    }
}

impl fmt::Debug for SelectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "SelectionId(NONE)")
        } else {
            write!(f, "SelectionId({})", self.0)
        }
    }
}

impl fmt::Display for SelectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
