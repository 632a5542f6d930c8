//! Thread-local storage for run loop context
//!
//! Provides fast access to the loop the current OS thread is driving.
//! This is the basis of every thread-affinity decision in the engine.

use crate::run_loop::RunLoop;
use std::cell::{Cell, RefCell};
use tether_core::LoopId;

thread_local! {
    /// Loop driven by this OS thread
    static LOOP_ID: Cell<u32> = const { Cell::new(u32::MAX) };

    /// Handle of the loop driven by this OS thread
    static LOOP_HANDLE: RefCell<Option<RunLoop>> = const { RefCell::new(None) };
}

/// Bind the calling thread to a run loop
pub(crate) fn enter_loop(run_loop: &RunLoop) {
    LOOP_ID.with(|cell| cell.set(run_loop.id().as_u32()));
    LOOP_HANDLE.with(|cell| *cell.borrow_mut() = Some(run_loop.clone()));
}

/// Unbind the calling thread (loop thread exiting)
pub(crate) fn exit_loop() {
    LOOP_ID.with(|cell| cell.set(u32::MAX));
    LOOP_HANDLE.with(|cell| cell.borrow_mut().take());
}

/// Check whether the calling thread is driving the given loop
#[inline]
pub fn is_current(id: LoopId) -> bool {
    !id.is_none() && LOOP_ID.with(|cell| cell.get()) == id.as_u32()
}

/// Handle of the loop driven by the calling thread
pub fn current_loop() -> Option<RunLoop> {
    LOOP_HANDLE.with(|cell| cell.borrow().clone())
}
