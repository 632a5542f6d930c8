//! # tether-core
//!
//! Core types and traits for the Tether run-loop engine.
//!
//! This crate is platform-agnostic and contains no threads or OS code.
//! Run loops, the pool and the timer service live in `tether-runtime`.
//!
//! ## Modules
//!
//! - `id` - Loop and selection identifier types
//! - `task` - Units of work executed by a run loop
//! - `selection` - Load-balancing tokens pinned to a run loop
//! - `io` - Outbound item and channel sink contracts
//! - `error` - Error types
//! - `env` - Environment variable utilities

pub mod id;
pub mod task;
pub mod selection;
pub mod io;
pub mod error;
pub mod env;

// Re-exports for convenience
pub use id::{LoopId, SelectionId};
pub use task::{Reschedule, Task, TaskError, TaskResult};
pub use selection::{Selection, WeightedSelection};
pub use io::{ChannelSink, OutboundItem};
pub use error::{ErrorKind, TetherError, TetherResult};
pub use env::{env_get, env_get_bool, env_get_list};

/// Engine-wide constants
pub mod constants {
    /// Ceiling for a run loop's accumulated selection weight
    pub const MAX_WEIGHT: u32 = u32::MAX;

    /// Key reserved for the tail-most real pipeline element (the channel hand-off)
    pub const IO_BOUNDARY: &str = "io-boundary";

    /// Largest weight a fair write queue accepts (weights are percentages)
    pub const MAX_QUEUE_WEIGHT: u32 = 100;
}
