//! # tether-runtime
//!
//! Threaded half of the Tether engine.
//!
//! This crate provides:
//! - Run loops: one OS thread each, cooperative task execution
//! - Run-loop pool: sticky, weight-balanced assignment of selections
//! - Timer service: deadline-ordered hand-off of deferred work to a loop
//! - Loop parking (futex on Linux, condvar elsewhere)
//! - Configuration with environment overrides

pub mod config;
pub mod parking;
pub mod tls;
pub mod run_loop;
pub mod pool;
pub mod timer;

// Re-exports
pub use config::{ConfigError, RuntimeConfig};
pub use parking::{new_parking, LoopParking};
pub use run_loop::{LoopState, LoopStats, RunLoop};
pub use pool::{select_least_loaded, LoopLoad, RunLoopPool};
pub use timer::{TimerHandle, TimerService, TimerState, TimerStats, TimerThreadConfig};
