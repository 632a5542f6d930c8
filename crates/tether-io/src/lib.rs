//! # tether-io
//!
//! Outbound side of a Tether channel.
//!
//! - `fair_queue` - Deficit-round-robin scheduler over a base queue and
//!   weighted priority queues, with partial-write resumption
//! - `sink` - Sink adapters (byte budgets) for throttled channels and tests

pub mod fair_queue;
pub mod sink;

pub use fair_queue::{FairWriteQueue, FlushOutcome, FlushReport};
pub use sink::BudgetSink;
