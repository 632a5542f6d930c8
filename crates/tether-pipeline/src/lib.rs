//! # tether-pipeline
//!
//! Bidirectional chain of stages with run-loop affinity.
//!
//! Each element wraps a [`Stage`] and is pinned to a [`RunLoop`]. Calls made
//! on the pinned loop's thread run inline; calls from anywhere else become a
//! single task offered to that loop.
//!
//! ## Modules
//!
//! - `stage` - Stage trait, directions and the callback context
//! - `pipeline` - Element chain and its key-based mutation API
//! - `dispatch` - Inline-or-offer rule and event propagation
//! - `arena` - Generation-checked node storage
//!
//! [`RunLoop`]: tether_runtime::RunLoop

pub mod arena;
pub mod stage;
pub mod pipeline;
mod dispatch;

pub use arena::NodeId;
pub use pipeline::{Pinned, Pipeline, PipelineStats};
pub use stage::{Direction, Directions, Message, Param, Stage, StageContext, StageResult};
