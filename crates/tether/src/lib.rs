//! # tether - Run-Loop Scheduling Engine
//!
//! Work and channel traffic pinned to single-threaded run loops.
//!
//! ## Features
//!
//! - **Run loops**: one OS thread each, cooperative tasks, FIFO cross-thread offers
//! - **Pool**: sticky, weight-balanced assignment of selections to loops
//! - **Timers**: deadline-ordered hand-off of deferred and periodic work
//! - **Pipelines**: stages pinned to loops, called inline or marshalled
//! - **Fair writes**: deficit-round-robin scheduling of outbound bytes
//!
//! ## Quick Start
//!
//! ```ignore
//! use bytes::Bytes;
//! use tether::{Priority, Runtime, RuntimeConfig, WeightedSelection};
//!
//! let runtime = Runtime::new(RuntimeConfig::from_env().pool_size(2))?;
//! let selection = WeightedSelection::unique(1);
//!
//! let transport = runtime.open_transport(&selection, std::io::sink())?;
//! transport.write(Bytes::from_static(b"hello"), Priority::Base)?;
//! transport.close();
//! runtime.shutdown();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Application / Transport                   │
//! │          write(), on_writable(), pipeline stages            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │ Run loop  │      │ Run loop  │      │   Timer   │
//!    │  thread   │◄─────┤  thread   │◄─────┤  thread   │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │
//!          ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │           Fair write queue ──► channel sink             │
//!    └─────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod runtime;
pub mod transport;

pub use error::{Error, Result};
pub use runtime::Runtime;
pub use transport::{ChannelWriter, FlushAction, IoBoundaryStage, Priority, Transport};

// Re-export core types
pub use tether_core::{
    constants, ChannelSink, ErrorKind, LoopId, OutboundItem, Reschedule, Selection, SelectionId,
    Task, TaskError, TaskResult, TetherError, TetherResult, WeightedSelection,
};

// Re-export env utilities
pub use tether_core::env::{env_get, env_get_bool, env_get_list};

pub use tether_core::task::once;

pub use tether_runtime::{
    ConfigError, LoopState, LoopStats, RunLoop, RunLoopPool, RuntimeConfig, TimerHandle,
    TimerService, TimerState, TimerStats,
};

pub use tether_pipeline::{
    Direction, Directions, Message, NodeId, Param, Pipeline, PipelineStats, Stage, StageContext,
    StageResult,
};

pub use tether_io::{BudgetSink, FairWriteQueue, FlushOutcome, FlushReport};
