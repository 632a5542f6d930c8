//! Pipeline stages and the context they run with

use crate::arena::NodeId;
use crate::pipeline::Pipeline;
use std::any::Any;
use tether_core::TaskError;
use tether_runtime::RunLoop;

/// Message travelling through the pipeline
pub type Message = Box<dyn Any + Send>;

/// Optional per-message parameter (e.g. a write priority)
pub type Param = Option<Box<dyn Any + Send>>;

/// Result of a stage callback; errors enter the exception path
pub type StageResult = Result<(), TaskError>;

/// Travel direction of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Outbound, head → tail (towards the I/O boundary)
    Store,
    /// Inbound, tail → head
    Load,
}

/// Set of directions a stage handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directions {
    store: bool,
    load: bool,
}

impl Directions {
    pub const NONE: Directions = Directions {
        store: false,
        load: false,
    };
    pub const STORE: Directions = Directions {
        store: true,
        load: false,
    };
    pub const LOAD: Directions = Directions {
        store: false,
        load: true,
    };
    pub const BOTH: Directions = Directions {
        store: true,
        load: true,
    };

    #[inline]
    pub const fn contains(self, direction: Direction) -> bool {
        match direction {
            Direction::Store => self.store,
            Direction::Load => self.load,
        }
    }
}

/// Logic wrapped by a pipeline element
///
/// Store and load callbacks forward explicitly through the context, so a
/// stage may transform, split or swallow messages. Lifecycle and exception
/// events propagate towards the head on their own once the callback returns.
///
/// A stage is only ever called on the run loop its element is pinned to.
pub trait Stage: Send + 'static {
    /// Directions this stage wants to see; others pass by unchanged
    fn directions(&self) -> Directions {
        Directions::BOTH
    }

    /// Outbound message
    fn store(&mut self, ctx: &StageContext<'_>, msg: Message, param: Param) -> StageResult {
        ctx.store_next(msg, param);
        Ok(())
    }

    /// Inbound message
    fn load(&mut self, ctx: &StageContext<'_>, msg: Message, param: Param) -> StageResult {
        ctx.load_next(msg, param);
        Ok(())
    }

    /// Channel became active
    fn activate(&mut self, _ctx: &StageContext<'_>) -> StageResult {
        Ok(())
    }

    /// Channel became inactive
    fn deactivate(&mut self, _ctx: &StageContext<'_>) -> StageResult {
        Ok(())
    }

    /// A stage at or behind this one failed
    fn exception_caught(&mut self, _ctx: &StageContext<'_>, _err: &TaskError) -> StageResult {
        Ok(())
    }
}

/// View of the pipeline from inside a stage callback
pub struct StageContext<'a> {
    pub(crate) pipeline: &'a Pipeline,
    pub(crate) node: NodeId,
    pub(crate) key: &'a str,
    pub(crate) run_loop: &'a RunLoop,
}

impl<'a> StageContext<'a> {
    /// Key of the element being called
    #[inline]
    pub fn key(&self) -> &str {
        self.key
    }

    /// Loop the element is pinned to (the calling thread's loop)
    #[inline]
    pub fn run_loop(&self) -> &RunLoop {
        self.run_loop
    }

    /// Pipeline the element belongs to
    #[inline]
    pub fn pipeline(&self) -> &Pipeline {
        self.pipeline
    }

    /// Forward an outbound message to the next store stage
    pub fn store_next(&self, msg: Message, param: Param) {
        self.pipeline.store_from(self.node, msg, param);
    }

    /// Forward an inbound message to the previous load stage
    pub fn load_next(&self, msg: Message, param: Param) {
        self.pipeline.load_from(self.node, msg, param);
    }
}
