//! Thread-affinity dispatch of stage calls
//!
//! Every call to an element follows one rule: if the calling thread is the
//! element's pinned loop, the stage runs inline; otherwise the call is boxed
//! (message, parameter, direction) into exactly one task and offered to that
//! loop. A stage already on the call stack (a message bouncing back to it)
//! is also reached through its loop's queue.
//!
//! Stages that do not declare a direction are skipped while resolving the
//! target, so the message reaches the next interested element unchanged.

use crate::arena::NodeId;
use crate::pipeline::{Pipeline, SharedStage, StatCounters};
use crate::stage::{Direction, Message, Param, Stage, StageContext};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tether_core::task::once;
use tether_core::TaskError;
use tether_runtime::RunLoop;

/// Event that travels towards the head after each element handles it
#[derive(Debug, Clone)]
pub(crate) enum Event {
    Activate,
    Deactivate,
    Exception(TaskError),
}

/// One boxed element call
enum Call {
    Store(Message, Param),
    Load(Message, Param),
    Event(Event),
}

impl Call {
    fn name(&self) -> &'static str {
        match self {
            Call::Store(..) => "store",
            Call::Load(..) => "load",
            Call::Event(Event::Activate) => "activate",
            Call::Event(Event::Deactivate) => "deactivate",
            Call::Event(Event::Exception(_)) => "exception_caught",
        }
    }
}

/// What happens after the stage returned (stage lock released)
struct Follow {
    exception: Option<TaskError>,
    propagate: Option<Event>,
}

/// Resolved element: everything needed to call it without the chain lock
pub(crate) struct Element {
    node: NodeId,
    key: Arc<str>,
    stage: SharedStage,
    run_loop: RunLoop,
}

enum Resolved {
    Element(Element),
    /// Reached a sentinel
    End,
    /// The starting element was removed meanwhile
    Stale,
}

impl Element {
    pub(crate) fn call_store(self, pipeline: &Pipeline, msg: Message, param: Param) {
        pipeline.dispatch(self, Call::Store(msg, param));
    }

    pub(crate) fn call_load(self, pipeline: &Pipeline, msg: Message, param: Param) {
        pipeline.dispatch(self, Call::Load(msg, param));
    }

    pub(crate) fn call_activate(self, pipeline: &Pipeline) {
        pipeline.dispatch(self, Call::Event(Event::Activate));
    }

    pub(crate) fn call_deactivate(self, pipeline: &Pipeline) {
        pipeline.dispatch(self, Call::Event(Event::Deactivate));
    }

    pub(crate) fn call_catch_exception(self, pipeline: &Pipeline, err: TaskError) {
        pipeline.dispatch(self, Call::Event(Event::Exception(err)));
    }

    fn call_event(self, pipeline: &Pipeline, event: Event) {
        match event {
            Event::Activate => self.call_activate(pipeline),
            Event::Deactivate => self.call_deactivate(pipeline),
            Event::Exception(err) => self.call_catch_exception(pipeline, err),
        }
    }
}

impl Pipeline {
    /// Find the element that should see a call leaving `from`
    ///
    /// Store walks `next`, everything else walks `prev`. With a direction,
    /// elements that do not declare it are skipped.
    fn resolve(&self, from: NodeId, forward: bool, direction: Option<Direction>) -> Resolved {
        let chain = self.shared.chain.read();
        if chain.arena.get(from).is_none() {
            return Resolved::Stale;
        }

        let mut cursor = from;
        loop {
            let step = if forward {
                chain.next_of(cursor)
            } else {
                chain.prev_of(cursor)
            };
            let Some(id) = step else {
                return Resolved::End;
            };
            if chain.is_sentinel(id) {
                return Resolved::End;
            }
            let Some(node) = chain.arena.get(id) else {
                return Resolved::Stale;
            };
            if direction.map_or(true, |d| node.directions.contains(d)) {
                if let Some(stage) = &node.stage {
                    return Resolved::Element(Element {
                        node: id,
                        key: Arc::clone(&node.key),
                        stage: Arc::clone(stage),
                        run_loop: node.run_loop.clone(),
                    });
                }
            }
            cursor = id;
        }
    }

    pub(crate) fn store_from(&self, from: NodeId, msg: Message, param: Param) {
        match self.resolve(from, true, Some(Direction::Store)) {
            Resolved::Element(element) => element.call_store(self, msg, param),
            Resolved::End | Resolved::Stale => {
                StatCounters::bump(&self.shared.stats.discarded_stores);
                tracing::trace!("outbound message reached the tail, discarded");
            }
        }
    }

    pub(crate) fn load_from(&self, from: NodeId, msg: Message, param: Param) {
        match self.resolve(from, false, Some(Direction::Load)) {
            Resolved::Element(element) => element.call_load(self, msg, param),
            Resolved::End | Resolved::Stale => {
                StatCounters::bump(&self.shared.stats.discarded_loads);
                tracing::trace!("inbound message reached the head, discarded");
            }
        }
    }

    /// Start an event at the tail-most element
    pub(crate) fn start_event(&self, event: Event) {
        let tail = self.shared.chain.read().tail;
        self.propagate(tail, event);
    }

    /// Hand an event to the element before `from`
    fn propagate(&self, from: NodeId, event: Event) {
        match self.resolve(from, false, None) {
            Resolved::Element(element) => element.call_event(self, event),
            Resolved::End => self.event_done(event),
            Resolved::Stale => {
                tracing::debug!(event = ?event, "event source removed, propagation stopped");
            }
        }
    }

    /// An event went past the head
    fn event_done(&self, event: Event) {
        match event {
            Event::Exception(err) => {
                StatCounters::bump(&self.shared.stats.unhandled_exceptions);
                tracing::warn!(error = %err, "exception reached the head of the pipeline unhandled");
            }
            Event::Deactivate => {
                let mut chain = self.shared.chain.write();
                if chain.closed {
                    let removed = chain.clear();
                    tracing::debug!(removed, "pipeline torn down");
                }
            }
            Event::Activate => {}
        }
    }

    fn dispatch(&self, element: Element, call: Call) {
        if element.run_loop.in_loop_thread() {
            if let Some(mut stage) = element.stage.try_lock() {
                StatCounters::bump(&self.shared.stats.inline_calls);
                let follow = self.invoke(&element, &mut **stage, call);
                drop(stage);
                self.follow(&element, follow);
                return;
            }
        }

        StatCounters::bump(&self.shared.stats.offered_calls);
        let name = call.name();
        let key = Arc::clone(&element.key);
        let run_loop = element.run_loop.clone();
        let pipeline = self.clone();

        let task = once(move || {
            let follow = {
                let mut stage = element.stage.lock();
                pipeline.invoke(&element, &mut **stage, call)
            };
            pipeline.follow(&element, follow);
        });

        if let Err(err) = run_loop.offer(task) {
            StatCounters::bump(&self.shared.stats.dropped_calls);
            tracing::warn!(key = %key, call = name, error = %err, "stage call dropped");
        }
    }

    /// Run one call on the stage (caller holds the stage lock)
    fn invoke(&self, element: &Element, stage: &mut dyn Stage, call: Call) -> Follow {
        let ctx = StageContext {
            pipeline: self,
            node: element.node,
            key: &element.key,
            run_loop: &element.run_loop,
        };
        let name = call.name();

        let (result, propagate) = match call {
            Call::Store(msg, param) => (
                panic::catch_unwind(AssertUnwindSafe(|| stage.store(&ctx, msg, param))),
                None,
            ),
            Call::Load(msg, param) => (
                panic::catch_unwind(AssertUnwindSafe(|| stage.load(&ctx, msg, param))),
                None,
            ),
            Call::Event(event) => {
                let result = panic::catch_unwind(AssertUnwindSafe(|| match &event {
                    Event::Activate => stage.activate(&ctx),
                    Event::Deactivate => stage.deactivate(&ctx),
                    Event::Exception(err) => stage.exception_caught(&ctx, err),
                }));
                (result, Some(event))
            }
        };

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(payload) => Some(TaskError::from_panic(payload)),
        };

        let Some(err) = failure else {
            return Follow {
                exception: None,
                propagate,
            };
        };

        tracing::debug!(key = %element.key, call = name, error = %err, "stage failed");
        if matches!(propagate, Some(Event::Exception(_))) {
            // A failing exception handler does not raise a new exception;
            // the original one keeps travelling
            tracing::error!(key = %element.key, error = %err, "exception handler failed");
            return Follow {
                exception: None,
                propagate,
            };
        }

        Follow {
            exception: Some(err),
            propagate,
        }
    }

    fn follow(&self, element: &Element, follow: Follow) {
        if let Some(err) = follow.exception {
            // Exception path starts at the failing element itself
            let again = Element {
                node: element.node,
                key: Arc::clone(&element.key),
                stage: Arc::clone(&element.stage),
                run_loop: element.run_loop.clone(),
            };
            again.call_catch_exception(self, err);
        }
        if let Some(event) = follow.propagate {
            self.propagate(element.node, event);
        }
    }
}
