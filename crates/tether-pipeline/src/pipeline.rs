//! The element chain and its mutation API
//!
//! ```text
//!   head ⇄ [a] ⇄ [b] ⇄ ... ⇄ [io-boundary] ⇄ tail
//!   store: ─────────────────────────────────►
//!   load / lifecycle / exception: ◄──────────
//! ```
//!
//! Head and tail are fixed sentinels. Elements live in an arena and are
//! addressed by key; the chain lock is only held to mutate or to resolve the
//! next element, never while a stage runs.

use crate::arena::{Arena, NodeId};
use crate::stage::{Directions, Message, Param, Stage};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_core::constants::IO_BOUNDARY;
use tether_core::{TaskError, TetherError, TetherResult};
use tether_runtime::RunLoop;

pub(crate) type SharedStage = Arc<Mutex<Box<dyn Stage>>>;

pub(crate) struct Node {
    pub(crate) key: Arc<str>,
    /// `None` for the sentinels
    pub(crate) stage: Option<SharedStage>,
    pub(crate) run_loop: RunLoop,
    pub(crate) directions: Directions,
    pub(crate) prev: Option<NodeId>,
    pub(crate) next: Option<NodeId>,
}

pub(crate) struct Chain {
    pub(crate) arena: Arena<Node>,
    pub(crate) head: NodeId,
    pub(crate) tail: NodeId,
    keys: HashMap<Arc<str>, NodeId>,
    pub(crate) closed: bool,
}

impl Chain {
    fn new(run_loop: &RunLoop) -> Self {
        let sentinel = |key: &str| Node {
            key: Arc::from(key),
            stage: None,
            run_loop: run_loop.clone(),
            directions: Directions::NONE,
            prev: None,
            next: None,
        };

        let mut arena = Arena::new();
        let head = arena.insert(sentinel("head"));
        let tail = arena.insert(sentinel("tail"));
        if let Some(node) = arena.get_mut(head) {
            node.next = Some(tail);
        }
        if let Some(node) = arena.get_mut(tail) {
            node.prev = Some(head);
        }

        Self {
            arena,
            head,
            tail,
            keys: HashMap::new(),
            closed: false,
        }
    }

    #[inline]
    pub(crate) fn is_sentinel(&self, id: NodeId) -> bool {
        id == self.head || id == self.tail
    }

    #[inline]
    pub(crate) fn next_of(&self, id: NodeId) -> Option<NodeId> {
        self.arena.get(id).and_then(|n| n.next)
    }

    #[inline]
    pub(crate) fn prev_of(&self, id: NodeId) -> Option<NodeId> {
        self.arena.get(id).and_then(|n| n.prev)
    }

    fn lookup(&self, key: &str) -> TetherResult<NodeId> {
        self.keys
            .get(key)
            .copied()
            .ok_or_else(|| TetherError::not_found(format!("pipeline element `{}`", key)))
    }

    /// Link a node right after `prev`
    fn link_after(&mut self, prev: NodeId, mut node: Node) -> TetherResult<NodeId> {
        let next = self
            .next_of(prev)
            .ok_or(TetherError::InvalidState("broken pipeline link"))?;
        node.prev = Some(prev);
        node.next = Some(next);
        let key = Arc::clone(&node.key);

        let id = self.arena.insert(node);
        if let Some(p) = self.arena.get_mut(prev) {
            p.next = Some(id);
        }
        if let Some(n) = self.arena.get_mut(next) {
            n.prev = Some(id);
        }
        self.keys.insert(key, id);
        Ok(id)
    }

    /// Unlink a real node; returns it with its former predecessor
    fn unlink(&mut self, id: NodeId) -> TetherResult<(Node, NodeId)> {
        let node = self
            .arena
            .remove(id)
            .ok_or(TetherError::InvalidState("broken pipeline link"))?;
        let (prev, next) = match (node.prev, node.next) {
            (Some(p), Some(n)) => (p, n),
            _ => return Err(TetherError::InvalidState("broken pipeline link")),
        };
        if let Some(p) = self.arena.get_mut(prev) {
            p.next = Some(next);
        }
        if let Some(n) = self.arena.get_mut(next) {
            n.prev = Some(prev);
        }
        self.keys.remove(&*node.key);
        Ok((node, prev))
    }

    /// Drop every real element
    pub(crate) fn clear(&mut self) -> usize {
        let mut removed = 0;
        while let Some(first) = self.next_of(self.head).filter(|&id| id != self.tail) {
            if self.unlink(first).is_err() {
                break;
            }
            removed += 1;
        }
        removed
    }

    fn keys_in_order(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.keys.len());
        let mut cursor = self.next_of(self.head);
        while let Some(id) = cursor.filter(|&id| id != self.tail) {
            if let Some(node) = self.arena.get(id) {
                keys.push(node.key.to_string());
            }
            cursor = self.next_of(id);
        }
        keys
    }
}

/// Where a new element goes
#[derive(Debug, Clone, Copy)]
enum Position<'a> {
    First,
    Last,
    Before(&'a str),
    After(&'a str),
}

/// Counter snapshot of a pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Stage calls made inline on the pinned loop's thread
    pub inline_calls: u64,
    /// Stage calls offered to the pinned loop as a task
    pub offered_calls: u64,
    /// Offered calls refused because the loop was closed
    pub dropped_calls: u64,
    /// Outbound messages that passed the last store stage
    pub discarded_stores: u64,
    /// Inbound messages that passed the first load stage
    pub discarded_loads: u64,
    /// Exceptions no stage was left to see
    pub unhandled_exceptions: u64,
}

#[derive(Default)]
pub(crate) struct StatCounters {
    pub(crate) inline_calls: AtomicU64,
    pub(crate) offered_calls: AtomicU64,
    pub(crate) dropped_calls: AtomicU64,
    pub(crate) discarded_stores: AtomicU64,
    pub(crate) discarded_loads: AtomicU64,
    pub(crate) unhandled_exceptions: AtomicU64,
}

impl StatCounters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) struct Shared {
    pub(crate) chain: RwLock<Chain>,
    pub(crate) run_loop: RunLoop,
    pub(crate) stats: StatCounters,
}

/// Bidirectional chain of stages, each pinned to a run loop
///
/// Cloning is cheap; clones share the chain.
#[derive(Clone)]
pub struct Pipeline {
    pub(crate) shared: Arc<Shared>,
}

impl Pipeline {
    /// Create an empty pipeline whose elements default to `run_loop`
    pub fn new(run_loop: &RunLoop) -> Self {
        Self {
            shared: Arc::new(Shared {
                chain: RwLock::new(Chain::new(run_loop)),
                run_loop: run_loop.clone(),
                stats: StatCounters::default(),
            }),
        }
    }

    /// Default loop of new elements
    #[inline]
    pub fn run_loop(&self) -> &RunLoop {
        &self.shared.run_loop
    }

    /// Pin the next added element to another loop
    pub fn on<'a>(&'a self, run_loop: &'a RunLoop) -> Pinned<'a> {
        Pinned {
            pipeline: self,
            run_loop,
        }
    }

    /// Add an element right after the head
    pub fn add_first<S: Stage>(&self, key: &str, stage: S) -> TetherResult<()> {
        self.insert(Position::First, key, Box::new(stage), &self.shared.run_loop)
    }

    /// Add an element at the end (before the I/O boundary once installed)
    pub fn add_last<S: Stage>(&self, key: &str, stage: S) -> TetherResult<()> {
        self.insert(Position::Last, key, Box::new(stage), &self.shared.run_loop)
    }

    /// Add an element right before `base`
    pub fn add_before<S: Stage>(&self, base: &str, key: &str, stage: S) -> TetherResult<()> {
        self.insert(Position::Before(base), key, Box::new(stage), &self.shared.run_loop)
    }

    /// Add an element right after `base`
    pub fn add_after<S: Stage>(&self, base: &str, key: &str, stage: S) -> TetherResult<()> {
        self.insert(Position::After(base), key, Box::new(stage), &self.shared.run_loop)
    }

    fn insert(
        &self,
        position: Position<'_>,
        key: &str,
        stage: Box<dyn Stage>,
        run_loop: &RunLoop,
    ) -> TetherResult<()> {
        let mut chain = self.shared.chain.write();
        if chain.closed {
            return Err(TetherError::Closed("pipeline"));
        }
        if chain.keys.contains_key(key) {
            return Err(TetherError::AlreadyExists(key.to_string()));
        }

        let prev = match position {
            Position::First => chain.head,
            Position::Last => {
                let anchor = chain.keys.get(IO_BOUNDARY).copied().unwrap_or(chain.tail);
                chain
                    .prev_of(anchor)
                    .ok_or(TetherError::InvalidState("broken pipeline link"))?
            }
            Position::Before(base) => {
                let base = chain.lookup(base)?;
                chain
                    .prev_of(base)
                    .ok_or(TetherError::InvalidState("broken pipeline link"))?
            }
            Position::After(base) => {
                let id = chain.lookup(base)?;
                if base == IO_BOUNDARY {
                    return Err(TetherError::InvalidState(
                        "nothing may follow the i/o boundary",
                    ));
                }
                id
            }
        };

        if key == IO_BOUNDARY && chain.next_of(prev) != Some(chain.tail) {
            return Err(TetherError::InvalidState(
                "the i/o boundary must be the last element",
            ));
        }

        let directions = stage.directions();
        chain.link_after(
            prev,
            Node {
                key: Arc::from(key),
                stage: Some(Arc::new(Mutex::new(stage))),
                run_loop: run_loop.clone(),
                directions,
                prev: None,
                next: None,
            },
        )?;

        tracing::trace!(key, loop_id = %run_loop.id(), "pipeline element added");
        Ok(())
    }

    /// Remove an element
    ///
    /// In-flight calls to the removed stage still complete; their forwards
    /// are discarded.
    pub fn remove(&self, key: &str) -> TetherResult<()> {
        let mut chain = self.shared.chain.write();
        let id = chain.lookup(key)?;
        if key == IO_BOUNDARY {
            return Err(TetherError::InvalidState("the i/o boundary cannot be removed"));
        }
        chain.unlink(id)?;
        tracing::trace!(key, "pipeline element removed");
        Ok(())
    }

    /// Swap the stage of an element, keeping its position and loop
    pub fn replace<S: Stage>(&self, old_key: &str, new_key: &str, stage: S) -> TetherResult<()> {
        let mut chain = self.shared.chain.write();
        let id = chain.lookup(old_key)?;

        if old_key == IO_BOUNDARY && new_key != IO_BOUNDARY {
            return Err(TetherError::InvalidState(
                "the i/o boundary cannot be replaced by another key",
            ));
        }
        if new_key != old_key && chain.keys.contains_key(new_key) {
            return Err(TetherError::AlreadyExists(new_key.to_string()));
        }
        if new_key == IO_BOUNDARY && chain.next_of(id) != Some(chain.tail) {
            return Err(TetherError::InvalidState(
                "the i/o boundary must be the last element",
            ));
        }

        let (old, prev) = chain.unlink(id)?;
        let stage: Box<dyn Stage> = Box::new(stage);
        let directions = stage.directions();
        chain.link_after(
            prev,
            Node {
                key: Arc::from(new_key),
                stage: Some(Arc::new(Mutex::new(stage))),
                run_loop: old.run_loop,
                directions,
                prev: None,
                next: None,
            },
        )?;

        tracing::trace!(old_key, new_key, "pipeline element replaced");
        Ok(())
    }

    /// Element keys, head to tail
    pub fn keys(&self) -> Vec<String> {
        self.shared.chain.read().keys_in_order()
    }

    /// Whether an element with `key` exists
    pub fn contains(&self, key: &str) -> bool {
        self.shared.chain.read().keys.contains_key(key)
    }

    /// Number of elements (sentinels excluded)
    pub fn len(&self) -> usize {
        self.shared.chain.read().arena.len() - 2
    }

    /// Check if the pipeline has no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.shared.chain.read().closed
    }

    fn ensure_open(&self) -> TetherResult<()> {
        if self.is_closed() {
            return Err(TetherError::Closed("pipeline"));
        }
        Ok(())
    }

    /// Send an outbound message from the head
    pub fn fire_store(&self, msg: Message, param: Param) -> TetherResult<()> {
        self.ensure_open()?;
        let head = self.shared.chain.read().head;
        self.store_from(head, msg, param);
        Ok(())
    }

    /// Send an inbound message from the tail
    pub fn fire_load(&self, msg: Message, param: Param) -> TetherResult<()> {
        self.ensure_open()?;
        let tail = self.shared.chain.read().tail;
        self.load_from(tail, msg, param);
        Ok(())
    }

    /// Announce an active channel, tail-most element first
    pub fn fire_activate(&self) -> TetherResult<()> {
        self.ensure_open()?;
        self.start_event(crate::dispatch::Event::Activate);
        Ok(())
    }

    /// Announce an inactive channel, tail-most element first
    pub fn fire_deactivate(&self) -> TetherResult<()> {
        self.ensure_open()?;
        self.start_event(crate::dispatch::Event::Deactivate);
        Ok(())
    }

    /// Raise an exception at the tail-most element
    pub fn fire_exception(&self, err: TaskError) -> TetherResult<()> {
        self.ensure_open()?;
        self.start_event(crate::dispatch::Event::Exception(err));
        Ok(())
    }

    /// Close the pipeline (idempotent)
    ///
    /// Further mutations and fires fail with `Closed`. Deactivation runs
    /// through the chain and the elements are torn down once it reaches
    /// the head.
    pub fn close(&self) {
        {
            let mut chain = self.shared.chain.write();
            if chain.closed {
                return;
            }
            chain.closed = true;
        }
        tracing::debug!(loop_id = %self.shared.run_loop.id(), "pipeline closing");
        self.start_event(crate::dispatch::Event::Deactivate);
    }

    /// Counter snapshot
    pub fn stats(&self) -> PipelineStats {
        let s = &self.shared.stats;
        PipelineStats {
            inline_calls: s.inline_calls.load(Ordering::Relaxed),
            offered_calls: s.offered_calls.load(Ordering::Relaxed),
            dropped_calls: s.dropped_calls.load(Ordering::Relaxed),
            discarded_stores: s.discarded_stores.load(Ordering::Relaxed),
            discarded_loads: s.discarded_loads.load(Ordering::Relaxed),
            unhandled_exceptions: s.unhandled_exceptions.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("keys", &self.keys())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Adds elements pinned to a specific loop (see [`Pipeline::on`])
pub struct Pinned<'a> {
    pipeline: &'a Pipeline,
    run_loop: &'a RunLoop,
}

impl Pinned<'_> {
    pub fn add_first<S: Stage>(&self, key: &str, stage: S) -> TetherResult<()> {
        self.pipeline
            .insert(Position::First, key, Box::new(stage), self.run_loop)
    }

    pub fn add_last<S: Stage>(&self, key: &str, stage: S) -> TetherResult<()> {
        self.pipeline
            .insert(Position::Last, key, Box::new(stage), self.run_loop)
    }

    pub fn add_before<S: Stage>(&self, base: &str, key: &str, stage: S) -> TetherResult<()> {
        self.pipeline
            .insert(Position::Before(base), key, Box::new(stage), self.run_loop)
    }

    pub fn add_after<S: Stage>(&self, base: &str, key: &str, stage: S) -> TetherResult<()> {
        self.pipeline
            .insert(Position::After(base), key, Box::new(stage), self.run_loop)
    }
}
