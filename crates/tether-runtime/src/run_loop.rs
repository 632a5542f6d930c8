//! Run loops
//!
//! A run loop is one OS thread executing boxed tasks cooperatively. Any
//! thread may `offer` work; only the loop thread runs it. Tasks that ask to
//! run again (`Reschedule::After`) wait in a loop-local deadline heap whose
//! head bounds how long the loop may park.
//!
//! # Loop pass
//!
//! 1. Drain the tasks queued when the pass started (self-offers made while
//!    draining run on the next pass)
//! 2. Run every deferred task whose deadline has passed
//! 3. Park until `min(next deferred deadline, max_wait)` or `wake_up()`

use crate::config::RuntimeConfig;
use crate::parking::{new_parking, LoopParking};
use crate::tls;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tether_core::constants::MAX_WEIGHT;
use tether_core::{
    LoopId, Reschedule, Selection, Task, TaskError, TetherError, TetherResult,
};

/// Lifecycle state of a run loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    /// Created, thread not started yet (offers are queued)
    Idle = 0,
    /// Thread is serving the queue
    Running = 1,
    /// Terminal; the thread has exited or is exiting
    Closed = 2,
}

impl LoopState {
    #[inline]
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LoopState::Idle,
            1 => LoopState::Running,
            _ => LoopState::Closed,
        }
    }
}

/// Snapshot of a loop's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Task executions (a retried task counts once per run)
    pub tasks_run: u64,
    /// Runs that ended in `Reschedule::After`
    pub retries: u64,
    /// Runs that returned an error or panicked
    pub task_failures: u64,
    /// Times the loop parked waiting for work
    pub parks: u64,
    /// Tasks dropped unrun when the loop closed
    pub discarded: u64,
}

#[derive(Default)]
struct StatCounters {
    tasks_run: AtomicU64,
    retries: AtomicU64,
    task_failures: AtomicU64,
    parks: AtomicU64,
    discarded: AtomicU64,
}

impl StatCounters {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LoopStats {
        LoopStats {
            tasks_run: self.tasks_run.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            task_failures: self.task_failures.load(Ordering::Relaxed),
            parks: self.parks.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

struct LoopInner {
    id: LoopId,
    name: String,
    state: AtomicU8,
    weight: AtomicU32,
    queue: SegQueue<Box<dyn Task>>,
    parking: Box<dyn LoopParking>,
    thread: Mutex<Option<JoinHandle<()>>>,
    max_wait: Duration,
    stack_size: Option<usize>,
    stats: StatCounters,
}

/// Handle to a run loop
///
/// Cloning is cheap; every clone refers to the same loop. Two handles
/// compare equal when they refer to the same loop.
#[derive(Clone)]
pub struct RunLoop {
    inner: Arc<LoopInner>,
}

/// Task waiting in the loop-local deadline heap
struct Deferred {
    deadline: Instant,
    seq: u64,
    task: Box<dyn Task>,
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Deferred {}

impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deferred {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, earliest deadline must pop first
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl RunLoop {
    /// Create a loop configured from `config` (thread not started)
    pub fn new(config: &RuntimeConfig) -> Self {
        let id = LoopId::next();
        Self {
            inner: Arc::new(LoopInner {
                id,
                name: format!("{}-{}", config.thread_name_prefix, id),
                state: AtomicU8::new(LoopState::Idle as u8),
                weight: AtomicU32::new(0),
                queue: SegQueue::new(),
                parking: new_parking(),
                thread: Mutex::new(None),
                max_wait: config.loop_max_wait,
                stack_size: config.stack_size,
                stats: StatCounters::default(),
            }),
        }
    }

    /// Create and start a loop
    pub fn spawn(config: &RuntimeConfig) -> TetherResult<Self> {
        let run_loop = Self::new(config);
        run_loop.start()?;
        Ok(run_loop)
    }

    /// Handle of the loop driving the calling thread
    #[inline]
    pub fn current() -> Option<RunLoop> {
        tls::current_loop()
    }

    /// Start the loop thread
    ///
    /// Starting a running loop is a no-op; starting a closed loop fails.
    pub fn start(&self) -> TetherResult<()> {
        // Held across the spawn so `close` always sees the join handle
        let mut thread = self.inner.thread.lock();

        if let Err(current) = self.inner.state.compare_exchange(
            LoopState::Idle as u8,
            LoopState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return match LoopState::from_u8(current) {
                LoopState::Closed => Err(TetherError::Closed("run loop")),
                _ => Ok(()),
            };
        }

        let mut builder = thread::Builder::new().name(self.inner.name.clone());
        if let Some(size) = self.inner.stack_size {
            builder = builder.stack_size(size);
        }

        let run_loop = self.clone();
        match builder.spawn(move || run_loop.run()) {
            Ok(handle) => {
                *thread = Some(handle);
                tracing::debug!(loop_id = %self.inner.id, name = %self.inner.name, "run loop started");
                Ok(())
            }
            Err(source) => {
                let _ = self.inner.state.compare_exchange(
                    LoopState::Running as u8,
                    LoopState::Idle as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                Err(TetherError::Spawn {
                    name: self.inner.name.clone(),
                    source,
                })
            }
        }
    }

    /// Loop identity
    #[inline]
    pub fn id(&self) -> LoopId {
        self.inner.id
    }

    /// Thread name of the loop
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state
    #[inline]
    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Whether the loop still accepts work
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.state() != LoopState::Closed
    }

    /// Whether the calling thread is this loop's thread
    #[inline]
    pub fn in_loop_thread(&self) -> bool {
        tls::is_current(self.inner.id)
    }

    /// Enqueue a task from any thread and wake the loop
    pub fn offer<T: Task>(&self, task: T) -> TetherResult<()> {
        self.offer_boxed(Box::new(task))
    }

    /// Enqueue an already boxed task
    pub fn offer_boxed(&self, task: Box<dyn Task>) -> TetherResult<()> {
        if !self.is_alive() {
            return Err(TetherError::Closed("run loop"));
        }
        self.inner.queue.push(task);
        // A close may have finished its final drain after the check above
        if !self.is_alive() {
            self.discard_queued();
            return Err(TetherError::Closed("run loop"));
        }
        if !self.in_loop_thread() {
            self.inner.parking.unpark();
        }
        Ok(())
    }

    /// Unblock the loop if it is parked (or make its next park return)
    #[inline]
    pub fn wake_up(&self) {
        self.inner.parking.unpark();
    }

    /// Tasks queued and not yet started
    #[inline]
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    /// Accumulated selection weight
    #[inline]
    pub fn weight(&self) -> u32 {
        self.inner.weight.load(Ordering::Acquire)
    }

    /// Add a selection's weight (saturating at `MAX_WEIGHT`); returns the new weight
    pub fn accept(&self, selection: &dyn Selection) -> u32 {
        let delta = selection.weight();
        self.update_weight(|w| w.saturating_add(delta).min(MAX_WEIGHT))
    }

    /// Remove a selection's weight (saturating at zero); returns the new weight
    pub fn reject(&self, selection: &dyn Selection) -> u32 {
        let delta = selection.weight();
        self.update_weight(|w| w.saturating_sub(delta))
    }

    fn update_weight(&self, f: impl Fn(u32) -> u32) -> u32 {
        let prev = self
            .inner
            .weight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| Some(f(w)))
            .unwrap_or_else(|w| w);
        f(prev)
    }

    /// Counter snapshot
    pub fn stats(&self) -> LoopStats {
        self.inner.stats.snapshot()
    }

    /// Close the loop (terminal, idempotent)
    ///
    /// Queued and deferred tasks are discarded. Joins the loop thread unless
    /// called from it, in which case the loop exits after the current task.
    pub fn close(&self) {
        let prev = LoopState::from_u8(
            self.inner
                .state
                .swap(LoopState::Closed as u8, Ordering::AcqRel),
        );

        if prev != LoopState::Closed {
            self.inner.parking.unpark();
            if prev == LoopState::Idle {
                let discarded = self.discard_queued();
                tracing::debug!(loop_id = %self.inner.id, discarded, "run loop closed before start");
                return;
            }
        }

        if self.in_loop_thread() {
            return;
        }

        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(loop_id = %self.inner.id, "run loop thread panicked");
            }
            tracing::debug!(
                loop_id = %self.inner.id,
                discarded = self.inner.stats.discarded.load(Ordering::Relaxed),
                "run loop closed"
            );
        }
    }

    fn discard_queued(&self) -> u64 {
        let mut discarded = 0u64;
        while self.inner.queue.pop().is_some() {
            discarded += 1;
        }
        self.inner
            .stats
            .discarded
            .fetch_add(discarded, Ordering::Relaxed);
        discarded
    }

    /// Loop thread body
    fn run(self) {
        tls::enter_loop(&self);
        let inner = &*self.inner;
        let mut deferred: BinaryHeap<Deferred> = BinaryHeap::new();
        let mut seq = 0u64;

        tracing::trace!(loop_id = %inner.id, "run loop entering");

        while self.is_alive() {
            let batch = inner.queue.len();
            for _ in 0..batch {
                let Some(task) = inner.queue.pop() else {
                    break;
                };
                self.execute(task, &mut deferred, &mut seq);
                if !self.is_alive() {
                    break;
                }
            }

            // Entries re-deferred during this phase wait for the next pass
            let now = Instant::now();
            let limit = seq;
            while self.is_alive()
                && deferred
                    .peek()
                    .is_some_and(|d| d.deadline <= now && d.seq <= limit)
            {
                if let Some(entry) = deferred.pop() {
                    self.execute(entry.task, &mut deferred, &mut seq);
                }
            }

            if !self.is_alive() {
                break;
            }
            if !inner.queue.is_empty() {
                continue;
            }

            let timeout = match deferred.peek() {
                Some(next) => next
                    .deadline
                    .saturating_duration_since(Instant::now())
                    .min(inner.max_wait),
                None => inner.max_wait,
            };
            if timeout.is_zero() {
                continue;
            }

            StatCounters::bump(&inner.stats.parks);
            inner.parking.park(Some(timeout));
        }

        let dropped = deferred.len() as u64;
        inner.stats.discarded.fetch_add(dropped, Ordering::Relaxed);
        self.discard_queued();

        tracing::trace!(loop_id = %inner.id, "run loop exiting");
        tls::exit_loop();
    }

    fn execute(&self, mut task: Box<dyn Task>, deferred: &mut BinaryHeap<Deferred>, seq: &mut u64) {
        let stats = &self.inner.stats;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.run()));
        StatCounters::bump(&stats.tasks_run);

        match outcome {
            Ok(Ok(Reschedule::Done)) => {}
            Ok(Ok(Reschedule::After(delay))) => {
                StatCounters::bump(&stats.retries);
                *seq += 1;
                deferred.push(Deferred {
                    deadline: Instant::now() + delay,
                    seq: *seq,
                    task,
                });
            }
            Ok(Err(err)) => self.record_failure(&err),
            Err(payload) => self.record_failure(&TaskError::from_panic(payload)),
        }
    }

    fn record_failure(&self, err: &TaskError) {
        StatCounters::bump(&self.inner.stats.task_failures);
        tracing::error!(loop_id = %self.inner.id, error = %err, "task failed");
    }
}

impl PartialEq for RunLoop {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for RunLoop {}

impl fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoop")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("weight", &self.weight())
            .finish()
    }
}
