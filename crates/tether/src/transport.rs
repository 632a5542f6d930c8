//! Transport glue: pipeline + fair write queue + channel sink
//!
//! A transport pins one selection to a run loop, owns a pipeline whose
//! tail-most element is the I/O boundary, and turns each flush outcome into
//! the next step for the channel:
//!
//! | Outcome    | Action                                           |
//! |------------|--------------------------------------------------|
//! | `Flushed`  | `Idle`                                           |
//! | `Flushing` | `AwaitWritable`, re-flushed by `on_writable()`   |
//! | `Skip`     | `RetryAfter(retry_delay)` through the timer      |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tether_core::constants::IO_BOUNDARY;
use tether_core::task::once;
use tether_core::{
    ChannelSink, Selection, SelectionId, TaskError, TetherError, TetherResult, WeightedSelection,
};
use tether_io::{FairWriteQueue, FlushOutcome, FlushReport};
use tether_pipeline::{Directions, Message, Param, Pipeline, Stage, StageContext, StageResult};
use tether_runtime::{RunLoop, RunLoopPool, RuntimeConfig, TimerHandle, TimerService};

/// Queue an outbound message lands on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Unweighted base queue, drained completely each round
    #[default]
    Base,
    /// Weighted queue by index (order of `RuntimeConfig::queue_weights`)
    Queue(usize),
}

/// What the channel owner should do after a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushAction {
    /// Nothing left to write
    Idle,
    /// Channel is full; wait for it to become writable
    AwaitWritable,
    /// Items wait for credit; a retry is scheduled after the delay
    RetryAfter(Duration),
}

struct WriterState {
    sink: Box<dyn ChannelSink + Send>,
    queue: FairWriteQueue<Bytes>,
    write_interest: bool,
    retry: Option<TimerHandle>,
}

struct WriterInner {
    state: Mutex<WriterState>,
    run_loop: RunLoop,
    timer: Arc<TimerService>,
    retry_delay: Duration,
}

/// Fair write queue bound to a channel sink and its owning loop
///
/// Cloning is cheap; clones share the queue.
#[derive(Clone)]
pub struct ChannelWriter {
    inner: Arc<WriterInner>,
}

impl ChannelWriter {
    pub fn new(
        sink: Box<dyn ChannelSink + Send>,
        queue: FairWriteQueue<Bytes>,
        run_loop: RunLoop,
        timer: Arc<TimerService>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                state: Mutex::new(WriterState {
                    sink,
                    queue,
                    write_interest: false,
                    retry: None,
                }),
                run_loop,
                timer,
                retry_delay,
            }),
        }
    }

    /// Loop that owns the channel
    #[inline]
    pub fn run_loop(&self) -> &RunLoop {
        &self.inner.run_loop
    }

    /// Queue `bytes` without flushing
    pub fn enqueue(&self, bytes: Bytes, priority: Priority) -> TetherResult<()> {
        let mut state = self.inner.state.lock();
        match priority {
            Priority::Base => {
                state.queue.push_base(bytes);
                Ok(())
            }
            Priority::Queue(index) => state.queue.push(index, bytes),
        }
    }

    /// Run one fair-queueing round and arrange the follow-up
    pub fn flush(&self) -> TetherResult<FlushAction> {
        let mut state = self.inner.state.lock();
        let WriterState { sink, queue, .. } = &mut *state;
        let outcome = queue.flush(sink.as_mut())?;

        let action = match outcome {
            FlushOutcome::Flushed => FlushAction::Idle,
            FlushOutcome::Flushing => FlushAction::AwaitWritable,
            FlushOutcome::Skip => FlushAction::RetryAfter(self.inner.retry_delay),
        };

        state.write_interest = action == FlushAction::AwaitWritable;
        if let FlushAction::RetryAfter(delay) = action {
            let pending = state.retry.as_ref().is_some_and(|h| !h.is_cancelled());
            if !pending {
                state.retry = Some(self.schedule_retry(delay)?);
            }
        }

        tracing::trace!(loop_id = %self.inner.run_loop.id(), action = ?action, "channel flushed");
        Ok(action)
    }

    fn schedule_retry(&self, delay: Duration) -> TetherResult<TimerHandle> {
        let writer = self.clone();
        self.inner.timer.schedule(
            &self.inner.run_loop,
            once(move || {
                writer.inner.state.lock().retry = None;
                if let Err(err) = writer.flush() {
                    tracing::warn!(error = %err, "scheduled channel flush failed");
                }
            }),
            delay,
        )
    }

    /// Channel became writable again: drop the interest and flush
    pub fn on_writable(&self) -> TetherResult<FlushAction> {
        self.inner.state.lock().write_interest = false;
        self.flush()
    }

    /// Whether the last flush stopped on a full channel
    pub fn wants_writable(&self) -> bool {
        self.inner.state.lock().write_interest
    }

    /// Whether a credit retry is scheduled
    pub fn retry_pending(&self) -> bool {
        self.inner.state.lock().retry.is_some()
    }

    /// Cancel a scheduled credit retry
    pub fn cancel_retry(&self) {
        if let Some(handle) = self.inner.state.lock().retry.take() {
            handle.cancel();
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.inner.state.lock().queue.pending_bytes()
    }

    pub fn last_report(&self) -> Option<FlushReport> {
        self.inner.state.lock().queue.last_report()
    }
}

impl std::fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ChannelWriter")
            .field("loop_id", &self.inner.run_loop.id())
            .field("queue", &state.queue)
            .field("write_interest", &state.write_interest)
            .finish()
    }
}

/// Tail-most pipeline element: hands stored `Bytes` to the channel writer
///
/// The store parameter, when present, is a [`Priority`].
pub struct IoBoundaryStage {
    writer: ChannelWriter,
}

impl IoBoundaryStage {
    pub fn new(writer: ChannelWriter) -> Self {
        Self { writer }
    }
}

impl Stage for IoBoundaryStage {
    fn directions(&self) -> Directions {
        Directions::STORE
    }

    fn store(&mut self, _ctx: &StageContext<'_>, msg: Message, param: Param) -> StageResult {
        let bytes = msg
            .downcast::<Bytes>()
            .map_err(|_| TaskError::msg("io boundary only accepts Bytes"))?;
        let priority = param
            .and_then(|p| p.downcast::<Priority>().ok())
            .map_or(Priority::Base, |p| *p);

        self.writer.enqueue(*bytes, priority)?;
        self.writer.flush()?;
        Ok(())
    }

    fn deactivate(&mut self, _ctx: &StageContext<'_>) -> StageResult {
        self.writer.cancel_retry();
        Ok(())
    }
}

/// One channel: a selection pinned to a loop, its pipeline and writer
pub struct Transport {
    selection: WeightedSelection,
    run_loop: RunLoop,
    pipeline: Pipeline,
    writer: ChannelWriter,
    pool: Arc<RunLoopPool>,
    closed: AtomicBool,
}

impl Transport {
    pub(crate) fn open(
        pool: &Arc<RunLoopPool>,
        timer: &Arc<TimerService>,
        config: &RuntimeConfig,
        selection: &dyn Selection,
        sink: Box<dyn ChannelSink + Send>,
    ) -> TetherResult<Self> {
        let selection = WeightedSelection::new(selection.id(), selection.weight());
        let run_loop = pool.assign(&selection)?;

        let build = || -> TetherResult<(Pipeline, ChannelWriter)> {
            let queue = FairWriteQueue::with_weights(&config.queue_weights, config.round_bonus)?;
            let writer = ChannelWriter::new(
                sink,
                queue,
                run_loop.clone(),
                Arc::clone(timer),
                config.retry_delay,
            );
            let pipeline = Pipeline::new(&run_loop);
            pipeline.add_last(IO_BOUNDARY, IoBoundaryStage::new(writer.clone()))?;
            pipeline.fire_activate()?;
            Ok((pipeline, writer))
        };

        let (pipeline, writer) = match build() {
            Ok(parts) => parts,
            Err(err) => {
                if let Err(reject) = pool.reject(&selection) {
                    tracing::warn!(error = %reject, "failed to release selection");
                }
                return Err(err);
            }
        };

        tracing::debug!(selection = %selection.id(), loop_id = %run_loop.id(), "transport opened");
        Ok(Self {
            selection,
            run_loop,
            pipeline,
            writer,
            pool: Arc::clone(pool),
            closed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn selection(&self) -> SelectionId {
        self.selection.id()
    }

    /// Loop the transport is pinned to
    #[inline]
    pub fn run_loop(&self) -> &RunLoop {
        &self.run_loop
    }

    /// Pipeline of the channel; stages added last land before the I/O boundary
    #[inline]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    #[inline]
    pub fn writer(&self) -> &ChannelWriter {
        &self.writer
    }

    /// Send `bytes` down the pipeline towards the channel
    pub fn write(&self, bytes: Bytes, priority: Priority) -> TetherResult<()> {
        self.pipeline
            .fire_store(Box::new(bytes), Some(Box::new(priority)))
    }

    /// Feed inbound bytes into the pipeline
    pub fn receive(&self, bytes: Bytes) -> TetherResult<()> {
        self.pipeline.fire_load(Box::new(bytes), None)
    }

    /// Channel became writable; re-flush on the owning loop
    pub fn on_writable(&self) -> TetherResult<()> {
        if self.is_closed() {
            return Err(TetherError::Closed("transport"));
        }
        if self.run_loop.in_loop_thread() {
            self.writer.on_writable()?;
            return Ok(());
        }
        let writer = self.writer.clone();
        self.run_loop.offer(once(move || {
            if let Err(err) = writer.on_writable() {
                tracing::warn!(error = %err, "writable flush failed");
            }
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the pipeline and release the selection (idempotent)
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.writer.cancel_retry();
        self.pipeline.close();
        if let Err(err) = self.pool.reject(&self.selection) {
            tracing::debug!(error = %err, "selection already released");
        }
        tracing::debug!(selection = %self.selection.id(), "transport closed");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("selection", &self.selection.id())
            .field("run_loop", &self.run_loop)
            .field("closed", &self.is_closed())
            .finish()
    }
}
