//! TimerService - deadline-ordered hand-off of deferred work to run loops

use super::entry::{CancelCounters, TimerEntry, TimerHandle};
use super::heap::TimerHeap;
use super::thread::{timer_loop, TimerThreadConfig};
use super::TimerStats;
use crate::config::RuntimeConfig;
use crate::parking::{new_parking, LoopParking};
use crate::run_loop::RunLoop;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tether_core::task::once;
use tether_core::{Reschedule, Task, TaskResult, TetherError, TetherResult};

/// State shared between the service handle, the timer thread and fired tasks
pub(super) struct ServiceShared {
    heap: Mutex<TimerHeap>,
    counters: Arc<CancelCounters>,
    parking: Box<dyn LoopParking>,
    shutdown: AtomicBool,
    seq: AtomicU64,
    polls: AtomicU64,
    fired: AtomicU64,
    rescheduled: AtomicU64,
    dropped: AtomicU64,
    max_batch: AtomicUsize,
}

impl ServiceShared {
    #[inline]
    pub(super) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    #[inline]
    pub(super) fn park(&self, timeout: Option<Duration>) {
        self.parking.park(timeout);
    }

    /// Insert an entry; wakes the timer thread if it became the new head
    fn insert(
        &self,
        target: RunLoop,
        task: Box<dyn Task>,
        deadline: Instant,
        handle: TimerHandle,
    ) -> TetherResult<()> {
        let earlier = {
            let mut heap = self.heap.lock();
            // Checked under the lock so shutdown's clear() sees every entry
            if self.is_shutdown() {
                return Err(TetherError::Closed("timer service"));
            }
            let earlier = heap.next_deadline().map_or(true, |head| deadline < head);
            heap.push(TimerEntry {
                deadline,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                target,
                task,
                handle,
            });
            earlier
        };

        if earlier {
            self.parking.unpark();
        }
        Ok(())
    }

    /// Pop due entries into `out`; returns the next live deadline
    pub(super) fn poll(&self, now: Instant, out: &mut Vec<TimerEntry>) -> Option<Instant> {
        let next = {
            let mut heap = self.heap.lock();
            heap.pop_expired(now, out);
            heap.maybe_compact();
            heap.next_deadline()
        };

        self.polls.fetch_add(1, Ordering::Relaxed);
        self.max_batch.fetch_max(out.len(), Ordering::Relaxed);
        next
    }

    /// Offer an expired entry to its target loop
    pub(super) fn dispatch(self: &Arc<Self>, entry: TimerEntry) {
        let TimerEntry {
            target,
            task,
            handle,
            ..
        } = entry;
        let timer = handle.id();

        let fired = Fired {
            task: Some(task),
            handle,
            target: target.clone(),
            service: Arc::downgrade(self),
        };

        match target.offer(fired) {
            Ok(()) => {
                self.fired.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(timer, loop_id = %target.id(), "timer fired");
            }
            Err(err) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(timer, loop_id = %target.id(), error = %err, "timer target unavailable, entry dropped");
            }
        }
    }
}

/// Wrapper offered to the target loop when an entry expires
///
/// Runs the deferred task; on `Reschedule::After(d)` re-inserts it into
/// the service with the same handle instead of letting the loop retry it.
struct Fired {
    task: Option<Box<dyn Task>>,
    handle: TimerHandle,
    target: RunLoop,
    service: Weak<ServiceShared>,
}

impl Task for Fired {
    fn run(&mut self) -> TaskResult {
        let Some(task) = self.task.as_mut() else {
            return Ok(Reschedule::Done);
        };

        let delay = match task.run()? {
            Reschedule::Done => return Ok(Reschedule::Done),
            Reschedule::After(delay) => delay,
        };

        if !self.handle.try_rearm() {
            tracing::trace!(timer = self.handle.id(), "periodic timer stopped by cancel");
            return Ok(Reschedule::Done);
        }

        let (Some(service), Some(task)) = (self.service.upgrade(), self.task.take()) else {
            return Ok(Reschedule::Done);
        };

        let deadline = Instant::now() + delay;
        match service.insert(self.target.clone(), task, deadline, self.handle.clone()) {
            Ok(()) => {
                service.rescheduled.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::debug!(timer = self.handle.id(), error = %err, "periodic timer not re-armed");
            }
        }
        Ok(Reschedule::Done)
    }
}

/// Deadline-ordered timer service with one dedicated thread
///
/// # Example
///
/// ```ignore
/// use tether_runtime::{RunLoop, RuntimeConfig, TimerService};
/// use std::time::Duration;
///
/// let config = RuntimeConfig::from_env();
/// let timers = TimerService::new(&config)?;
/// let run_loop = RunLoop::spawn(&config)?;
///
/// let handle = timers.schedule_fn(&run_loop, Duration::from_millis(100), || {
///     println!("fired on the loop thread");
/// })?;
///
/// // Cancel if no longer needed
/// handle.cancel();
/// ```
pub struct TimerService {
    shared: Arc<ServiceShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Create the service and start its thread
    pub fn new(config: &RuntimeConfig) -> TetherResult<Self> {
        Self::with_thread_config(TimerThreadConfig::from(config))
    }

    /// Create the service with explicit thread settings
    pub fn with_thread_config(config: TimerThreadConfig) -> TetherResult<Self> {
        let counters = Arc::new(CancelCounters::default());
        let shared = Arc::new(ServiceShared {
            heap: Mutex::new(TimerHeap::new(Arc::clone(&counters))),
            counters,
            parking: new_parking(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            fired: AtomicU64::new(0),
            rescheduled: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            max_batch: AtomicUsize::new(0),
        });

        let mut builder = thread::Builder::new().name(config.thread_name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let name = config.thread_name.clone();
        let thread_shared = Arc::clone(&shared);
        let handle = builder
            .spawn(move || timer_loop(thread_shared, config))
            .map_err(|source| TetherError::Spawn { name, source })?;

        tracing::debug!("timer service started");
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Run `task` on `target` after `delay`
    pub fn schedule<T: Task>(
        &self,
        target: &RunLoop,
        task: T,
        delay: Duration,
    ) -> TetherResult<TimerHandle> {
        self.schedule_at(target, task, Instant::now() + delay)
    }

    /// Run `task` on `target` at `deadline`
    ///
    /// A deadline in the past fires on the next timer poll.
    pub fn schedule_at<T: Task>(
        &self,
        target: &RunLoop,
        task: T,
        deadline: Instant,
    ) -> TetherResult<TimerHandle> {
        if !target.is_alive() {
            return Err(TetherError::Closed("run loop"));
        }
        let handle = TimerHandle::new(Arc::clone(&self.shared.counters));
        self.shared
            .insert(target.clone(), Box::new(task), deadline, handle.clone())?;
        Ok(handle)
    }

    /// Run a one-shot closure on `target` after `delay`
    pub fn schedule_fn<F>(
        &self,
        target: &RunLoop,
        delay: Duration,
        f: F,
    ) -> TetherResult<TimerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(target, once(f), delay)
    }

    /// Cancel a scheduled entry (see [`TimerHandle::cancel`])
    #[inline]
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        handle.cancel()
    }

    /// Pending (non-cancelled) entries
    pub fn len(&self) -> usize {
        self.shared.heap.lock().len()
    }

    /// Check if no entries are pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.shared.heap.lock().next_deadline()
    }

    /// Whether `shutdown` was called
    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Counter snapshot
    pub fn stats(&self) -> TimerStats {
        let shared = &*self.shared;
        TimerStats {
            polls: shared.polls.load(Ordering::Relaxed),
            fired: shared.fired.load(Ordering::Relaxed),
            cancelled: shared.counters.cancelled.load(Ordering::Relaxed),
            rescheduled: shared.rescheduled.load(Ordering::Relaxed),
            dropped: shared.dropped.load(Ordering::Relaxed),
            compactions: shared.heap.lock().compactions(),
            max_batch: shared.max_batch.load(Ordering::Relaxed),
        }
    }

    /// Stop the timer thread and drop pending entries (idempotent)
    pub fn shutdown(&self) {
        let discarded = {
            let mut heap = self.shared.heap.lock();
            if self.shared.shutdown.swap(true, Ordering::AcqRel) {
                return;
            }
            heap.clear()
        };

        self.shared.parking.unpark();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("timer thread panicked");
            }
        }
        tracing::debug!(discarded, "timer service stopped");
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("pending", &self.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tether_core::ErrorKind;

    fn setup() -> (RuntimeConfig, TimerService, RunLoop) {
        let config = RuntimeConfig::new().loop_max_wait(Duration::from_millis(20));
        let timers = TimerService::new(&config).unwrap();
        let run_loop = RunLoop::spawn(&config).unwrap();
        (config, timers, run_loop)
    }

    #[test]
    fn test_earlier_deadline_fires_first() {
        let (_config, timers, run_loop) = setup();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();

        let tx_b = tx.clone();
        timers
            .schedule_fn(&run_loop, Duration::from_millis(200), move || {
                tx_b.send(("B", start.elapsed())).unwrap()
            })
            .unwrap();
        timers
            .schedule_fn(&run_loop, Duration::from_millis(100), move || {
                tx.send(("A", start.elapsed())).unwrap()
            })
            .unwrap();

        let (first, t1) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let (second, t2) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((first, second), ("A", "B"));
        assert!(t1 >= Duration::from_millis(100));
        assert!(t2 >= Duration::from_millis(200));

        timers.shutdown();
        run_loop.close();
    }

    #[test]
    fn test_task_runs_on_target_loop() {
        let (_config, timers, run_loop) = setup();
        let (tx, rx) = mpsc::channel();

        let probe = run_loop.clone();
        timers
            .schedule_fn(&run_loop, Duration::from_millis(10), move || {
                tx.send(probe.in_loop_thread()).unwrap()
            })
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        timers.shutdown();
        run_loop.close();
    }

    #[test]
    fn test_cancel_earliest() {
        let (_config, timers, run_loop) = setup();
        let (tx, rx) = mpsc::channel();

        let tx_a = tx.clone();
        let early = timers
            .schedule_fn(&run_loop, Duration::from_millis(50), move || {
                tx_a.send("A").unwrap()
            })
            .unwrap();
        timers
            .schedule_fn(&run_loop, Duration::from_millis(100), move || {
                tx.send("B").unwrap()
            })
            .unwrap();

        assert!(timers.cancel(&early));
        assert!(early.is_cancelled());

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "B");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(timers.stats().cancelled, 1);

        timers.shutdown();
        run_loop.close();
    }

    #[test]
    fn test_cancel_after_fire_reports_false() {
        let (_config, timers, run_loop) = setup();
        let (tx, rx) = mpsc::channel();

        let handle = timers
            .schedule_fn(&run_loop, Duration::from_millis(5), move || {
                tx.send(()).unwrap()
            })
            .unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!handle.cancel());

        timers.shutdown();
        run_loop.close();
    }

    #[test]
    fn test_periodic_reschedule() {
        let (_config, timers, run_loop) = setup();
        let (tx, rx) = mpsc::channel();

        let mut runs = 0;
        timers
            .schedule(
                &run_loop,
                move || -> TaskResult {
                    runs += 1;
                    tx.send(runs).unwrap();
                    if runs < 3 {
                        Ok(Reschedule::After(Duration::from_millis(20)))
                    } else {
                        Ok(Reschedule::Done)
                    }
                },
                Duration::from_millis(10),
            )
            .unwrap();

        for expected in 1..=3 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), expected);
        }
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(timers.stats().rescheduled, 2);

        timers.shutdown();
        run_loop.close();
    }

    #[test]
    fn test_cancel_stops_periodic() {
        let (_config, timers, run_loop) = setup();
        let (tx, rx) = mpsc::channel();

        let handle = timers
            .schedule(
                &run_loop,
                move || -> TaskResult {
                    let _ = tx.send(());
                    Ok(Reschedule::After(Duration::from_millis(10)))
                },
                Duration::from_millis(5),
            )
            .unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.cancel();

        // At most one firing was already in flight when cancel landed
        thread::sleep(Duration::from_millis(50));
        while rx.try_recv().is_ok() {}
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        timers.shutdown();
        run_loop.close();
    }

    #[test]
    fn test_equal_deadlines_both_fire() {
        let (_config, timers, run_loop) = setup();
        let (tx, rx) = mpsc::channel();
        let deadline = Instant::now() + Duration::from_millis(20);

        for name in ["first", "second"] {
            let tx = tx.clone();
            timers
                .schedule_at(&run_loop, once(move || tx.send(name).unwrap()), deadline)
                .unwrap();
        }

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "first");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "second");

        timers.shutdown();
        run_loop.close();
    }

    #[test]
    fn test_schedule_after_shutdown() {
        let (_config, timers, run_loop) = setup();
        timers
            .schedule_fn(&run_loop, Duration::from_secs(60), || {})
            .unwrap();
        assert_eq!(timers.len(), 1);

        timers.shutdown();
        timers.shutdown();
        assert!(timers.is_shutdown());
        assert!(timers.is_empty());

        let err = timers
            .schedule_fn(&run_loop, Duration::from_millis(1), || {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
        run_loop.close();
    }

    #[test]
    fn test_closed_target_rejected() {
        let (_config, timers, run_loop) = setup();
        run_loop.close();

        let err = timers
            .schedule_fn(&run_loop, Duration::from_millis(1), || {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    #[test]
    fn test_next_deadline_tracks_head() {
        let (_config, timers, run_loop) = setup();
        let far = Instant::now() + Duration::from_secs(60);
        let farther = far + Duration::from_secs(60);

        let first = timers.schedule_at(&run_loop, once(|| {}), far).unwrap();
        timers.schedule_at(&run_loop, once(|| {}), farther).unwrap();
        assert_eq!(timers.next_deadline(), Some(far));

        first.cancel();
        assert_eq!(timers.next_deadline(), Some(farther));
        assert_eq!(timers.len(), 1);

        timers.shutdown();
        run_loop.close();
    }
}
