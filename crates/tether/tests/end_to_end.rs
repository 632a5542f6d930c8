//! End-to-end behavior of the engine through the `tether` facade

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether::{
    once, BudgetSink, Directions, FairWriteQueue, FlushOutcome, Message, Param, Priority,
    Runtime, RuntimeConfig, Selection, Stage, StageContext, StageResult, WeightedSelection,
};

fn runtime(pool_size: usize) -> Runtime {
    Runtime::new(
        RuntimeConfig::new()
            .pool_size(pool_size)
            .queue_weights(vec![50, 25])
            .round_bonus(100)
            .retry_delay(Duration::from_millis(5)),
    )
    .unwrap()
}

fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_sticky_until_loop_dies() {
    let runtime = runtime(2);
    let selection = WeightedSelection::unique(1);

    let first = runtime.assign(&selection).unwrap();
    assert_eq!(runtime.assign(&selection).unwrap(), first);

    first.close();
    let second = runtime.assign(&selection).unwrap();
    assert_ne!(second, first);
    assert!(second.is_alive());
    assert_eq!(runtime.pool().size(), 2);
    assert_eq!(runtime.pool().assignment_count(selection.id()), 1);
}

#[test]
fn test_timers_fire_in_deadline_order() {
    let runtime = runtime(1);
    let target = runtime.assign(&WeightedSelection::unique(1)).unwrap();
    let (tx, rx) = mpsc::channel();

    let late = tx.clone();
    runtime
        .schedule(&target, once(move || late.send(200).unwrap()), Duration::from_millis(200))
        .unwrap();
    runtime
        .schedule(&target, once(move || tx.send(100).unwrap()), Duration::from_millis(100))
        .unwrap();

    let timeout = Duration::from_secs(2);
    assert_eq!(rx.recv_timeout(timeout).unwrap(), 100);
    assert_eq!(rx.recv_timeout(timeout).unwrap(), 200);
}

#[test]
fn test_cancel_earliest_timer() {
    let runtime = runtime(1);
    let target = runtime.assign(&WeightedSelection::unique(1)).unwrap();
    let (tx, rx) = mpsc::channel();

    let early = tx.clone();
    let handle = runtime
        .schedule(&target, once(move || early.send("early").unwrap()), Duration::from_millis(50))
        .unwrap();
    runtime
        .schedule(&target, once(move || tx.send("late").unwrap()), Duration::from_millis(100))
        .unwrap();

    assert!(handle.cancel());
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "late");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_weight_round_trip() {
    let runtime = runtime(1);
    let selection = WeightedSelection::unique(7);
    let run_loop = runtime.assign(&selection).unwrap();
    assert_eq!(run_loop.weight(), 7);

    runtime.pool().reject(&selection).unwrap();
    assert_eq!(run_loop.weight(), 0);
    // Clamped at zero
    assert_eq!(run_loop.reject(&selection), 0);
}

#[test]
fn test_foreign_offers_run_in_order() {
    let runtime = runtime(1);
    let run_loop = runtime.assign(&WeightedSelection::unique(1)).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for tag in ["A", "B"] {
        let seen = Arc::clone(&seen);
        run_loop.offer(once(move || seen.lock().push(tag))).unwrap();
    }

    wait_until(|| seen.lock().len() == 2);
    assert_eq!(*seen.lock(), vec!["A", "B"]);
}

/// Upper-cases outbound bytes and records which thread ran it
struct Upper {
    on_loop: Arc<Mutex<Vec<bool>>>,
}

impl Stage for Upper {
    fn directions(&self) -> Directions {
        Directions::STORE
    }

    fn store(&mut self, ctx: &StageContext<'_>, msg: Message, param: Param) -> StageResult {
        self.on_loop.lock().push(ctx.run_loop().in_loop_thread());
        let bytes = msg
            .downcast::<Bytes>()
            .map_err(|_| tether::TaskError::msg("expected Bytes"))?;
        let upper = Bytes::from(bytes.to_ascii_uppercase());
        ctx.store_next(Box::new(upper), param);
        Ok(())
    }
}

#[test]
fn test_transport_pipeline_to_sink() {
    let runtime = runtime(2);
    let out = Arc::new(Mutex::new(Vec::new()));

    struct Collect(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for Collect {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let transport = runtime
        .open_transport(&WeightedSelection::unique(1), Collect(Arc::clone(&out)))
        .unwrap();
    let on_loop = Arc::new(Mutex::new(Vec::new()));
    transport
        .pipeline()
        .add_last("upper", Upper { on_loop: Arc::clone(&on_loop) })
        .unwrap();
    assert_eq!(transport.pipeline().keys(), vec!["upper", tether::constants::IO_BOUNDARY]);

    transport.write(Bytes::from_static(b"ping"), Priority::Base).unwrap();
    wait_until(|| out.lock().len() == 4);
    assert_eq!(&*out.lock(), b"PING");
    // Called from the test thread, executed on the transport's loop
    assert_eq!(*on_loop.lock(), vec![true]);
    assert!(transport.pipeline().stats().offered_calls >= 1);

    let selection = transport.selection();
    drop(transport);
    assert_eq!(runtime.pool().assignment_count(selection), 0);
}

#[test]
fn test_fair_queue_credit_and_bonus() {
    let mut queue = FairWriteQueue::with_weights(&[50, 25], 100).unwrap();
    queue.push_base(Bytes::from(vec![0u8; 1000]));
    queue.push(0, Bytes::from(vec![1u8; 300])).unwrap();
    queue.push(1, Bytes::from(vec![2u8; 300])).unwrap();

    let mut sink: Vec<u8> = Vec::new();
    assert_eq!(queue.flush(&mut sink).unwrap(), FlushOutcome::Skip);
    assert_eq!(queue.deficit(0), Some(200));
    assert_eq!(queue.deficit(1), Some(250));

    let mut rounds = 0;
    while queue.flush(&mut sink).unwrap() != FlushOutcome::Flushed {
        rounds += 1;
        assert!(rounds < 10);
    }
    assert_eq!(sink.len(), 1600);
}

#[test]
fn test_fair_queue_partial_resume() {
    let mut queue = FairWriteQueue::with_weights(&[100], 100).unwrap();
    queue.push(0, Bytes::from_static(b"0123456789")).unwrap();

    let mut sink = BudgetSink::new(Vec::new(), 6);
    assert_eq!(queue.flush(&mut sink).unwrap(), FlushOutcome::Flushing);
    assert_eq!(queue.resume_index(), Some(0));

    sink.refill(100);
    assert_eq!(queue.flush(&mut sink).unwrap(), FlushOutcome::Flushed);
    assert_eq!(sink.into_inner(), b"0123456789");
}
