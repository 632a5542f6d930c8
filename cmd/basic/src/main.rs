//! Basic Tether example
//!
//! Opens a few transports on a small pool, pushes traffic through their
//! pipelines at different priorities and runs a periodic timer.
//!
//! # Environment Variables
//!
//! - `RUST_LOG=debug` - Log filter (e.g. `tether=trace`)
//! - `TETHER_POOL_SIZE=2` - Number of run loops
//! - `TETHER_QUEUE_WEIGHTS=50,25` - Weighted queue percentages
//! - `TETHER_ROUND_BONUS=1024` - Credit per idle-base round

use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether::{
    Message, Param, Priority, Reschedule, Runtime, RuntimeConfig, Stage, StageContext,
    Selection, StageResult, TaskError, TaskResult, WeightedSelection,
};
use tracing_subscriber::EnvFilter;

/// Counts bytes instead of writing them anywhere
#[derive(Clone, Default)]
struct CountingSink {
    bytes: Arc<AtomicUsize>,
}

impl io::Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.fetch_add(buf.len(), Ordering::Relaxed);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Frames each outbound payload with a 4-byte length prefix
struct LengthPrefix;

impl Stage for LengthPrefix {
    fn store(&mut self, ctx: &StageContext<'_>, msg: Message, param: Param) -> StageResult {
        let payload = msg
            .downcast::<Bytes>()
            .map_err(|_| TaskError::msg("length prefix expects Bytes"))?;
        let mut framed = Vec::with_capacity(payload.len() + 4);
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(&payload);
        ctx.store_next(Box::new(Bytes::from(framed)), param);
        Ok(())
    }
}

fn main() -> tether::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Tether Basic Example ===\n");

    let config = RuntimeConfig::from_env().pool_size(2);
    let runtime = Runtime::new(config)?;
    let weights = runtime.config().queue_weights.len();

    let sink = CountingSink::default();
    let mut transports = Vec::new();
    for i in 0..4u32 {
        let selection = WeightedSelection::unique(i + 1);
        let transport = runtime.open_transport(&selection, sink.clone())?;
        transport.pipeline().add_last("length-prefix", LengthPrefix)?;
        println!(
            "Transport {} pinned to loop {} (weight {})",
            selection.id(),
            transport.run_loop().id(),
            transport.run_loop().weight()
        );
        transports.push(transport);
    }

    // Periodic tick on the first transport's loop
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ticks);
    let tick = runtime.schedule(
        transports[0].run_loop(),
        move || -> TaskResult {
            let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(tick = n, "tick");
            Ok(Reschedule::After(Duration::from_millis(20)))
        },
        Duration::from_millis(20),
    )?;

    let mut expected = 0;
    for round in 0..100usize {
        for (i, transport) in transports.iter().enumerate() {
            let priority = match (round + i) % (weights + 1) {
                0 => Priority::Base,
                n => Priority::Queue(n - 1),
            };
            let payload = Bytes::from(vec![b'x'; 64 + round]);
            expected += payload.len() + 4;
            transport.write(payload, priority)?;
        }
    }

    let start = Instant::now();
    let timeout = Duration::from_secs(10);
    while sink.bytes.load(Ordering::Relaxed) < expected {
        if start.elapsed() > timeout {
            println!("WARNING: Timeout!");
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    tick.cancel();
    println!(
        "\nWrote {} of {} bytes in {:?}, {} ticks",
        sink.bytes.load(Ordering::Relaxed),
        expected,
        start.elapsed(),
        ticks.load(Ordering::Relaxed)
    );
    for transport in &transports {
        println!("  {:?}: {:?}", transport.selection(), transport.writer().last_report());
    }

    drop(transports);
    runtime.shutdown();
    println!("\n=== Example Complete ===");
    Ok(())
}
