//! Runtime: pool plus timer service built from one configuration

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tether_core::{ChannelSink, Selection, Task, TetherResult};
use tether_runtime::{RunLoop, RunLoopPool, RuntimeConfig, TimerHandle, TimerService};

use crate::error::Result;
use crate::transport::Transport;

/// Owner of the run-loop pool and the timer service
///
/// Dropping the runtime shuts both down.
pub struct Runtime {
    config: RuntimeConfig,
    pool: Arc<RunLoopPool>,
    timer: Arc<TimerService>,
    shutdown: AtomicBool,
}

impl Runtime {
    /// Validate `config`, start the pool's loops and the timer thread
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        config.log_summary();

        let pool = Arc::new(RunLoopPool::new(config.clone())?);
        let timer = match TimerService::new(&config) {
            Ok(timer) => Arc::new(timer),
            Err(err) => {
                pool.close();
                return Err(err.into());
            }
        };

        tracing::info!(pool_size = config.pool_size, "tether runtime started");
        Ok(Self {
            config,
            pool,
            timer,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Runtime with defaults and environment overrides
    pub fn from_env() -> Result<Self> {
        Self::new(RuntimeConfig::from_env())
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn pool(&self) -> &Arc<RunLoopPool> {
        &self.pool
    }

    #[inline]
    pub fn timer(&self) -> &Arc<TimerService> {
        &self.timer
    }

    /// Pin `selection` to a loop (see [`RunLoopPool::assign`])
    pub fn assign(&self, selection: &dyn Selection) -> TetherResult<RunLoop> {
        self.pool.assign(selection)
    }

    /// Run `task` on `target` after `delay`
    pub fn schedule<T: Task>(
        &self,
        target: &RunLoop,
        task: T,
        delay: Duration,
    ) -> TetherResult<TimerHandle> {
        self.timer.schedule(target, task, delay)
    }

    /// Open a transport for `selection` writing into `sink`
    pub fn open_transport<S>(&self, selection: &dyn Selection, sink: S) -> TetherResult<Transport>
    where
        S: ChannelSink + Send + 'static,
    {
        Transport::open(
            &self.pool,
            &self.timer,
            &self.config,
            selection,
            Box::new(sink),
        )
    }

    /// Whether `shutdown` was called
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop the timer thread and close every loop (idempotent)
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.timer.shutdown();
        self.pool.close();
        tracing::info!("tether runtime shut down");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("pool", &self.pool)
            .field("timer", &self.timer)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::mpsc;
    use tether_core::task::once;
    use tether_core::{ErrorKind, WeightedSelection};
    use tether_runtime::ConfigError;

    fn config() -> RuntimeConfig {
        RuntimeConfig::new().pool_size(2)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = Runtime::new(config().queue_weights(vec![0])).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::QueueWeight(0))));
    }

    #[test]
    fn test_assign_is_sticky() {
        let runtime = Runtime::new(config()).unwrap();
        let selection = WeightedSelection::unique(3);

        let first = runtime.assign(&selection).unwrap();
        let second = runtime.assign(&selection).unwrap();
        assert_eq!(first, second);
        assert_eq!(runtime.pool().assignment_count(selection.id()), 2);
    }

    #[test]
    fn test_schedule_runs_on_target() {
        let runtime = Runtime::new(config()).unwrap();
        let target = runtime.assign(&WeightedSelection::unique(1)).unwrap();
        let (tx, rx) = mpsc::channel();

        let probe = target.clone();
        runtime
            .schedule(
                &target,
                once(move || {
                    tx.send(probe.in_loop_thread()).unwrap();
                }),
                Duration::from_millis(5),
            )
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let runtime = Runtime::new(config()).unwrap();
        runtime.shutdown();
        runtime.shutdown();

        assert!(runtime.is_shutdown());
        assert!(runtime.timer().is_shutdown());
        let err = runtime.assign(&WeightedSelection::unique(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }
}
