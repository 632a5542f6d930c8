//! Units of work executed by a run loop
//!
//! A task runs to completion on its loop's thread and tells the loop what
//! to do next: drop it (`Done`) or run it again after a delay (`After`).
//! Failures are values, never unwinds into the loop.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What the loop should do with a task after running it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reschedule {
    /// Task is complete
    Done,
    /// Run the task again after the given delay
    After(Duration),
}

impl Reschedule {
    /// Delay before the next run, if any
    #[inline]
    pub fn delay(self) -> Option<Duration> {
        match self {
            Reschedule::Done => None,
            Reschedule::After(d) => Some(d),
        }
    }
}

/// Failure raised by a task or a pipeline stage
///
/// Cheap to clone so the same failure can travel through the exception
/// path of several pipeline elements.
#[derive(Clone)]
pub struct TaskError {
    inner: Arc<dyn StdError + Send + Sync>,
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Message {}

impl TaskError {
    /// Failure carrying only a message
    pub fn msg(message: impl fmt::Display) -> Self {
        Self {
            inner: Arc::new(Message(message.to_string())),
        }
    }

    /// Convert a panic payload caught with `catch_unwind`
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let text = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::msg(format_args!("panicked: {}", text))
    }

    /// Borrow the underlying error
    pub fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.inner
    }

    /// Try to view the underlying error as a concrete type
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }
}

impl<E> From<E> for TaskError
where
    E: StdError + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self {
            inner: Arc::new(err),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskError").field(&self.inner).finish()
    }
}

/// Result of one task execution
pub type TaskResult = Result<Reschedule, TaskError>;

/// A unit of work owned by a run loop
///
/// Implemented for every `FnMut() -> TaskResult` closure; use [`once`]
/// for fire-and-forget closures.
pub trait Task: Send + 'static {
    /// Run the task on the loop thread
    fn run(&mut self) -> TaskResult;
}

impl<F> Task for F
where
    F: FnMut() -> TaskResult + Send + 'static,
{
    #[inline]
    fn run(&mut self) -> TaskResult {
        (self)()
    }
}

/// Task adapter for a closure that runs exactly once
pub struct Once<F>(Option<F>);

impl<F> Task for Once<F>
where
    F: FnOnce() + Send + 'static,
{
    fn run(&mut self) -> TaskResult {
        if let Some(f) = self.0.take() {
            f();
        }
        Ok(Reschedule::Done)
    }
}

/// Wrap a one-shot closure as a task that always reports `Done`
#[inline]
pub fn once<F>(f: F) -> Once<F>
where
    F: FnOnce() + Send + 'static,
{
    Once(Some(f))
}
