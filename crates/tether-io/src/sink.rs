//! Sink adapters

use std::io;

/// Writer that accepts a limited number of bytes, then reports `WouldBlock`
///
/// Models a non-blocking socket whose send buffer fills up; `refill` plays
/// the role of the channel becoming writable again.
#[derive(Debug)]
pub struct BudgetSink<S> {
    inner: S,
    budget: usize,
}

impl<S: io::Write> BudgetSink<S> {
    pub fn new(inner: S, budget: usize) -> Self {
        Self { inner, budget }
    }

    /// Allow `bytes` more bytes through
    pub fn refill(&mut self, bytes: usize) {
        self.budget = self.budget.saturating_add(bytes);
    }

    /// Bytes that may still be written
    #[inline]
    pub fn budget(&self) -> usize {
        self.budget
    }

    #[inline]
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: io::Write> io::Write for BudgetSink<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.budget == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let allowed = buf.len().min(self.budget);
        let n = self.inner.write(&buf[..allowed])?;
        self.budget -= n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
