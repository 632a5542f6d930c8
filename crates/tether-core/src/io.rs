//! Outbound item and channel sink contracts
//!
//! The write scheduler only needs to know how many bytes an item still
//! holds and how to push them into a sink that may take fewer bytes than
//! offered, the way a non-blocking socket does.

use bytes::{Buf, Bytes};
use std::io;

/// Byte-accepting write primitive that may accept a partial write
///
/// Returning `Ok(0)` means the channel cannot take more right now.
pub trait ChannelSink {
    /// Write as much of `buf` as the channel accepts
    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl<W: io::Write + ?Sized> ChannelSink for W {
    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// A buffered message waiting to be written to a channel
pub trait OutboundItem: Send {
    /// Bytes not yet written
    fn remaining(&self) -> usize;

    /// Write as much as possible into `sink`, returning bytes written
    ///
    /// Stops early when the sink accepts zero bytes.
    fn write_to(&mut self, sink: &mut dyn ChannelSink) -> io::Result<usize>;

    /// Check whether the item has been written out completely
    fn is_drained(&self) -> bool {
        self.remaining() == 0
    }
}

impl OutboundItem for Bytes {
    #[inline]
    fn remaining(&self) -> usize {
        Buf::remaining(self)
    }

    fn write_to(&mut self, sink: &mut dyn ChannelSink) -> io::Result<usize> {
        let mut total = 0;
        while self.has_remaining() {
            let n = sink.write_bytes(self.chunk())?;
            if n == 0 {
                break;
            }
            self.advance(n);
            total += n;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts at most `budget` bytes in total, then reports WouldBlock
    struct Budgeted {
        budget: usize,
        out: Vec<u8>,
    }

    impl io::Write for Budgeted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_bytes_full_write() {
        let mut item = Bytes::from_static(b"hello");
        let mut sink: Vec<u8> = Vec::new();
        assert_eq!(item.write_to(&mut sink).unwrap(), 5);
        assert!(item.is_drained());
        assert_eq!(sink, b"hello");
    }

    #[test]
    fn test_bytes_partial_write_resumes() {
        let mut item = Bytes::from_static(b"abcdef");
        let mut sink = Budgeted { budget: 4, out: Vec::new() };

        assert_eq!(item.write_to(&mut sink).unwrap(), 4);
        assert_eq!(OutboundItem::remaining(&item), 2);

        sink.budget = 10;
        assert_eq!(item.write_to(&mut sink).unwrap(), 2);
        assert!(item.is_drained());
        assert_eq!(sink.out, b"abcdef");
    }

    #[test]
    fn test_interrupted_write_is_retried() {
        struct Flaky {
            interrupts: usize,
            out: Vec<u8>,
        }
        impl io::Write for Flaky {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if self.interrupts > 0 {
                    self.interrupts -= 1;
                    return Err(io::ErrorKind::Interrupted.into());
                }
                self.out.extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut sink = Flaky { interrupts: 2, out: Vec::new() };
        assert_eq!(sink.write_bytes(b"abc").unwrap(), 3);

        let mut item = Bytes::from_static(b"def");
        sink.interrupts = 1;
        assert_eq!(item.write_to(&mut sink).unwrap(), 3);
        assert!(item.is_drained());
        assert_eq!(sink.out, b"abcdef");
    }

    #[test]
    fn test_broken_sink_propagates() {
        struct Broken;
        impl io::Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut item = Bytes::from_static(b"x");
        let err = item.write_to(&mut Broken).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
