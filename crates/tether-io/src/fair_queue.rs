//! Deficit-round-robin fair write queue
//!
//! A channel's outbound traffic is split into one unweighted base queue and
//! N weighted queues. Each `flush` is one round:
//!
//! ```text
//!   resume ──► finish the partially written weighted head (if any)
//!   base   ──► drain everything, count bytes B
//!   q[0..N] ─► deficit += round(weight% × (B or round_bonus))
//!              empty        → deficit = 0
//!              head ≤ deficit → write one item, deficit -= size
//!              otherwise    → keep credit for the next round
//! ```
//!
//! The queue is owned by whichever loop drives the channel and does no
//! locking of its own.

use std::collections::VecDeque;
use std::fmt;
use std::io;

use tether_core::constants::MAX_QUEUE_WEIGHT;
use tether_core::{ChannelSink, OutboundItem, TetherError, TetherResult};
use tracing::trace;

/// Result of one flush round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every queued item was written out
    Flushed,
    /// The channel stopped accepting bytes mid-item; wait for writability
    Flushing,
    /// Nothing blocked, but weighted items are still waiting for credit
    Skip,
}

/// Statistics of the last `flush` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub outcome: FlushOutcome,
    /// Bytes written from the base queue
    pub base_flushed: u64,
    /// Bytes written from weighted queues (resumed item included)
    pub weighted_flushed: u64,
    /// Items completely written
    pub items_written: u32,
    /// Whether the round started by finishing a partial weighted item
    pub resumed: bool,
}

impl FlushReport {
    fn start() -> Self {
        Self {
            outcome: FlushOutcome::Flushed,
            base_flushed: 0,
            weighted_flushed: 0,
            items_written: 0,
            resumed: false,
        }
    }
}

struct WeightedQueue<T> {
    weight: u32,
    deficit: i64,
    items: VecDeque<T>,
}

/// Credit granted to a queue of `weight` percent for a round worth `round_bytes`
#[inline]
pub fn weighted_credit(weight: u32, round_bytes: u64) -> u64 {
    (weight as u64)
        .saturating_mul(round_bytes)
        .saturating_add(50)
        / 100
}

fn check_weight(weight: u32) -> TetherResult<()> {
    if weight == 0 || weight > MAX_QUEUE_WEIGHT {
        return Err(TetherError::InvalidArgument(
            "queue weight must be within 1..=100",
        ));
    }
    Ok(())
}

/// Base queue plus weighted priority queues drained onto one sink
pub struct FairWriteQueue<T: OutboundItem> {
    base: VecDeque<T>,
    queues: Vec<WeightedQueue<T>>,
    round_bonus: u64,
    resume: Option<usize>,
    last: Option<FlushReport>,
}

impl<T: OutboundItem> FairWriteQueue<T> {
    /// Create a queue with no weighted queues
    pub fn new(round_bonus: u64) -> Self {
        Self {
            base: VecDeque::new(),
            queues: Vec::new(),
            round_bonus,
            resume: None,
            last: None,
        }
    }

    /// Create a queue with one weighted queue per entry of `weights`
    pub fn with_weights(weights: &[u32], round_bonus: u64) -> TetherResult<Self> {
        let mut queue = Self::new(round_bonus);
        for &weight in weights {
            queue.add_queue(weight)?;
        }
        Ok(queue)
    }

    /// Append a weighted queue with the lowest priority so far
    ///
    /// Returns the queue index used by `push`.
    pub fn add_queue(&mut self, weight: u32) -> TetherResult<usize> {
        check_weight(weight)?;
        self.queues.push(WeightedQueue {
            weight,
            deficit: 0,
            items: VecDeque::new(),
        });
        Ok(self.queues.len() - 1)
    }

    /// Change the weight of an existing queue; accrued credit is kept
    pub fn set_weight(&mut self, queue: usize, weight: u32) -> TetherResult<()> {
        let slot = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| TetherError::not_found(format!("write queue {}", queue)))?;
        check_weight(weight)?;
        slot.weight = weight;
        Ok(())
    }

    /// Queue an item on the unweighted base queue
    #[inline]
    pub fn push_base(&mut self, item: T) {
        self.base.push_back(item);
    }

    /// Queue an item on weighted queue `queue`
    pub fn push(&mut self, queue: usize, item: T) -> TetherResult<()> {
        let slot = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| TetherError::not_found(format!("write queue {}", queue)))?;
        slot.items.push_back(item);
        Ok(())
    }

    #[inline]
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Number of queued items across all queues
    pub fn len(&self) -> usize {
        self.base.len() + self.queues.iter().map(|q| q.items.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty() && self.queues.iter().all(|q| q.items.is_empty())
    }

    /// Bytes not yet written across all queues
    pub fn pending_bytes(&self) -> usize {
        let base: usize = self.base.iter().map(OutboundItem::remaining).sum();
        let weighted: usize = self
            .queues
            .iter()
            .flat_map(|q| q.items.iter())
            .map(OutboundItem::remaining)
            .sum();
        base + weighted
    }

    /// Current deficit counter of a weighted queue
    #[inline]
    pub fn deficit(&self, queue: usize) -> Option<i64> {
        self.queues.get(queue).map(|q| q.deficit)
    }

    /// Weighted queue whose head item was only partially written
    #[inline]
    pub fn resume_index(&self) -> Option<usize> {
        self.resume
    }

    #[inline]
    pub fn round_bonus(&self) -> u64 {
        self.round_bonus
    }

    /// Statistics of the most recent `flush`
    #[inline]
    pub fn last_report(&self) -> Option<FlushReport> {
        self.last
    }

    /// Drop every queued item and reset all credit
    pub fn clear(&mut self) {
        self.base.clear();
        for q in &mut self.queues {
            q.items.clear();
            q.deficit = 0;
        }
        self.resume = None;
    }

    /// Run one fair-queueing round against `sink`
    ///
    /// Only genuinely broken channels produce an error; a sink that stops
    /// accepting bytes yields `Flushing`.
    pub fn flush(&mut self, sink: &mut dyn ChannelSink) -> io::Result<FlushOutcome> {
        let mut report = FlushReport::start();
        let outcome = self.flush_round(sink, &mut report);
        if let Ok(outcome) = outcome {
            report.outcome = outcome;
            trace!(
                outcome = ?outcome,
                base = report.base_flushed,
                weighted = report.weighted_flushed,
                items = report.items_written,
                "write queue flushed"
            );
        }
        self.last = Some(report);
        outcome
    }

    fn flush_round(
        &mut self,
        sink: &mut dyn ChannelSink,
        report: &mut FlushReport,
    ) -> io::Result<FlushOutcome> {
        // Partially written weighted head goes first, its credit was already spent
        if let Some(index) = self.resume {
            report.resumed = true;
            if let Some(item) = self.queues.get_mut(index).and_then(|q| q.items.front_mut()) {
                let n = item.write_to(sink)?;
                report.weighted_flushed += n as u64;
                if !item.is_drained() {
                    return Ok(FlushOutcome::Flushing);
                }
                self.queues[index].items.pop_front();
                report.items_written += 1;
            }
            self.resume = None;
        }

        let base_active = !self.base.is_empty();
        while let Some(item) = self.base.front_mut() {
            let n = item.write_to(sink)?;
            report.base_flushed += n as u64;
            if !item.is_drained() {
                return Ok(FlushOutcome::Flushing);
            }
            self.base.pop_front();
            report.items_written += 1;
        }

        let round_bytes = if base_active {
            report.base_flushed
        } else {
            self.round_bonus
        };

        for (index, queue) in self.queues.iter_mut().enumerate() {
            let credit = weighted_credit(queue.weight, round_bytes);
            queue.deficit = queue
                .deficit
                .saturating_add(i64::try_from(credit).unwrap_or(i64::MAX));

            if queue.items.is_empty() {
                queue.deficit = 0;
                continue;
            }
            let Some(item) = queue.items.front_mut() else {
                continue;
            };

            let size = item.remaining() as i64;
            if size > queue.deficit {
                continue;
            }

            queue.deficit -= size;
            let n = item.write_to(sink)?;
            report.weighted_flushed += n as u64;
            if !item.is_drained() {
                self.resume = Some(index);
                return Ok(FlushOutcome::Flushing);
            }
            queue.items.pop_front();
            report.items_written += 1;
        }

        if self.is_empty() {
            Ok(FlushOutcome::Flushed)
        } else {
            Ok(FlushOutcome::Skip)
        }
    }
}

impl<T: OutboundItem> fmt::Debug for FairWriteQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let weights: Vec<(u32, i64, usize)> = self
            .queues
            .iter()
            .map(|q| (q.weight, q.deficit, q.items.len()))
            .collect();
        f.debug_struct("FairWriteQueue")
            .field("base", &self.base.len())
            .field("queues", &weights)
            .field("round_bonus", &self.round_bonus)
            .field("resume", &self.resume)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::BudgetSink;
    use bytes::Bytes;
    use proptest::prelude::*;
    use tether_core::ErrorKind;

    fn item(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn test_weights_validated() {
        let mut q: FairWriteQueue<Bytes> = FairWriteQueue::new(100);
        assert_eq!(q.add_queue(0).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(q.add_queue(101).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(q.add_queue(100).unwrap(), 0);
        assert_eq!(q.set_weight(3, 10).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(q.set_weight(0, 0).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(q.push(1, item(1, 0)).unwrap_err().kind(), ErrorKind::NotFound);

        let err = FairWriteQueue::<Bytes>::with_weights(&[50, 200], 100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_empty_flush() {
        let mut q: FairWriteQueue<Bytes> = FairWriteQueue::with_weights(&[50], 100).unwrap();
        let mut sink: Vec<u8> = Vec::new();
        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Flushed);
        assert_eq!(q.deficit(0), Some(0));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_base_only_flushes_everything() {
        let mut q: FairWriteQueue<Bytes> = FairWriteQueue::new(100);
        q.push_base(Bytes::from_static(b"hello "));
        q.push_base(Bytes::from_static(b"world"));

        let mut sink: Vec<u8> = Vec::new();
        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Flushed);
        assert_eq!(sink, b"hello world");

        let report = q.last_report().unwrap();
        assert_eq!(report.base_flushed, 11);
        assert_eq!(report.items_written, 2);
        assert!(q.is_empty());
    }

    #[test]
    fn test_deficit_after_one_round() {
        // B = 1000, weights 50% and 25%, weighted items of 300 bytes
        let mut q = FairWriteQueue::with_weights(&[50, 25], 100).unwrap();
        q.push_base(item(1000, b'b'));
        q.push(0, item(300, b'h')).unwrap();
        q.push(1, item(300, b'l')).unwrap();

        let mut sink: Vec<u8> = Vec::new();
        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Skip);

        // 500 credit - 300 spent
        assert_eq!(q.deficit(0), Some(200));
        // 250 credit, not enough for 300
        assert_eq!(q.deficit(1), Some(250));
        assert_eq!(sink.len(), 1300);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pending_bytes(), 300);
    }

    #[test]
    fn test_round_bonus_eventually_flushes() {
        let mut q = FairWriteQueue::with_weights(&[50, 25], 100).unwrap();
        q.push_base(item(1000, b'b'));
        q.push(1, item(300, b'l')).unwrap();

        let mut sink: Vec<u8> = Vec::new();
        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Skip);
        assert_eq!(q.deficit(1), Some(250));

        // Base stays empty: 25% of a 100 byte bonus per round
        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Skip);
        assert_eq!(q.deficit(1), Some(275));
        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Flushed);
        assert_eq!(q.deficit(1), Some(0));
        assert_eq!(sink.len(), 1300);
        // Idle queue 0 never accumulated credit
        assert_eq!(q.deficit(0), Some(0));
    }

    #[test]
    fn test_idle_queue_credit_resets() {
        let mut q = FairWriteQueue::with_weights(&[50], 100).unwrap();
        q.push_base(item(1000, 0));
        q.push(0, item(100, 1)).unwrap();

        let mut sink: Vec<u8> = Vec::new();
        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Flushed);
        assert_eq!(q.deficit(0), Some(400));

        // Empty this round: credit is dropped, not banked
        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Flushed);
        assert_eq!(q.deficit(0), Some(0));
    }

    #[test]
    fn test_one_item_per_queue_per_round() {
        let mut q = FairWriteQueue::with_weights(&[100], 100).unwrap();
        q.push_base(item(1000, 0));
        q.push(0, item(10, 1)).unwrap();
        q.push(0, item(10, 2)).unwrap();

        let mut sink: Vec<u8> = Vec::new();
        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Skip);
        assert_eq!(q.deficit(0), Some(990));
        assert_eq!(q.len(), 1);

        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Flushed);
        assert_eq!(sink.len(), 1020);
    }

    #[test]
    fn test_partial_weighted_write_resumes() {
        let mut q = FairWriteQueue::with_weights(&[50, 50], 100).unwrap();
        q.push_base(item(400, b'b'));
        q.push(0, item(150, b'x')).unwrap();
        q.push(1, item(50, b'y')).unwrap();

        // Base 400 + 100 of the 150 byte item
        let mut sink = BudgetSink::new(Vec::new(), 500);
        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Flushing);
        assert_eq!(q.resume_index(), Some(0));
        assert_eq!(q.deficit(0), Some(50));
        // Queue 1 was never reached
        assert_eq!(q.deficit(1), Some(0));

        sink.refill(1000);
        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Flushed);
        let report = q.last_report().unwrap();
        assert!(report.resumed);
        assert_eq!(report.base_flushed, 0);
        assert_eq!(q.resume_index(), None);

        let out = sink.into_inner();
        assert_eq!(out.len(), 600);
        assert!(out[400..550].iter().all(|&b| b == b'x'));
        assert!(out[550..].iter().all(|&b| b == b'y'));
    }

    #[test]
    fn test_resume_still_blocked() {
        let mut q = FairWriteQueue::with_weights(&[100], 100).unwrap();
        q.push_base(item(100, 0));
        q.push(0, item(100, 1)).unwrap();

        let mut sink = BudgetSink::new(Vec::new(), 150);
        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Flushing);
        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Flushing);
        assert_eq!(q.resume_index(), Some(0));

        sink.refill(10);
        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Flushing);
        sink.refill(40);
        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Flushed);
        assert_eq!(sink.get_ref().len(), 200);
    }

    #[test]
    fn test_partial_base_write() {
        let mut q = FairWriteQueue::with_weights(&[50], 100).unwrap();
        q.push_base(item(100, 0));
        q.push(0, item(10, 1)).unwrap();

        let mut sink = BudgetSink::new(Vec::new(), 60);
        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Flushing);
        assert_eq!(q.resume_index(), None);
        // Weighted queues get no credit while the base is stuck
        assert_eq!(q.deficit(0), Some(0));
        assert_eq!(q.pending_bytes(), 50);

        // Only the 40 bytes written this round earn credit
        sink.refill(100);
        assert_eq!(q.flush(&mut sink).unwrap(), FlushOutcome::Flushed);
        assert_eq!(q.deficit(0), Some(10));
    }

    #[test]
    fn test_broken_channel_is_error() {
        struct Broken;
        impl io::Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::ConnectionReset.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut q: FairWriteQueue<Bytes> = FairWriteQueue::new(100);
        q.push_base(item(10, 0));
        let err = q.flush(&mut Broken).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_clear() {
        let mut q = FairWriteQueue::with_weights(&[50], 100).unwrap();
        q.push_base(item(100, 0));
        q.push(0, item(100, 1)).unwrap();
        let mut sink = BudgetSink::new(Vec::new(), 0);
        q.flush(&mut sink).unwrap();

        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.deficit(0), Some(0));
        assert_eq!(q.resume_index(), None);
    }

    #[test]
    fn test_weighted_credit_rounding() {
        assert_eq!(weighted_credit(50, 1000), 500);
        assert_eq!(weighted_credit(25, 1000), 250);
        assert_eq!(weighted_credit(33, 10), 3);
        assert_eq!(weighted_credit(50, 1), 1);
        assert_eq!(weighted_credit(100, u64::MAX), u64::MAX / 100);
    }

    proptest! {
        #[test]
        fn prop_credit_is_rounded_share(weight in 1u32..=100, bytes in 0u64..1_000_000_000) {
            let credit = weighted_credit(weight, bytes);
            let exact = weight as u64 * bytes;
            // |credit * 100 - exact| <= 50
            prop_assert!((credit * 100).abs_diff(exact) <= 50);
            prop_assert!(credit <= bytes);
        }

        #[test]
        fn prop_deficit_never_negative(
            sizes in proptest::collection::vec(1usize..400, 1..20),
            base in 0usize..1000,
        ) {
            let mut q = FairWriteQueue::with_weights(&[50, 25], 100).unwrap();
            if base > 0 {
                q.push_base(item(base, 0));
            }
            for (i, size) in sizes.iter().enumerate() {
                q.push(i % 2, item(*size, 1)).unwrap();
            }

            let mut sink: Vec<u8> = Vec::new();
            for _ in 0..200 {
                let outcome = q.flush(&mut sink).unwrap();
                prop_assert!(q.deficit(0).unwrap() >= 0);
                prop_assert!(q.deficit(1).unwrap() >= 0);
                if outcome == FlushOutcome::Flushed {
                    break;
                }
            }
            prop_assert!(q.is_empty());
        }
    }
}
