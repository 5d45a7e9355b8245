//! Completion handoff from the worker to the downstream consumer.
//!
//! A completed [`DataBlock`] is moved, never copied, into a [`BlockSink`].
//! Sinks must not block: a bounded sink that is full applies its overflow
//! policy and returns [`Enqueued::Overflow`] so reception keeps going.

use std::sync::Arc;

use crate::data::DataBlock;
use crate::sync::spsc::{self, Consumer, Producer, Timeout};
use crate::trace::{trace, warn};

use super::stats::{RxStats, bump};

/// Result of handing a block to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The sink now owns the block.
    Accepted,
    /// The sink was full and applied its overflow policy.
    Overflow,
}

/// Downstream consumer of completed blocks.
pub trait BlockSink: Send + 'static {
    /// Takes ownership of `block`. Must return promptly.
    fn enqueue(&mut self, block: Box<DataBlock>) -> Enqueued;

    /// Hands back a block the consumer is done with, if any, so the worker
    /// can re-arm a slot without allocating.
    fn reclaim(&mut self) -> Option<Box<DataBlock>> {
        None
    }
}

/// Write end of the bundled output queue. Owned by the worker.
pub struct DataQueueProducer {
    blocks: Producer<Box<DataBlock>>,
    returned: Consumer<Box<DataBlock>>,
    /// Last block dropped on overflow, reused before any returned block.
    dropped: Option<Box<DataBlock>>,
}

/// Read end of the bundled output queue.
///
/// Blocks passed to [`recycle`](Self::recycle) go back to the worker and
/// are reused for later frames.
pub struct DataQueueConsumer {
    blocks: Consumer<Box<DataBlock>>,
    returned: Producer<Box<DataBlock>>,
}

/// Creates the bundled bounded output queue.
///
/// Overflow policy is **drop-newest**: when `capacity` blocks are waiting,
/// the block that just completed is discarded. Blocks already queued are
/// never touched by the producer, so the consumer sees an unbroken prefix of
/// the completion order.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn data_queue(capacity: usize) -> (DataQueueProducer, DataQueueConsumer) {
    let (blocks_tx, blocks_rx) = spsc::channel(capacity);
    let (returned_tx, returned_rx) = spsc::channel(capacity);
    (
        DataQueueProducer {
            blocks: blocks_tx,
            returned: returned_rx,
            dropped: None,
        },
        DataQueueConsumer {
            blocks: blocks_rx,
            returned: returned_tx,
        },
    )
}

impl BlockSink for DataQueueProducer {
    fn enqueue(&mut self, block: Box<DataBlock>) -> Enqueued {
        match self.blocks.push(block) {
            Ok(()) => Enqueued::Accepted,
            Err(dropped) => {
                self.dropped = Some(dropped);
                Enqueued::Overflow
            }
        }
    }

    fn reclaim(&mut self) -> Option<Box<DataBlock>> {
        self.dropped.take().or_else(|| self.returned.pop())
    }
}

impl DataQueueConsumer {
    #[must_use]
    pub fn pop(&self) -> Option<Box<DataBlock>> {
        self.blocks.pop()
    }

    /// Waits for the next completed block.
    #[must_use]
    pub fn pop_blocking(&self, timeout: Timeout) -> Option<Box<DataBlock>> {
        self.blocks.pop_blocking(timeout)
    }

    /// Returns a consumed block to the worker. Dropped if the return path
    /// is full.
    pub fn recycle(&self, block: Box<DataBlock>) {
        let _ = self.returned.push(block);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Publishes completed blocks to a sink, exactly once each.
pub struct Handoff<S> {
    sink: S,
    stats: Arc<RxStats>,
}

impl<S: BlockSink> Handoff<S> {
    pub fn new(sink: S, stats: Arc<RxStats>) -> Self {
        Self { sink, stats }
    }

    /// Moves `block` to the sink and counts the outcome.
    pub fn publish(&mut self, block: Box<DataBlock>) -> Enqueued {
        debug_assert!(block.is_complete());
        let _frame = block.frame_index();
        let outcome = self.sink.enqueue(block);
        match outcome {
            Enqueued::Accepted => {
                trace!(frame = %_frame, "block published");
                bump(&self.stats.published);
            }
            Enqueued::Overflow => {
                warn!(frame = %_frame, "output queue full, dropping newest block");
                bump(&self.stats.overflow);
            }
        }
        outcome
    }

    /// Next block the sink is done with.
    pub fn reclaim(&mut self) -> Option<Box<DataBlock>> {
        self.sink.reclaim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BlockHeader, Datagram, FrameIndex, SampleFormat};
    use crate::runtime::ring::{Admission, FrameRing};

    fn completed(frame: u16, stats: &Arc<RxStats>) -> Box<DataBlock> {
        let mut ring = FrameRing::new(4, Arc::clone(stats));
        let mut buf = Vec::new();
        BlockHeader {
            frame_index: FrameIndex::new(frame),
            block_index: 0,
            block_count: 1,
            format: SampleFormat::I16,
            payload_len: 0,
        }
        .encode(b"iqiq", &mut buf);
        match ring.admit(&Datagram::decode(&buf).unwrap()) {
            Admission::Complete(block) => block,
            other => panic!("single-block frame should complete, got {other:?}"),
        }
    }

    #[test]
    fn publish_moves_block_to_queue() {
        let stats = Arc::new(RxStats::default());
        let (writer, reader) = data_queue(4);
        let mut handoff = Handoff::new(writer, Arc::clone(&stats));

        assert_eq!(handoff.publish(completed(9, &stats)), Enqueued::Accepted);
        let block = reader.pop().unwrap();
        assert_eq!(block.frame_index(), FrameIndex::new(9));
        assert_eq!(block.payload(), b"iqiq");
        assert_eq!(stats.snapshot().published, 1);
    }

    #[test]
    fn full_queue_drops_newest() {
        let stats = Arc::new(RxStats::default());
        let (writer, reader) = data_queue(2);
        let mut handoff = Handoff::new(writer, Arc::clone(&stats));

        assert_eq!(handoff.publish(completed(1, &stats)), Enqueued::Accepted);
        assert_eq!(handoff.publish(completed(2, &stats)), Enqueued::Accepted);
        assert_eq!(handoff.publish(completed(3, &stats)), Enqueued::Overflow);

        let kept: Vec<u16> = std::iter::from_fn(|| reader.pop())
            .map(|b| b.frame_index().as_u16())
            .collect();
        assert_eq!(kept, vec![1, 2]);

        let snap = stats.snapshot();
        assert_eq!(snap.published, 2);
        assert_eq!(snap.overflow, 1);

        // Room again once the consumer caught up.
        assert_eq!(handoff.publish(completed(4, &stats)), Enqueued::Accepted);
        assert_eq!(reader.pop().map(|b| b.frame_index().as_u16()), Some(4));
    }

    #[test]
    fn recycled_and_dropped_blocks_come_back() {
        let stats = Arc::new(RxStats::default());
        let (writer, reader) = data_queue(1);
        let mut handoff = Handoff::new(writer, Arc::clone(&stats));
        assert!(handoff.reclaim().is_none());

        handoff.publish(completed(1, &stats));
        let overflowed = completed(2, &stats);
        let overflowed_at: *const DataBlock = &*overflowed;
        assert_eq!(handoff.publish(overflowed), Enqueued::Overflow);

        let consumed = reader.pop().unwrap();
        let consumed_at: *const DataBlock = &*consumed;
        reader.recycle(consumed);

        // The block dropped on overflow is handed back first.
        let first = handoff.reclaim().unwrap();
        assert!(std::ptr::eq(&*first, overflowed_at));
        let second = handoff.reclaim().unwrap();
        assert!(std::ptr::eq(&*second, consumed_at));
        assert!(handoff.reclaim().is_none());
    }

    #[test]
    fn custom_sink_receives_blocks() {
        struct Collect(std::sync::mpsc::Sender<u16>);
        impl BlockSink for Collect {
            fn enqueue(&mut self, block: Box<DataBlock>) -> Enqueued {
                let _ = self.0.send(block.frame_index().as_u16());
                Enqueued::Accepted
            }
        }

        let stats = Arc::new(RxStats::default());
        let (tx, rx) = std::sync::mpsc::channel();
        let mut handoff = Handoff::new(Collect(tx), Arc::clone(&stats));
        handoff.publish(completed(11, &stats));
        assert_eq!(rx.try_recv(), Ok(11));
    }
}
