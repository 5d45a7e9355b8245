//! Frame ring: the in-flight reassembly window of the receive worker.
//!
//! # Design
//!
//! `N` slots, each owning one pre-allocated [`DataBlock`]. A frame lives in
//! slot `frame_index mod N`, so at most `N` frames are in flight and finding
//! a datagram's block is a mask, not a lookup. `N` is a power of two that
//! divides the 16-bit index space, which keeps the mapping continuous across
//! wraparound.
//!
//! ```text
//! FrameRing (N = 4)
//! ├── slot 0: frame 8   Partial  [■■□■]
//! ├── slot 1: empty     floor 9
//! ├── slot 2: frame 6   Partial  [■□□□]
//! └── slot 3: frame 7   Partial  [■■■□]
//! newest = 8
//! ```
//!
//! A datagram for a different frame than the slot's resident either evicts
//! the resident (incoming is newer; the partial frame is abandoned and never
//! published) or is dropped as stale (incoming is older). A completed block
//! is swapped out for a spare, so the consumer owns it outright and the
//! slot remembers a floor of `frame_index + N`: late duplicates of the
//! completed frame are stale.
//!
//! Spares are blocks the consumer handed back through
//! [`restock`](FrameRing::restock). A new block is allocated only when no
//! spare is held.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::data::{DataBlock, Datagram, FillState, FrameIndex, WriteOutcome};
use crate::trace::{debug, trace};

use super::stats::{RxStats, bump};

/// Outcome of offering one datagram to the ring.
#[derive(Debug)]
pub enum Admission {
    /// Written; the frame is still missing blocks.
    Pending,
    /// The block had already been written; rewritten in place.
    Duplicate,
    /// The frame is complete. Ownership passes to the caller.
    Complete(Box<DataBlock>),
    /// The frame has left the window. Nothing was written.
    Stale,
    /// Header contradicts the frame already being assembled. Nothing was
    /// written.
    Inconsistent,
}

struct Slot {
    block: Box<DataBlock>,
    /// First frame index this slot accepts once its last frame was handed
    /// off. `None` until a frame completes here.
    floor: Option<FrameIndex>,
}

/// Fixed-size ring of in-flight frames indexed by frame affinity.
pub struct FrameRing {
    slots: Box<[Slot]>,
    newest: Option<FrameIndex>,
    /// Returned blocks, already reset. At most `ring_size` are kept.
    spares: Vec<Box<DataBlock>>,
    stats: Arc<RxStats>,
}

impl FrameRing {
    /// Allocates `ring_size` full-capacity blocks up front.
    ///
    /// # Panics
    ///
    /// Panics unless `ring_size` is a power of two in `1..=MAX_RING_SIZE`;
    /// [`ReceiverConfig::validate`](super::ReceiverConfig::validate) checks
    /// this before a worker is spawned.
    #[must_use]
    pub fn new(ring_size: usize, stats: Arc<RxStats>) -> Self {
        assert!(
            ring_size.is_power_of_two() && ring_size <= MAX_RING_SIZE,
            "ring size must be a power of two no larger than {MAX_RING_SIZE}"
        );
        let slots = (0..ring_size)
            .map(|_| Slot {
                block: DataBlock::boxed(),
                floor: None,
            })
            .collect();
        Self {
            slots,
            newest: None,
            spares: Vec::with_capacity(ring_size),
            stats,
        }
    }

    #[must_use]
    pub fn ring_size(&self) -> usize {
        self.slots.len()
    }

    /// Most recent frame index admitted since the last [`clear`](Self::clear).
    #[must_use]
    pub const fn newest(&self) -> Option<FrameIndex> {
        self.newest
    }

    /// Number of partially filled frames.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.block.fill() == FillState::Partial)
            .count()
    }

    /// Whether the ring has room for another returned block.
    #[must_use]
    pub fn wants_spare(&self) -> bool {
        self.spares.len() < self.slots.len()
    }

    /// Takes back a block the consumer is done with. The block is reset and
    /// kept for the next completion; it is dropped if the ring already holds
    /// `ring_size` spares.
    pub fn restock(&mut self, mut block: Box<DataBlock>) {
        if self.wants_spare() {
            block.reset();
            self.spares.push(block);
        }
    }

    /// Frame index held by each slot, `None` for empty slots.
    #[cfg(test)]
    fn residents(&self) -> Vec<Option<FrameIndex>> {
        self.slots
            .iter()
            .map(|s| match s.block.fill() {
                FillState::Empty => None,
                _ => Some(s.block.frame_index()),
            })
            .collect()
    }

    /// Routes a decoded datagram to its slot.
    pub fn admit(&mut self, datagram: &Datagram<'_>) -> Admission {
        let header = &datagram.header;
        let frame = header.frame_index;
        let ring_size = self.slots.len();

        if let Some(newest) = self.newest
            && i32::from(newest.offset_from(frame)) >= ring_size as i32
        {
            trace!(frame = %frame, newest = %newest, "datagram behind window");
            bump(&self.stats.stale);
            return Admission::Stale;
        }

        let slot_idx = frame.slot(ring_size);
        let slot = &mut self.slots[slot_idx];

        if slot.block.fill() == FillState::Empty {
            if let Some(floor) = slot.floor {
                let behind = i32::from(floor.offset_from(frame));
                if behind > 0 && behind <= ring_size as i32 {
                    trace!(frame = %frame, floor = %floor, "datagram for handed-off frame");
                    bump(&self.stats.stale);
                    return Admission::Stale;
                }
            }
            slot.block.assign(frame, header.block_count, header.format);
            slot.floor = None;
        } else if slot.block.frame_index() != frame {
            let resident = slot.block.frame_index();
            if !frame.is_newer_than(resident) {
                trace!(frame = %frame, resident = %resident, "datagram older than slot resident");
                bump(&self.stats.stale);
                return Admission::Stale;
            }
            debug!(
                slot = slot_idx,
                abandoned = %resident,
                received = slot.block.received_blocks(),
                expected = slot.block.block_count(),
                frame = %frame,
                "abandoning incomplete frame"
            );
            bump(&self.stats.abandoned);
            slot.block.assign(frame, header.block_count, header.format);
        }

        let admission = match slot.block.write(header, datagram.payload) {
            WriteOutcome::Written => Admission::Pending,
            WriteOutcome::Duplicate => {
                bump(&self.stats.duplicates);
                Admission::Duplicate
            }
            WriteOutcome::Inconsistent => {
                debug!(
                    frame = %frame,
                    block_count = header.block_count,
                    expected = slot.block.block_count(),
                    "datagram inconsistent with frame"
                );
                bump(&self.stats.inconsistent);
                return Admission::Inconsistent;
            }
            WriteOutcome::Completed => {
                let fresh = match self.spares.pop() {
                    Some(spare) => {
                        bump(&self.stats.recycled);
                        spare
                    }
                    None => DataBlock::boxed(),
                };
                let block = std::mem::replace(&mut slot.block, fresh);
                slot.floor = Some(frame.wrapping_add(ring_size as u16));
                trace!(frame = %frame, len = block.len(), "frame complete");
                Admission::Complete(block)
            }
        };

        if self.newest.is_none_or(|newest| frame.is_newer_than(newest)) {
            self.newest = Some(frame);
        }
        admission
    }

    /// Discards every in-flight frame and forgets the window.
    ///
    /// Returns the number of partial frames dropped. Nothing is published.
    pub fn clear(&mut self) -> usize {
        let mut dropped = 0;
        for slot in self.slots.iter_mut() {
            if slot.block.fill() == FillState::Partial {
                dropped += 1;
            }
            slot.block.reset();
            slot.floor = None;
        }
        self.newest = None;
        if dropped > 0 {
            debug!(dropped = dropped, "ring cleared");
            self.stats.flushed.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        dropped
    }
}

/// Largest supported ring. Keeps the window well inside half the index space.
pub const MAX_RING_SIZE: usize = 1 << 14;

/// Default ring size.
pub const DEFAULT_RING_SIZE: usize = 4;
