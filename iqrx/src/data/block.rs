//! Reassembly unit for one frame of samples.
//!
//! A [`DataBlock`] is allocated once at full [`FRAME_CAPACITY`] and written
//! in place as datagrams arrive. Ownership moves from the receive ring to the
//! output queue when the block completes; the ring never keeps a reference to
//! a block it has handed off.

use std::fmt;

use super::wire::{BLOCK_PAYLOAD_SIZE, BlockHeader, FRAME_CAPACITY};

/// Circular frame sequence number.
///
/// Wraps at `u16::MAX`. Ordering is defined with serial number arithmetic:
/// `a` is newer than `b` when `a - b`, taken as a signed 16-bit value, is
/// positive. Two indices exactly half the space apart compare as older.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameIndex(u16);

impl FrameIndex {
    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Signed distance from `other` to `self`, wraparound aware.
    #[inline]
    #[must_use]
    pub const fn offset_from(self, other: Self) -> i16 {
        self.0.wrapping_sub(other.0) as i16
    }

    #[inline]
    #[must_use]
    pub const fn is_newer_than(self, other: Self) -> bool {
        self.offset_from(other) > 0
    }

    #[inline]
    #[must_use]
    pub const fn wrapping_add(self, n: u16) -> Self {
        Self(self.0.wrapping_add(n))
    }

    /// Ring slot for this index. `ring_size` must be a power of two.
    #[inline]
    #[must_use]
    pub const fn slot(self, ring_size: usize) -> usize {
        self.0 as usize & (ring_size - 1)
    }
}

impl From<u16> for FrameIndex {
    fn from(v: u16) -> Self {
        Self(v)
    }
}

impl fmt::Display for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Sample encoding announced by the sender in every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleFormat {
    /// Storage bytes per I or Q component.
    pub sample_bytes: u8,
    /// Significant bits per component.
    pub sample_bits: u8,
}

impl SampleFormat {
    /// 16-bit components in 2 bytes.
    pub const I16: Self = Self {
        sample_bytes: 2,
        sample_bits: 16,
    };

    /// 24-bit components stored in 4 bytes.
    pub const I24: Self = Self {
        sample_bytes: 4,
        sample_bits: 24,
    };

    /// Bytes occupied by one complex (I, Q) sample.
    #[must_use]
    pub const fn iq_bytes(self) -> usize {
        2 * self.sample_bytes as usize
    }
}

/// Fill state of a [`DataBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillState {
    /// Not assigned to any frame.
    Empty,
    /// Assigned, some blocks missing.
    Partial,
    /// Every block of the frame has been written.
    Complete,
}

/// Result of writing one datagram into a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// New block stored, frame still incomplete.
    Written,
    /// Block had already been stored; rewritten in place.
    Duplicate,
    /// Block stored and the frame is now complete.
    Completed,
    /// Header disagrees with the frame's block count or sample format.
    Inconsistent,
}

/// One frame being reassembled.
pub struct DataBlock {
    frame_index: FrameIndex,
    fill: FillState,
    /// Bit `i` set once block `i` has been written.
    received: u128,
    block_count: u8,
    format: SampleFormat,
    tail_len: usize,
    len: usize,
    payload: Box<[u8]>,
}

impl DataBlock {
    /// Allocates an empty block with room for a full frame.
    #[must_use]
    pub fn new() -> Self {
        Self {
            frame_index: FrameIndex::new(0),
            fill: FillState::Empty,
            received: 0,
            block_count: 0,
            format: SampleFormat::default(),
            tail_len: 0,
            len: 0,
            payload: vec![0u8; FRAME_CAPACITY].into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn boxed() -> Box<Self> {
        Box::new(Self::new())
    }

    #[must_use]
    pub const fn frame_index(&self) -> FrameIndex {
        self.frame_index
    }

    #[must_use]
    pub const fn fill(&self) -> FillState {
        self.fill
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self.fill, FillState::Complete)
    }

    #[must_use]
    pub const fn block_count(&self) -> u8 {
        self.block_count
    }

    /// Number of distinct blocks written so far.
    #[must_use]
    pub const fn received_blocks(&self) -> u32 {
        self.received.count_ones()
    }

    #[must_use]
    pub const fn format(&self) -> SampleFormat {
        self.format
    }

    /// Reassembled payload length; zero until the block is complete.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reassembled sample bytes. Empty until the block is complete.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.len]
    }

    /// Number of complex samples in the payload.
    #[must_use]
    pub const fn sample_count(&self) -> usize {
        match self.format.iq_bytes() {
            0 => 0,
            n => self.len / n,
        }
    }

    /// Claims an empty block for `frame_index`.
    pub(crate) fn assign(&mut self, frame_index: FrameIndex, block_count: u8, format: SampleFormat) {
        self.reset();
        self.frame_index = frame_index;
        self.block_count = block_count;
        self.format = format;
        self.fill = FillState::Partial;
    }

    /// Returns the block to [`FillState::Empty`]. Payload bytes are left in
    /// place and overwritten by the next frame.
    pub(crate) fn reset(&mut self) {
        self.fill = FillState::Empty;
        self.received = 0;
        self.block_count = 0;
        self.format = SampleFormat::default();
        self.tail_len = 0;
        self.len = 0;
    }

    /// Copies one datagram's payload to its offset in the frame.
    ///
    /// The caller has already matched `header.frame_index` against this
    /// block and the wire decoder has validated the header bounds.
    pub(crate) fn write(&mut self, header: &BlockHeader, payload: &[u8]) -> WriteOutcome {
        debug_assert_eq!(self.fill, FillState::Partial);
        if header.block_count != self.block_count || header.format != self.format {
            return WriteOutcome::Inconsistent;
        }

        let offset = header.offset();
        self.payload[offset..offset + payload.len()].copy_from_slice(payload);
        if header.is_last() {
            self.tail_len = payload.len();
        }

        let bit = 1u128 << header.block_index;
        if self.received & bit != 0 {
            return WriteOutcome::Duplicate;
        }
        self.received |= bit;

        if self.received == Self::full_mask(self.block_count) {
            self.fill = FillState::Complete;
            self.len = (usize::from(self.block_count) - 1) * BLOCK_PAYLOAD_SIZE + self.tail_len;
            WriteOutcome::Completed
        } else {
            WriteOutcome::Written
        }
    }

    const fn full_mask(block_count: u8) -> u128 {
        if block_count as u32 >= u128::BITS {
            u128::MAX
        } else {
            (1u128 << block_count) - 1
        }
    }
}

impl Default for DataBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBlock")
            .field("frame_index", &self.frame_index)
            .field("fill", &self.fill)
            .field("received", &self.received_blocks())
            .field("block_count", &self.block_count)
            .field("format", &self.format)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}
