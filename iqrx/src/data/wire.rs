//! Datagram wire format shared with the sending device.
//!
//! Every datagram carries one block of one frame:
//!
//! ```text
//! ┌────────────────┬──────────┬──────────┬──────────┬──────────┬────────────────┐
//! │ Frame index(2) │ Block(1) │ Count(1) │ SBytes(1)│ SBits(1) │ Payload len(2) │
//! └────────────────┴──────────┴──────────┴──────────┴──────────┴────────────────┘
//!   followed by `payload len` bytes of samples
//! ```
//!
//! All integers are little-endian. `Count` is the number of blocks making up
//! the frame and is what marks completion: a frame is complete once blocks
//! `0..Count` have all arrived. Block `i` lands at byte offset
//! `i * BLOCK_PAYLOAD_SIZE` of the frame, so every block except the last must
//! be full.

use thiserror::Error;

use super::block::{FrameIndex, SampleFormat};

/// Size of the fixed header preceding the payload.
pub const HEADER_SIZE: usize = 8;

/// Largest datagram the sender emits.
pub const MAX_DATAGRAM_SIZE: usize = 512;

/// Sample bytes carried by one full block.
pub const BLOCK_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - HEADER_SIZE;

/// Upper bound on blocks per frame (bitmap width of [`super::DataBlock`]).
pub const MAX_BLOCKS_PER_FRAME: usize = 128;

/// Payload capacity of one reassembled frame.
pub const FRAME_CAPACITY: usize = MAX_BLOCKS_PER_FRAME * BLOCK_PAYLOAD_SIZE;

/// Errors while decoding a datagram. The offending datagram is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    /// Fewer bytes than the fixed header.
    #[error("datagram truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    /// Header length field disagrees with the datagram size.
    #[error("payload length {declared} does not match {actual} received bytes")]
    LengthMismatch { declared: usize, actual: usize },
    /// Block count is zero or above [`MAX_BLOCKS_PER_FRAME`].
    #[error("invalid block count {0}")]
    InvalidBlockCount(u8),
    /// Block index is not below the block count.
    #[error("block index {index} out of range for {count} blocks")]
    BlockOutOfRange { index: u8, count: u8 },
    /// Payload larger than one block.
    #[error("payload of {0} bytes exceeds block size")]
    PayloadTooLarge(usize),
    /// A block other than the last one is not full.
    #[error("interior block {index} carries {len} bytes")]
    ShortInteriorBlock { index: u8, len: usize },
}

/// Decoded datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub frame_index: FrameIndex,
    pub block_index: u8,
    pub block_count: u8,
    pub format: SampleFormat,
    pub payload_len: u16,
}

impl BlockHeader {
    /// Byte offset of this block inside the reassembled frame.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.block_index as usize * BLOCK_PAYLOAD_SIZE
    }

    /// Whether this is the final block of its frame.
    #[inline]
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.block_index as usize + 1 == self.block_count as usize
    }

    /// Appends the encoded header and `payload` to `buf`.
    ///
    /// `payload_len` is taken from `payload`, not from `self`. Used by senders
    /// and by the test suites to synthesize traffic.
    pub fn encode(&self, payload: &[u8], buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(&self.frame_index.as_u16().to_le_bytes());
        buf.push(self.block_index);
        buf.push(self.block_count);
        buf.push(self.format.sample_bytes);
        buf.push(self.format.sample_bits);
        buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(payload);
    }
}

/// A decoded datagram borrowing its payload from the receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct Datagram<'a> {
    pub header: BlockHeader,
    pub payload: &'a [u8],
}

impl<'a> Datagram<'a> {
    /// Decodes and validates a datagram.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] when the header is inconsistent with itself
    /// or with the number of bytes received.
    pub fn decode(buf: &'a [u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::Truncated {
                need: HEADER_SIZE,
                have: buf.len(),
            });
        }

        let frame_index = FrameIndex::new(u16::from_le_bytes([buf[0], buf[1]]));
        let block_index = buf[2];
        let block_count = buf[3];
        let format = SampleFormat {
            sample_bytes: buf[4],
            sample_bits: buf[5],
        };
        let payload_len = u16::from_le_bytes([buf[6], buf[7]]);
        let payload = &buf[HEADER_SIZE..];

        if usize::from(payload_len) != payload.len() {
            return Err(WireError::LengthMismatch {
                declared: usize::from(payload_len),
                actual: payload.len(),
            });
        }
        if block_count == 0 || usize::from(block_count) > MAX_BLOCKS_PER_FRAME {
            return Err(WireError::InvalidBlockCount(block_count));
        }
        if block_index >= block_count {
            return Err(WireError::BlockOutOfRange {
                index: block_index,
                count: block_count,
            });
        }
        if payload.len() > BLOCK_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge(payload.len()));
        }

        let header = BlockHeader {
            frame_index,
            block_index,
            block_count,
            format,
            payload_len,
        };
        if !header.is_last() && payload.len() != BLOCK_PAYLOAD_SIZE {
            return Err(WireError::ShortInteriorBlock {
                index: block_index,
                len: payload.len(),
            });
        }

        Ok(Self { header, payload })
    }
}
