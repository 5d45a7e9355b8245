//! Sample-block data model and the datagram wire format.

pub mod block;
pub mod wire;

pub use block::{DataBlock, FillState, FrameIndex, SampleFormat, WriteOutcome};
pub use wire::{
    BLOCK_PAYLOAD_SIZE, BlockHeader, Datagram, FRAME_CAPACITY, HEADER_SIZE, MAX_BLOCKS_PER_FRAME,
    MAX_DATAGRAM_SIZE, WireError,
};
