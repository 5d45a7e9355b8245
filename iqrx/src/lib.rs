//! UDP receiver that reassembles fragmented I/Q sample frames.
//!
//! A sender splits each frame into numbered blocks of at most
//! [`BLOCK_PAYLOAD_SIZE`](data::BLOCK_PAYLOAD_SIZE) bytes and sends one
//! block per datagram. The [`Receiver`](runtime::Receiver) runs a single
//! worker thread that reads the socket, places blocks into a small ring of
//! in-flight frames, and hands each completed frame to a consumer queue.
//! Late, duplicated, and reordered datagrams are tolerated; frames that fall
//! out of the window are abandoned.

pub mod data;
pub mod net;
pub mod runtime;
pub mod sync;
mod trace;

pub use trace::init_tracing;
