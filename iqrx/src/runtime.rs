//! Receive runtime: the worker thread and the handle that controls it.
//!
//! - `receiver`: [`Receiver`] handle, [`ReceiverConfig`], error types.
//! - `rx_thread`: the worker event loop (socket, mailbox, ring).
//! - `ring`: frame reassembly window.
//! - `handoff`: completed-block sinks and the bundled output queue.
//! - `stats`: shared counters.

mod commands;
pub mod handoff;
pub mod receiver;
pub mod ring;
mod rx_thread;
pub mod stats;
pub mod topology;

pub use commands::{BindRequest, ControlMessage};
pub use handoff::{BlockSink, DataQueueConsumer, DataQueueProducer, Enqueued, data_queue};
pub use receiver::{BindFailure, ConfigError, Receiver, ReceiverConfig, ReceiverError};
pub use ring::{DEFAULT_RING_SIZE, MAX_RING_SIZE};
pub use stats::StatsSnapshot;
