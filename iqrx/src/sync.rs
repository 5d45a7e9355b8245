//! Synchronization primitives shared between the receive worker and the
//! threads that control it or consume its output.
//!
//! - [`spsc`]: bounded lock-free queue carrying completed blocks downstream.
//! - [`mailbox`]: FIFO control mailbox that wakes the worker's poller.
//! - [`guard`]: lifecycle guard callers block on while a transition runs.

pub mod guard;
pub mod mailbox;
pub mod spsc;
