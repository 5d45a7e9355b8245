//! Receiver counters.
//!
//! Written by the worker with relaxed atomics and read from any thread. Every
//! routine discard on the datagram path is counted here rather than logged
//! per packet.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters shared between the worker and the receiver handle.
#[derive(Debug, Default)]
pub struct RxStats {
    pub(crate) datagrams: AtomicU64,
    pub(crate) bytes: AtomicU64,
    pub(crate) malformed: AtomicU64,
    pub(crate) stale: AtomicU64,
    pub(crate) duplicates: AtomicU64,
    pub(crate) inconsistent: AtomicU64,
    pub(crate) abandoned: AtomicU64,
    pub(crate) flushed: AtomicU64,
    pub(crate) published: AtomicU64,
    pub(crate) overflow: AtomicU64,
    pub(crate) recycled: AtomicU64,
    pub(crate) recv_errors: AtomicU64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RxStats {
    /// Copies the counters. Individual values are consistent, the set is not
    /// an atomic snapshot.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            datagrams: get(&self.datagrams),
            bytes: get(&self.bytes),
            malformed: get(&self.malformed),
            stale: get(&self.stale),
            duplicates: get(&self.duplicates),
            inconsistent: get(&self.inconsistent),
            abandoned: get(&self.abandoned),
            flushed: get(&self.flushed),
            published: get(&self.published),
            overflow: get(&self.overflow),
            recycled: get(&self.recycled),
            recv_errors: get(&self.recv_errors),
        }
    }
}

/// Point-in-time copy of [`RxStats`], serializable for a control API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Datagrams read from the socket.
    pub datagrams: u64,
    /// Bytes read from the socket.
    pub bytes: u64,
    /// Datagrams rejected by the wire decoder.
    pub malformed: u64,
    /// Datagrams for frames that already left the window.
    pub stale: u64,
    /// Blocks received more than once.
    pub duplicates: u64,
    /// Datagrams disagreeing with their frame's block count or format.
    pub inconsistent: u64,
    /// Partial frames evicted by a newer frame in the same slot.
    pub abandoned: u64,
    /// Partial frames discarded by stop or rebind.
    pub flushed: u64,
    /// Frames handed to the output queue.
    pub published: u64,
    /// Completed frames dropped because the output queue was full.
    pub overflow: u64,
    /// Slots re-armed with a returned block instead of a fresh allocation.
    pub recycled: u64,
    /// Socket read errors other than `WouldBlock`.
    pub recv_errors: u64,
}
