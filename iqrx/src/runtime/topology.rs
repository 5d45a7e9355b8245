//! Worker placement.
//!
//! Pinning is opt-in through [`ReceiverConfig::rx_core`](super::ReceiverConfig::rx_core).
//! A core that does not exist or that the OS refuses leaves the worker
//! unpinned; reception works either way.

use core_affinity::CoreId;

use crate::trace::{info, warn};

/// Core IDs the current process may run on.
#[must_use]
pub fn available_cores() -> Vec<usize> {
    core_affinity::get_core_ids()
        .map(|ids| ids.into_iter().map(|id| id.id).collect())
        .unwrap_or_default()
}

/// Pins the current thread to `core_id`.
///
/// Returns `true` if pinning succeeded.
pub fn pin_to_core(core_id: usize) -> bool {
    core_affinity::set_for_current(CoreId { id: core_id })
}

/// Pins the receive worker, logging the outcome.
pub(crate) fn pin_worker(core_id: usize) -> bool {
    let cores = available_cores();
    if !cores.contains(&core_id) {
        warn!(core = core_id, available = ?cores, "requested core not available, worker unpinned");
        return false;
    }
    let pinned = pin_to_core(core_id);
    if pinned {
        info!(core = core_id, "receive worker pinned");
    } else {
        warn!(core = core_id, "failed to pin receive worker");
    }
    pinned
}
