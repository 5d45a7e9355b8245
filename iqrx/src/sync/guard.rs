//! Lifecycle guard: lets control callers wait for the worker to confirm a
//! transition.
//!
//! The worker publishes its [`LifecycleState`] here and records, per control
//! ticket, that the message has been applied and whether it failed. A caller
//! that posted ticket `t` blocks on the condition variable until the worker
//! has applied `t`, the worker exits, or the caller's timeout elapses. This
//! is the only place a caller thread ever blocks on the receiver.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::net::Endpoint;
use crate::runtime::receiver::{BindFailure, ReceiverError};

use super::mailbox::Ticket;

/// Failures kept for late waiters. Older entries are forgotten.
const REMEMBERED_FAILURES: usize = 32;

/// Receiver lifecycle.
///
/// `Stopped → Starting → Running → Stopping → Stopped`. A rebind while
/// running passes through `Starting` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

struct GuardState {
    state: LifecycleState,
    local_addr: Option<Endpoint>,
    applied: Ticket,
    failures: VecDeque<(Ticket, BindFailure)>,
    /// Highest ticket whose failure was evicted from `failures`. Outcomes at
    /// or below it are unknown unless still listed.
    forgotten: Ticket,
    exited: bool,
}

/// Mutex + condition variable pair shared by the worker and its callers.
pub struct LifecycleGuard {
    inner: Mutex<GuardState>,
    changed: Condvar,
}

impl LifecycleGuard {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GuardState {
                state: LifecycleState::Stopped,
                local_addr: None,
                applied: Ticket::NONE,
                failures: VecDeque::new(),
                forgotten: Ticket::NONE,
                exited: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    /// Address the socket is bound to while running.
    #[must_use]
    pub fn local_addr(&self) -> Option<Endpoint> {
        self.lock().local_addr
    }

    /// Last ticket the worker finished applying.
    #[must_use]
    pub fn applied(&self) -> Ticket {
        self.lock().applied
    }

    /// Whether the worker thread has exited.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.lock().exited
    }

    pub(crate) fn set_state(&self, state: LifecycleState, local_addr: Option<Endpoint>) {
        let mut inner = self.lock();
        inner.state = state;
        inner.local_addr = local_addr;
        drop(inner);
        self.changed.notify_all();
    }

    /// Records that `ticket` has been applied, with its outcome.
    pub(crate) fn complete(&self, ticket: Ticket, outcome: Result<(), BindFailure>) {
        let mut inner = self.lock();
        if ticket > inner.applied {
            inner.applied = ticket;
        }
        if let Err(failure) = outcome {
            if inner.failures.len() == REMEMBERED_FAILURES
                && let Some((evicted, _)) = inner.failures.pop_front()
                && evicted > inner.forgotten
            {
                inner.forgotten = evicted;
            }
            inner.failures.push_back((ticket, failure));
        }
        drop(inner);
        self.changed.notify_all();
    }

    pub(crate) fn mark_exited(&self) {
        let mut inner = self.lock();
        inner.exited = true;
        inner.state = LifecycleState::Stopped;
        inner.local_addr = None;
        drop(inner);
        self.changed.notify_all();
    }

    /// Blocks until `ticket` has been applied.
    ///
    /// # Errors
    ///
    /// - [`ReceiverError::Bind`] if applying the ticket failed to bind.
    /// - [`ReceiverError::OutcomeLost`] if the ticket was applied so long ago
    ///   that its outcome may have been evicted.
    /// - [`ReceiverError::Shutdown`] if the worker exited first.
    /// - [`ReceiverError::Timeout`] if `timeout` elapsed first.
    pub fn wait_applied(&self, ticket: Ticket, timeout: Duration) -> Result<(), ReceiverError> {
        let (inner, _) = self
            .changed
            .wait_timeout_while(self.lock(), timeout, |s| s.applied < ticket && !s.exited)
            .unwrap_or_else(PoisonError::into_inner);

        if inner.applied >= ticket {
            return match inner.failures.iter().find(|(t, _)| *t == ticket) {
                Some((_, failure)) => Err(ReceiverError::Bind(failure.clone())),
                None if ticket <= inner.forgotten => Err(ReceiverError::OutcomeLost { ticket }),
                None => Ok(()),
            };
        }
        if inner.exited {
            return Err(ReceiverError::Shutdown);
        }
        Err(ReceiverError::Timeout { ticket, timeout })
    }
}

impl Default for LifecycleGuard {
    fn default() -> Self {
        Self::new()
    }
}
