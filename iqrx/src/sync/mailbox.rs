//! Control mailbox for the receive worker.
//!
//! Any thread may [`post`](Mailbox::post); only the worker
//! [`drain`](Mailbox::drain)s. The mutex is held for the enqueue or the swap
//! and never across socket I/O. Posting wakes the worker's `mio::Poll`
//! through a [`Waker`], so an idle worker notices control traffic without
//! polling on a timer.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use mio::Waker;
use thiserror::Error;

use crate::trace::warn;

/// Position of a message in the mailbox's total order.
///
/// Tickets start at 1 and increase by one per post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

impl Ticket {
    /// Precedes every ticket handed out by a mailbox.
    pub const NONE: Self = Self(0);
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A posted message together with its ticket.
#[derive(Debug)]
pub struct Envelope<M> {
    pub ticket: Ticket,
    pub message: M,
}

/// The worker has exited and no longer reads its mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("mailbox closed")]
pub struct MailboxClosed;

struct State<M> {
    last_ticket: u64,
    pending: VecDeque<Envelope<M>>,
    closed: bool,
}

/// Multi-producer FIFO of control messages.
pub struct Mailbox<M> {
    state: Mutex<State<M>>,
    /// Set while `pending` is non-empty. Read without the lock.
    queued: AtomicBool,
    waker: Waker,
}

impl<M> Mailbox<M> {
    #[must_use]
    pub fn new(waker: Waker) -> Self {
        Self {
            state: Mutex::new(State {
                last_ticket: 0,
                pending: VecDeque::new(),
                closed: false,
            }),
            queued: AtomicBool::new(false),
            waker,
        }
    }

    /// Enqueues `message` and wakes the worker.
    ///
    /// # Errors
    ///
    /// Returns [`MailboxClosed`] once the worker has exited.
    pub fn post(&self, message: M) -> Result<Ticket, MailboxClosed> {
        let ticket = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return Err(MailboxClosed);
            }
            state.last_ticket += 1;
            let ticket = Ticket(state.last_ticket);
            state.pending.push_back(Envelope { ticket, message });
            self.queued.store(true, Ordering::Release);
            ticket
        };

        if let Err(_e) = self.waker.wake() {
            // The message stays queued and is picked up on the next wakeup.
            warn!(ticket = %ticket, error = %_e, "failed to wake receive worker");
        }
        Ok(ticket)
    }

    /// Removes and returns every queued message in posting order.
    #[must_use]
    pub fn drain(&self) -> VecDeque<Envelope<M>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.queued.store(false, Ordering::Release);
        std::mem::take(&mut state.pending)
    }

    /// Whether a message is waiting, without taking the lock.
    ///
    /// The worker checks this between datagrams so that control posted
    /// mid-batch is applied before any later datagram.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    /// Rejects further posts and returns whatever was still queued.
    #[must_use]
    pub fn close(&self) -> VecDeque<Envelope<M>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        self.queued.store(false, Ordering::Release);
        std::mem::take(&mut state.pending)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
