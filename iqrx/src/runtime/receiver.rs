//! Receiver handle: spawns the receive worker and drives its lifecycle.
//!
//! # Example
//!
//! ```no_run
//! use iqrx::runtime::{Receiver, ReceiverConfig};
//! use iqrx::sync::spsc::Timeout;
//!
//! let config = ReceiverConfig {
//!     port: 5000,
//!     ..ReceiverConfig::default()
//! };
//! let (receiver, blocks) = Receiver::spawn_with_queue(config)?;
//! receiver.start()?;
//!
//! while let Some(block) = blocks.pop_blocking(Timeout::Duration(std::time::Duration::from_secs(1))) {
//!     println!("frame {} with {} samples", block.frame_index(), block.sample_count());
//! }
//!
//! receiver.shutdown();
//! # Ok::<(), iqrx::runtime::ReceiverError>(())
//! ```

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::{Poll, Waker};
use thiserror::Error;

use crate::net::Endpoint;
use crate::sync::guard::{LifecycleGuard, LifecycleState};
use crate::sync::mailbox::{Mailbox, MailboxClosed, Ticket};
use crate::trace::{debug, error, info};

use super::commands::{BindRequest, ControlMessage};
use super::handoff::{BlockSink, DataQueueConsumer, Handoff, data_queue};
use super::ring::{DEFAULT_RING_SIZE, FrameRing, MAX_RING_SIZE};
use super::rx_thread::{RxThread, WAKER_TOKEN};
use super::stats::{RxStats, StatsSnapshot};
use super::topology;

/// Configuration for a [`Receiver`].
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Address to bind on start. An IP literal or a resolvable host name.
    pub bind_address: String,
    /// UDP port to bind on start. `0` picks an ephemeral port.
    pub port: u16,
    /// Number of frames in flight. Power of two, at most 16384.
    pub ring_size: usize,
    /// Datagrams read per wakeup before control is checked again.
    pub recv_batch: usize,
    /// Kernel receive buffer (`SO_RCVBUF`); `None` keeps the OS default.
    pub recv_buffer_size: Option<usize>,
    /// Upper bound on how long `start`/`stop`/`bind` wait for the worker.
    pub transition_timeout: Duration,
    /// Core to pin the worker to.
    pub rx_core: Option<usize>,
    /// Capacity of the bundled output queue.
    pub queue_capacity: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 0,
            ring_size: DEFAULT_RING_SIZE,
            recv_batch: 64,
            recv_buffer_size: None,
            transition_timeout: Duration::from_secs(2),
            rx_core: None,
            queue_capacity: 64,
        }
    }
}

impl ReceiverConfig {
    /// Checks the values a worker cannot run with.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.ring_size.is_power_of_two() || self.ring_size > MAX_RING_SIZE {
            return Err(ConfigError::RingSize(self.ring_size));
        }
        if self.recv_batch == 0 {
            return Err(ConfigError::ZeroBatch);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        Ok(())
    }
}

/// Invalid [`ReceiverConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("ring size {0} is not a power of two between 1 and 16384")]
    RingSize(usize),
    #[error("receive batch must be at least 1")]
    ZeroBatch,
    #[error("queue capacity must be at least 1")]
    ZeroQueueCapacity,
}

/// The socket could not be bound, configured, or registered.
///
/// The receiver is left [`Stopped`](LifecycleState::Stopped).
#[derive(Debug, Clone, Error)]
#[error("failed to bind {address}:{port}: {source}")]
pub struct BindFailure {
    pub address: String,
    pub port: u16,
    #[source]
    source: Arc<io::Error>,
}

impl BindFailure {
    pub fn new(address: impl Into<String>, port: u16, source: io::Error) -> Self {
        Self {
            address: address.into(),
            port,
            source: Arc::new(source),
        }
    }

    #[must_use]
    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}

/// Errors returned by the [`Receiver`] handle.
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error(transparent)]
    Bind(#[from] BindFailure),
    /// The worker did not confirm the message in time. It may still apply
    /// it later.
    #[error("control message {ticket} not confirmed within {timeout:?}")]
    Timeout { ticket: Ticket, timeout: Duration },
    /// The message was applied, but its outcome was dropped from the
    /// guard's bounded failure history before this wait.
    #[error("outcome of control message {ticket} is no longer known")]
    OutcomeLost { ticket: Ticket },
    #[error("receive worker has shut down")]
    Shutdown,
    #[error("failed to spawn receive worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to create poller: {0}")]
    Poll(#[source] io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl From<MailboxClosed> for ReceiverError {
    fn from(_: MailboxClosed) -> Self {
        Self::Shutdown
    }
}

/// Handle to a running receive worker.
///
/// Dropping the handle signals shutdown but does not wait for the worker.
/// Use [`Receiver::shutdown`] to join it.
pub struct Receiver {
    mailbox: Arc<Mailbox<ControlMessage>>,
    guard: Arc<LifecycleGuard>,
    stats: Arc<RxStats>,
    transition_timeout: Duration,
    handle: Option<JoinHandle<()>>,
}

impl Receiver {
    /// Spawns a stopped worker that publishes completed blocks to `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, or if the poller
    /// or the worker thread cannot be created.
    pub fn spawn<S: BlockSink>(config: ReceiverConfig, sink: S) -> Result<Self, ReceiverError> {
        config.validate()?;
        info!(
            bind_address = %config.bind_address,
            port = config.port,
            ring_size = config.ring_size,
            recv_batch = config.recv_batch,
            recv_buffer_size = ?config.recv_buffer_size,
            rx_core = ?config.rx_core,
            "receiver spawning"
        );

        let poll = Poll::new().map_err(ReceiverError::Poll)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(ReceiverError::Poll)?;
        let mailbox = Arc::new(Mailbox::new(waker));
        let guard = Arc::new(LifecycleGuard::new());
        let stats = Arc::new(RxStats::default());

        let worker = RxThread::new(
            poll,
            &config,
            Arc::clone(&mailbox),
            Arc::clone(&guard),
            FrameRing::new(config.ring_size, Arc::clone(&stats)),
            Handoff::new(sink, Arc::clone(&stats)),
            Arc::clone(&stats),
        );

        let rx_core = config.rx_core;
        debug!("spawning receive worker");
        let handle = thread::Builder::new()
            .name("iqrx-rx".into())
            .spawn(move || {
                if let Some(core) = rx_core {
                    topology::pin_worker(core);
                }
                info!("receive worker started");
                let mut worker = worker;
                worker.run();
                info!("receive worker exiting");
            })
            .map_err(|e| {
                error!(error = %e, "failed to spawn receive worker");
                ReceiverError::Spawn(e)
            })?;

        Ok(Self {
            mailbox,
            guard,
            stats,
            transition_timeout: config.transition_timeout,
            handle: Some(handle),
        })
    }

    /// Spawns a worker feeding the bundled drop-newest queue of
    /// `config.queue_capacity` blocks and returns its read end.
    ///
    /// # Errors
    ///
    /// Same as [`Receiver::spawn`].
    pub fn spawn_with_queue(
        config: ReceiverConfig,
    ) -> Result<(Self, DataQueueConsumer), ReceiverError> {
        config.validate()?;
        let (producer, consumer) = data_queue(config.queue_capacity);
        let receiver = Self::spawn(config, producer)?;
        Ok((receiver, consumer))
    }

    /// Requests start (`true`) or stop (`false`) without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Shutdown`] if the worker has exited.
    pub fn post_start_stop(&self, start: bool) -> Result<Ticket, ReceiverError> {
        let ticket = self.mailbox.post(ControlMessage::StartStop(start))?;
        debug!(ticket = %ticket, start = start, "posted start/stop");
        Ok(ticket)
    }

    /// Requests a new binding without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Shutdown`] if the worker has exited.
    pub fn post_bind(&self, address: impl Into<String>, port: u16) -> Result<Ticket, ReceiverError> {
        let address = address.into();
        debug!(address = %address, port = port, "posting bind");
        Ok(self.mailbox.post(ControlMessage::Bind { address, port })?)
    }

    /// [`post_bind`](Self::post_bind) for a request from a control layer.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Shutdown`] if the worker has exited.
    pub fn post_bind_request(&self, request: BindRequest) -> Result<Ticket, ReceiverError> {
        Ok(self.mailbox.post(ControlMessage::from(request))?)
    }

    /// Blocks until the worker has applied `ticket`.
    ///
    /// # Errors
    ///
    /// See [`LifecycleGuard::wait_applied`].
    pub fn wait(&self, ticket: Ticket) -> Result<(), ReceiverError> {
        self.guard.wait_applied(ticket, self.transition_timeout)
    }

    /// Starts reception and waits until the socket is bound.
    ///
    /// A no-op if already running.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Bind`] if binding failed, or
    /// [`ReceiverError::Timeout`] / [`ReceiverError::Shutdown`].
    pub fn start(&self) -> Result<(), ReceiverError> {
        let ticket = self.post_start_stop(true)?;
        self.wait(ticket)
    }

    /// Stops reception and waits until the socket is closed and every
    /// partial frame discarded. No datagram is admitted after this returns.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Timeout`] or [`ReceiverError::Shutdown`].
    pub fn stop(&self) -> Result<(), ReceiverError> {
        let ticket = self.post_start_stop(false)?;
        self.wait(ticket)
    }

    /// Retargets the socket and waits for the worker to apply it.
    ///
    /// While running this rebinds immediately and discards partial frames;
    /// while stopped the target is used by the next [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Bind`] if rebinding failed (the receiver is
    /// then stopped), or [`ReceiverError::Timeout`] /
    /// [`ReceiverError::Shutdown`].
    pub fn bind(&self, address: impl Into<String>, port: u16) -> Result<(), ReceiverError> {
        let ticket = self.post_bind(address, port)?;
        self.wait(ticket)
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.guard.state()
    }

    /// Bound address while running.
    #[must_use]
    pub fn local_addr(&self) -> Option<Endpoint> {
        self.guard.local_addr()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stops the worker and waits for its thread to exit.
    pub fn shutdown(mut self) {
        info!("receiver shutdown initiated");
        let _ = self.mailbox.post(ControlMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            debug!("waiting for receive worker to exit");
            if handle.join().is_err() {
                error!("receive worker panicked");
            }
        }
        info!("receiver shutdown complete");
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.mailbox.post(ControlMessage::Shutdown);
        }
    }
}
