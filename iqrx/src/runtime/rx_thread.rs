//! Receive worker runtime.
//!
//! Responsibilities:
//! - Apply control messages from the mailbox in posting order.
//! - Own the UDP socket: bind on start, close on stop, rebind on bind.
//! - Decode datagrams and route them through the frame ring.
//! - Publish completed blocks through the handoff.
//!
//! The worker sleeps only in [`Poll::poll`]. Readiness is edge-triggered, so
//! a batch that stops before the socket is drained re-polls with a zero
//! timeout instead of waiting for a new edge.

use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

use crate::data::{Datagram, MAX_DATAGRAM_SIZE};
use crate::net::{Endpoint, UdpSocket};
use crate::sync::guard::{LifecycleGuard, LifecycleState};
use crate::sync::mailbox::{Envelope, Mailbox};
use crate::trace::{debug, error, info, trace, warn};

use super::commands::ControlMessage;
use super::handoff::{BlockSink, Handoff};
use super::receiver::{BindFailure, ReceiverConfig};
use super::ring::{Admission, FrameRing};
use super::stats::{RxStats, bump};

/// Token of the mailbox waker.
pub(crate) const WAKER_TOKEN: Token = Token(0);
/// Token of the UDP socket.
const SOCKET_TOKEN: Token = Token(1);

/// Receive worker state and event loop.
pub(crate) struct RxThread<S> {
    poll: Poll,
    events: Events,
    mailbox: Arc<Mailbox<ControlMessage>>,
    guard: Arc<LifecycleGuard>,
    /// Bound socket; `Some` exactly while running.
    socket: Option<UdpSocket>,
    bind_address: String,
    port: u16,
    recv_buffer_size: Option<usize>,
    recv_batch: usize,
    ring: FrameRing,
    handoff: Handoff<S>,
    stats: Arc<RxStats>,
    /// One byte larger than the largest valid datagram so oversized ones
    /// fail decoding instead of being silently truncated to a valid length.
    recv_buf: Box<[u8]>,
}

impl<S: BlockSink> RxThread<S> {
    pub(crate) fn new(
        poll: Poll,
        config: &ReceiverConfig,
        mailbox: Arc<Mailbox<ControlMessage>>,
        guard: Arc<LifecycleGuard>,
        ring: FrameRing,
        handoff: Handoff<S>,
        stats: Arc<RxStats>,
    ) -> Self {
        Self {
            poll,
            events: Events::with_capacity(8),
            mailbox,
            guard,
            socket: None,
            bind_address: config.bind_address.clone(),
            port: config.port,
            recv_buffer_size: config.recv_buffer_size,
            recv_batch: config.recv_batch,
            ring,
            handoff,
            stats,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE + 1].into_boxed_slice(),
        }
    }

    /// Runs the worker event loop.
    ///
    /// Returns when a `Shutdown` message is applied or the poller fails.
    pub(crate) fn run(&mut self) {
        let mut backlog = false;
        loop {
            let timeout = backlog.then_some(Duration::ZERO);
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed, receive worker exiting");
                self.close();
                return;
            }

            // Control first (cold path)
            if self.process_commands() {
                return;
            }

            // Datagrams (hot path)
            backlog = self.receive_batch();
        }
    }

    /// Applies every queued control message.
    ///
    /// Returns `true` if shutdown was requested.
    fn process_commands(&mut self) -> bool {
        for Envelope { ticket, message } in self.mailbox.drain() {
            trace!(ticket = %ticket, message = ?message, "applying control message");
            match message {
                ControlMessage::StartStop(true) => {
                    let outcome = self.start();
                    self.guard.complete(ticket, outcome);
                }
                ControlMessage::StartStop(false) => {
                    self.stop();
                    self.guard.complete(ticket, Ok(()));
                }
                ControlMessage::Bind { address, port } => {
                    let outcome = self.rebind(address, port);
                    self.guard.complete(ticket, outcome);
                }
                ControlMessage::Shutdown => {
                    info!("shutdown requested");
                    self.stop();
                    self.guard.complete(ticket, Ok(()));
                    return true;
                }
            }
        }
        false
    }

    fn start(&mut self) -> Result<(), BindFailure> {
        if self.socket.is_some() {
            debug!("start while running ignored");
            return Ok(());
        }
        self.guard.set_state(LifecycleState::Starting, None);
        self.open()
    }

    fn stop(&mut self) {
        let Some(socket) = self.socket.as_ref() else {
            debug!("stop while stopped ignored");
            return;
        };
        let local = socket.local_addr().ok();
        self.guard.set_state(LifecycleState::Stopping, local);
        self.close();
        self.guard.set_state(LifecycleState::Stopped, None);
        info!("receiver stopped");
    }

    fn rebind(&mut self, address: String, port: u16) -> Result<(), BindFailure> {
        self.bind_address = address;
        self.port = port;
        if self.socket.is_none() {
            debug!(address = %self.bind_address, port = port, "bind target recorded");
            return Ok(());
        }
        info!(address = %self.bind_address, port = port, "rebinding");
        self.guard.set_state(LifecycleState::Starting, None);
        self.close();
        self.open()
    }

    /// Binds the current target and publishes the resulting state.
    fn open(&mut self) -> Result<(), BindFailure> {
        match self.bind_socket() {
            Ok(local) => {
                info!(local_addr = %local, "receiver running");
                self.guard.set_state(LifecycleState::Running, Some(local));
                Ok(())
            }
            Err(failure) => {
                warn!(error = %failure, "bind failed, receiver stopped");
                self.guard.set_state(LifecycleState::Stopped, None);
                Err(failure)
            }
        }
    }

    fn bind_socket(&mut self) -> Result<Endpoint, BindFailure> {
        let (address, port) = (self.bind_address.as_str(), self.port);
        let fail = |e: io::Error| BindFailure::new(address, port, e);

        let endpoint = Endpoint::resolve(address, port).map_err(fail)?;
        let mut socket = UdpSocket::bind(endpoint).map_err(fail)?;

        if let Some(size) = self.recv_buffer_size {
            match socket.set_recv_buffer_size(size) {
                Ok(()) => {
                    let _effective = socket.recv_buffer_size().unwrap_or(0);
                    debug!(requested = size, effective = _effective, "receive buffer sized");
                }
                Err(_e) => warn!(requested = size, error = %_e, "failed to size receive buffer"),
            }
        }

        let local = socket.local_addr().map_err(fail)?;
        self.poll
            .registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)
            .map_err(fail)?;

        self.socket = Some(socket);
        Ok(local)
    }

    /// Closes the socket and discards every partial frame.
    fn close(&mut self) {
        if let Some(mut socket) = self.socket.take()
            && let Err(_e) = self.poll.registry().deregister(&mut socket)
        {
            warn!(error = %_e, "failed to deregister socket");
        }
        let _flushed = self.ring.clear();
        debug!(flushed = _flushed, "ring cleared");
    }

    /// Reads up to `recv_batch` datagrams.
    ///
    /// Returns `true` if the socket may still hold data or control is
    /// waiting, so the caller must not block in the next poll.
    fn receive_batch(&mut self) -> bool {
        for _ in 0..self.recv_batch {
            if self.mailbox.has_pending() {
                return true;
            }
            match self.recv_one() {
                Ok(Some(len)) => self.handle_datagram(len),
                Ok(None) => return false,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_e) => {
                    bump(&self.stats.recv_errors);
                    warn!(error = %_e, "receive failed");
                }
            }
        }
        true
    }

    fn recv_one(&mut self) -> io::Result<Option<usize>> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(None);
        };
        Ok(socket.try_recv_from(&mut self.recv_buf)?.map(|(len, _from)| len))
    }

    fn handle_datagram(&mut self, len: usize) {
        bump(&self.stats.datagrams);
        self.stats.bytes.fetch_add(len as u64, Ordering::Relaxed);

        let datagram = match Datagram::decode(&self.recv_buf[..len]) {
            Ok(datagram) => datagram,
            Err(_e) => {
                debug!(len = len, error = %_e, "dropping malformed datagram");
                bump(&self.stats.malformed);
                return;
            }
        };

        if let Admission::Complete(block) = self.ring.admit(&datagram) {
            self.handoff.publish(block);
            self.restock();
        }
    }

    /// Moves blocks the consumer has returned back into the ring.
    fn restock(&mut self) {
        while self.ring.wants_spare()
            && let Some(block) = self.handoff.reclaim()
        {
            self.ring.restock(block);
        }
    }
}

impl<S> Drop for RxThread<S> {
    fn drop(&mut self) {
        let _leftover = self.mailbox.close();
        if !_leftover.is_empty() {
            debug!(count = _leftover.len(), "discarding control messages posted after shutdown");
        }
        self.guard.mark_exited();
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket as StdUdpSocket;
    use std::time::Instant;

    use mio::Waker;

    use super::*;
    use crate::data::{BlockHeader, FrameIndex, SampleFormat};
    use crate::runtime::handoff::{DataQueueConsumer, data_queue};

    struct Harness {
        worker: RxThread<crate::runtime::handoff::DataQueueProducer>,
        mailbox: Arc<Mailbox<ControlMessage>>,
        guard: Arc<LifecycleGuard>,
        stats: Arc<RxStats>,
        blocks: DataQueueConsumer,
    }

    fn harness() -> Harness {
        let config = ReceiverConfig {
            bind_address: "127.0.0.1".into(),
            ..ReceiverConfig::default()
        };
        let poll = Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).unwrap();
        let mailbox = Arc::new(Mailbox::new(waker));
        let guard = Arc::new(LifecycleGuard::new());
        let stats = Arc::new(RxStats::default());
        let (producer, blocks) = data_queue(8);
        let worker = RxThread::new(
            poll,
            &config,
            Arc::clone(&mailbox),
            Arc::clone(&guard),
            FrameRing::new(config.ring_size, Arc::clone(&stats)),
            Handoff::new(producer, Arc::clone(&stats)),
            Arc::clone(&stats),
        );
        Harness {
            worker,
            mailbox,
            guard,
            stats,
            blocks,
        }
    }

    fn single_block(frame: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        BlockHeader {
            frame_index: FrameIndex::new(frame),
            block_index: 0,
            block_count: 1,
            format: SampleFormat::I16,
            payload_len: 0,
        }
        .encode(&[frame as u8; 8], &mut buf);
        buf
    }

    /// Drives the worker by hand until `done` holds.
    fn pump(h: &mut Harness, done: impl Fn(&Harness) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done(h) {
            assert!(Instant::now() < deadline, "worker made no progress");
            h.worker.poll.poll(&mut h.worker.events, Some(Duration::from_millis(10))).unwrap();
            assert!(!h.worker.process_commands());
            h.worker.receive_batch();
        }
    }

    #[test]
    fn start_binds_and_stop_closes() {
        let mut h = harness();
        let start = h.mailbox.post(ControlMessage::StartStop(true)).unwrap();
        pump(&mut h, |h| h.guard.applied() >= start);
        assert_eq!(h.guard.state(), LifecycleState::Running);
        assert!(h.guard.local_addr().is_some());

        let stop = h.mailbox.post(ControlMessage::StartStop(false)).unwrap();
        pump(&mut h, |h| h.guard.applied() >= stop);
        assert_eq!(h.guard.state(), LifecycleState::Stopped);
        assert!(h.worker.socket.is_none());
    }

    #[test]
    fn datagrams_reach_the_queue() {
        let mut h = harness();
        let start = h.mailbox.post(ControlMessage::StartStop(true)).unwrap();
        pump(&mut h, |h| h.guard.applied() >= start);
        let to = h.guard.local_addr().unwrap().as_socket_addr();

        let sender = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        for frame in 0..3 {
            sender.send_to(&single_block(frame), to).unwrap();
        }
        sender.send_to(b"junk", to).unwrap();

        pump(&mut h, |h| h.stats.snapshot().datagrams == 4);
        let frames: Vec<u16> = std::iter::from_fn(|| h.blocks.pop())
            .map(|b| b.frame_index().as_u16())
            .collect();
        assert_eq!(frames, vec![0, 1, 2]);
        assert_eq!(h.stats.snapshot().malformed, 1);
    }

    #[test]
    fn queued_datagrams_are_not_admitted_after_stop() {
        let mut h = harness();
        let start = h.mailbox.post(ControlMessage::StartStop(true)).unwrap();
        pump(&mut h, |h| h.guard.applied() >= start);
        let to = h.guard.local_addr().unwrap().as_socket_addr();

        let sender = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&single_block(0), to).unwrap();
        pump(&mut h, |h| h.stats.snapshot().datagrams == 1);
        assert_eq!(h.blocks.pop().unwrap().frame_index(), FrameIndex::new(0));

        for frame in 1..4 {
            sender.send_to(&single_block(frame), to).unwrap();
        }
        std::thread::sleep(Duration::from_millis(50));
        let stop = h.mailbox.post(ControlMessage::StartStop(false)).unwrap();

        // Pending control preempts the batch before any datagram is read.
        assert!(h.worker.receive_batch());
        assert_eq!(h.stats.snapshot().datagrams, 1);
        assert!(!h.worker.process_commands());
        assert!(h.guard.applied() >= stop);
        assert_eq!(h.guard.state(), LifecycleState::Stopped);

        assert!(!h.worker.receive_batch());
        let stats = h.stats.snapshot();
        assert_eq!(stats.datagrams, 1);
        assert_eq!(stats.published, 1);
        assert!(h.blocks.pop().is_none());
    }

    #[test]
    fn returned_blocks_are_reused() {
        let mut h = harness();
        let start = h.mailbox.post(ControlMessage::StartStop(true)).unwrap();
        pump(&mut h, |h| h.guard.applied() >= start);
        let to = h.guard.local_addr().unwrap().as_socket_addr();
        let sender = StdUdpSocket::bind("127.0.0.1:0").unwrap();

        sender.send_to(&single_block(0), to).unwrap();
        pump(&mut h, |h| h.stats.snapshot().published == 1);
        let block = h.blocks.pop().unwrap();
        h.blocks.recycle(block);

        // Frame 1 completes from a fresh block and takes the returned one back.
        sender.send_to(&single_block(1), to).unwrap();
        pump(&mut h, |h| h.stats.snapshot().published == 2);
        assert_eq!(h.stats.snapshot().recycled, 0);

        sender.send_to(&single_block(2), to).unwrap();
        pump(&mut h, |h| h.stats.snapshot().published == 3);
        assert_eq!(h.stats.snapshot().recycled, 1);
        let frames: Vec<u16> = std::iter::from_fn(|| h.blocks.pop())
            .map(|b| b.frame_index().as_u16())
            .collect();
        assert_eq!(frames, vec![1, 2]);
    }

    #[test]
    fn bind_while_stopped_only_records_target() {
        let mut h = harness();
        let bind = h
            .mailbox
            .post(ControlMessage::Bind {
                address: "127.0.0.1".into(),
                port: 0,
            })
            .unwrap();
        pump(&mut h, |h| h.guard.applied() >= bind);
        assert_eq!(h.guard.state(), LifecycleState::Stopped);
        assert!(h.worker.socket.is_none());
    }

    #[test]
    fn unavailable_address_leaves_receiver_stopped() {
        let mut h = harness();
        h.mailbox
            .post(ControlMessage::Bind {
                address: "192.0.2.1".into(),
                port: 0,
            })
            .unwrap();
        let start = h.mailbox.post(ControlMessage::StartStop(true)).unwrap();
        pump(&mut h, |h| h.guard.applied() >= start);

        assert_eq!(h.guard.state(), LifecycleState::Stopped);
        assert!(matches!(
            h.guard.wait_applied(start, Duration::ZERO),
            Err(crate::runtime::ReceiverError::Bind(_))
        ));
    }

    #[test]
    fn drop_closes_mailbox_and_marks_exit() {
        let h = harness();
        let mailbox = Arc::clone(&h.mailbox);
        let guard = Arc::clone(&h.guard);
        drop(h);
        assert!(guard.has_exited());
        assert!(mailbox.post(ControlMessage::StartStop(true)).is_err());
    }
}
