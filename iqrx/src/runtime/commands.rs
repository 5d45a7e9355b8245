//! Control messages carried by the receiver mailbox.
//!
//! These never travel on the wire. Callers post them through the
//! [`Receiver`](super::Receiver) handle; the worker applies them in posting
//! order before touching the next datagram.

use serde::Deserialize;

/// A control-plane message for the receive worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Retarget the socket. Rebinds immediately when running; otherwise the
    /// target is recorded for the next start.
    Bind { address: String, port: u16 },
    /// `true` starts reception, `false` stops it.
    StartStop(bool),
    /// Terminates the worker. Posted by the handle on shutdown or drop.
    Shutdown,
}

/// A bind request as produced by an external control layer.
///
/// ```
/// use iqrx::runtime::BindRequest;
///
/// let request: BindRequest = serde_json::from_str(r#"{"address":"127.0.0.1","port":5000}"#).unwrap();
/// assert_eq!(request.port, 5000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BindRequest {
    pub address: String,
    pub port: u16,
}

impl From<BindRequest> for ControlMessage {
    fn from(request: BindRequest) -> Self {
        Self::Bind {
            address: request.address,
            port: request.port,
        }
    }
}
