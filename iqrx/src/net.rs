//! Network primitives for the receive worker.
//!
//! A mio-backed UDP socket plus the endpoint type used for bind targets.

pub mod endpoint;
pub mod socket;

pub use endpoint::Endpoint;
pub use socket::UdpSocket;
