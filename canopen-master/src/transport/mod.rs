//! Transport boundary between the protocol engine and the CAN hardware.
//!
//! The engine never talks to a driver directly; it sends and receives
//! [`Frame`]s through the [`CanTransport`] trait so that the same core
//! runs over SocketCAN, the in-memory loopback bus, or any future
//! adapter.

use std::error::Error;
use std::fmt;

use canopen_common::Frame;

pub mod loopback;
pub mod socketcan;

pub use self::loopback::{LoopbackBus, LoopbackTransport};
pub use self::socketcan::SocketCanTransport;

/// Failures at the driver boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The bus could not be opened.
    Open(String),
    /// A frame could not be transmitted.
    Send(String),
    /// Receiving failed for a reason other than "nothing pending".
    Receive(String),
    /// The transport has been closed.
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open(msg) => write!(f, "failed to open CAN bus: {}", msg),
            Self::Send(msg) => write!(f, "failed to send frame: {}", msg),
            Self::Receive(msg) => write!(f, "failed to receive frame: {}", msg),
            Self::Closed => write!(f, "transport is closed"),
        }
    }
}

impl Error for TransportError {}

/// A bidirectional CAN endpoint.
///
/// `try_recv` must not block: the engine's reader polls it and sleeps
/// briefly when the bus is idle. Frames the transport cannot represent
/// (extended ids, remote frames) are skipped, not errors.
pub trait CanTransport: Send {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;

    fn try_recv(&mut self) -> Result<Option<Frame>, TransportError>;

    fn close(&mut self) {}
}
