//! Byte-stream transport abstraction
//!
//! The session never touches sockets directly. It drives a [`Transport`]
//! with non-blocking `read`/`write` calls and reacts to the readiness events
//! the transport delivers to its [`TransportHandler`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rtmp_publish::transport::{TcpTransport, TransportEvents, TransportHandler};
//!
//! struct Printer;
//!
//! impl TransportHandler for Printer {
//!     fn on_transport_event(&self, events: TransportEvents) {
//!         println!("{:?}", events);
//!     }
//! }
//!
//! let transport = TcpTransport::new();
//! transport.connect("localhost", 1935, Arc::new(Printer)).await?;
//! ```

#[cfg(test)]
pub(crate) mod mock;
pub mod tcp;

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

pub use tcp::TcpTransport;

/// Set of readiness events; several may be delivered at once
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TransportEvents(u8);

impl TransportEvents {
    pub const CONNECTED: TransportEvents = TransportEvents(0x01);
    pub const READABLE: TransportEvents = TransportEvents(0x02);
    pub const WRITABLE: TransportEvents = TransportEvents(0x04);
    pub const END_OF_STREAM: TransportEvents = TransportEvents(0x08);
    pub const ERROR: TransportEvents = TransportEvents(0x10);

    pub const fn empty() -> Self {
        TransportEvents(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every event in `other` is set
    pub const fn contains(self, other: TransportEvents) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for TransportEvents {
    type Output = TransportEvents;

    fn bitor(self, rhs: TransportEvents) -> TransportEvents {
        TransportEvents(self.0 | rhs.0)
    }
}

impl BitOrAssign for TransportEvents {
    fn bitor_assign(&mut self, rhs: TransportEvents) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TransportEvents, &str); 5] = [
            (TransportEvents::CONNECTED, "CONNECTED"),
            (TransportEvents::READABLE, "READABLE"),
            (TransportEvents::WRITABLE, "WRITABLE"),
            (TransportEvents::END_OF_STREAM, "END_OF_STREAM"),
            (TransportEvents::ERROR, "ERROR"),
        ];

        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(event, _)| self.contains(*event))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "TransportEvents({})", set.join(" | "))
    }
}

/// Receiver of transport readiness events
///
/// Called synchronously from the transport's reactor; implementations must
/// not block.
pub trait TransportHandler: Send + Sync {
    fn on_transport_event(&self, events: TransportEvents);
}

/// Non-blocking byte-stream transport consumed by the session
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection and start delivering events to `handler`
    async fn connect(&self, host: &str, port: u16, handler: Arc<dyn TransportHandler>) -> Result<()>;

    /// Close the connection; no further events are delivered
    fn disconnect(&self);

    /// Read what is available without waiting; `Ok(0)` means nothing right now
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write what the transport accepts without waiting; may be `Ok(0)`
    fn write(&self, buf: &[u8]) -> Result<usize>;
}
