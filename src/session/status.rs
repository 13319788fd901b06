//! Session lifecycle state
//!
//! ```text
//! Unconnected -> Handshaking(progress) -> HandshakeComplete
//!       ^              |                        |
//!       |              +------> Error <---------+
//!     reset            +---> Disconnected <-----+
//! ```

pub use crate::protocol::handshake::HandshakeProgress;

/// Coarse connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No connection attempt in progress
    #[default]
    Unconnected,
    /// Transport connected, handshake steps pending
    Handshaking(HandshakeProgress),
    /// C2 sent; chunked messages may flow
    HandshakeComplete,
    /// Transport or handshake failure
    Error,
    /// Peer closed the connection
    Disconnected,
}

impl SessionState {
    /// Whether a connection attempt is in flight or established
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Handshaking(_) | SessionState::HandshakeComplete)
    }

    /// Whether the state can only be left through `reset` or a new `connect`
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Error | SessionState::Disconnected)
    }
}

/// Full status pushed to the observer on every change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Server accepted `connect`
    pub ready: bool,
    /// First media message queued after `ready`
    pub started: bool,
}

impl SessionStatus {
    pub fn is_handshake_complete(&self) -> bool {
        self.state == SessionState::HandshakeComplete
    }
}
