//! rtmp-publish: RTMP publishing client
//!
//! This library pushes a live stream to an RTMP server:
//! - Plain RTMP handshake (C0/C1/C2 against S0/S1/S2)
//! - Chunk stream framing with configurable outbound chunk size
//! - AMF0 `connect` command and server reply handling
//! - Congestion-aware sending that drops stale frames at key frames
//! - Bandwidth sampling with an increase/hold/decrease bitrate hint
//!
//! # Example: Publish
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Instant;
//! use bytes::Bytes;
//! use rtmp_publish::{RtmpSession, SessionConfig, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (session, mut status) = RtmpSession::new(Arc::new(TcpTransport::new()), SessionConfig::default())?;
//!     session.detect_byte_rate(|report| println!("{:?}", report.vector));
//!     session.connect("rtmp://localhost/live/test_key").await?;
//!
//!     while let Some(status) = status.recv().await {
//!         if status.ready {
//!             break;
//!         }
//!     }
//!     session.write(Bytes::from_static(b"flv tag"), true, Instant::now());
//!     Ok(())
//! }
//! ```

pub mod amf;
pub mod client;
pub mod error;
pub mod protocol;
pub mod session;
pub mod stats;
pub mod transport;

// Re-export main types for convenience
pub use client::config::{RtmpUrl, SessionConfig};
pub use error::{Error, Result};
pub use session::{RtmpSession, SessionState, SessionStatus};
pub use stats::{BitrateReport, BitrateVector};
pub use transport::{TcpTransport, Transport, TransportEvents, TransportHandler};
