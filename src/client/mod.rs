//! Client-side configuration
//!
//! Everything a caller sets up before handing a URL to
//! [`RtmpSession::connect`](crate::session::RtmpSession::connect).

pub mod config;

pub use config::{RtmpUrl, SessionConfig};
