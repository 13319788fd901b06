//! Statistics and bitrate adaptation
//!
//! Provides observability into what the session actually manages to send.

pub mod bandwidth;

pub use bandwidth::{BandwidthSampler, BitrateReport, BitrateVector};
