//! Session configuration and RTMP URL parsing

use std::time::Duration;

use crate::error::{Error, ProtocolError, Result};
use crate::protocol::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_FLASH_VER, DEFAULT_RING_BUFFER_SIZE, HANDSHAKE_SIZE,
    MAX_CHUNK_SIZE, RTMP_PORT, RTMP_SCHEME,
};

/// Publishing session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Queued bytes at which stale frames start being dropped
    pub max_congestion_bytes: usize,

    /// How long the writer waits for a writable event after a zero-byte write
    pub write_retry_timeout: Duration,

    /// Outbound chunk size, announced after the handshake if not 128
    pub chunk_size: u32,

    /// Inbound staging buffer size; must hold a whole handshake packet
    pub ring_buffer_capacity: usize,

    /// Bandwidth sampler cadence
    pub sample_interval: Duration,

    /// Fail the connection when S0 is not version 3
    pub strict_handshake: bool,

    /// Fail the connection when S2 does not echo C1
    pub verify_handshake_echo: bool,

    /// Flash version string sent in `connect`
    pub flash_ver: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_congestion_bytes: 10 * 1024 * 1024, // 10MB
            write_retry_timeout: Duration::from_secs(1),
            chunk_size: DEFAULT_CHUNK_SIZE,
            ring_buffer_capacity: DEFAULT_RING_BUFFER_SIZE,
            sample_interval: Duration::from_secs(2),
            strict_handshake: true,
            verify_handshake_echo: false,
            flash_ver: DEFAULT_FLASH_VER.to_string(),
        }
    }
}

impl SessionConfig {
    /// Create a new session config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the congestion ceiling
    pub fn max_congestion_bytes(mut self, bytes: usize) -> Self {
        self.max_congestion_bytes = bytes;
        self
    }

    /// Set the writer's retry timeout
    pub fn write_retry_timeout(mut self, timeout: Duration) -> Self {
        self.write_retry_timeout = timeout;
        self
    }

    /// Set the outbound chunk size
    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size;
        self
    }

    /// Set the inbound ring buffer capacity
    pub fn ring_buffer_capacity(mut self, capacity: usize) -> Self {
        self.ring_buffer_capacity = capacity;
        self
    }

    /// Set the bandwidth sampling interval
    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Fail or continue on a bad S0 version
    pub fn strict_handshake(mut self, strict: bool) -> Self {
        self.strict_handshake = strict;
        self
    }

    /// Check that S2 echoes C1
    pub fn verify_handshake_echo(mut self, verify: bool) -> Self {
        self.verify_handshake_echo = verify;
        self
    }

    /// Set the Flash version string
    pub fn flash_ver(mut self, flash_ver: impl Into<String>) -> Self {
        self.flash_ver = flash_ver.into();
        self
    }

    /// Reject values the session cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Config(format!("chunk size {} out of range", self.chunk_size)));
        }
        if self.ring_buffer_capacity < HANDSHAKE_SIZE {
            return Err(Error::Config(format!(
                "ring buffer capacity {} cannot hold a {}-byte handshake packet",
                self.ring_buffer_capacity, HANDSHAKE_SIZE
            )));
        }
        if self.sample_interval.is_zero() {
            return Err(Error::Config("sample interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Parsed `rtmp://host[:port]/app[/playpath]` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpUrl {
    pub host: String,
    pub port: u16,
    pub app: String,
    /// Everything after the app segment, e.g. `123/extra`
    pub play_path: Option<String>,
}

impl RtmpUrl {
    /// Parse URL into components
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| ProtocolError::InvalidUrl(url.to_string()))?;
        if !scheme.eq_ignore_ascii_case(RTMP_SCHEME) {
            return Err(ProtocolError::UnsupportedScheme(scheme.to_string()).into());
        }

        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| ProtocolError::InvalidUrl(url.to_string()))?;
                (h, port)
            }
            None => (authority, RTMP_PORT),
        };
        if host.is_empty() {
            return Err(ProtocolError::InvalidUrl(url.to_string()).into());
        }

        let (app, play_path) = match path.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (path, None),
        };
        if app.is_empty() {
            return Err(ProtocolError::InvalidUrl(url.to_string()).into());
        }

        Ok(RtmpUrl {
            host: host.to_string(),
            port,
            app: app.to_string(),
            play_path: play_path.filter(|p| !p.is_empty()).map(str::to_string),
        })
    }

    /// `tcUrl` value for the connect command
    pub fn tc_url(&self) -> String {
        format!("{}://{}:{}/{}", RTMP_SCHEME, self.host, self.port, self.app)
    }
}
