//! RTMP protocol constants
//!
//! Reference: Adobe RTMP Specification (December 2012)

/// RTMP version number (always 3 for standard RTMP)
pub const RTMP_VERSION: u8 = 3;

/// URL scheme accepted by the client
pub const RTMP_SCHEME: &str = "rtmp";

/// Default RTMP port
pub const RTMP_PORT: u16 = 1935;

/// Handshake packet size (C1/C2/S1/S2)
pub const HANDSHAKE_SIZE: usize = 1536;

/// Time + zero fields at the start of C1
pub const HANDSHAKE_HEADER_SIZE: usize = 8;

/// Default chunk size (per RTMP spec)
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Maximum chunk size allowed
pub const MAX_CHUNK_SIZE: u32 = 0xFFFFFF;

/// Maximum message size (sanity limit)
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024; // 16MB

/// Largest message length the 3-byte header field can carry
pub const MAX_MESSAGE_LENGTH: u32 = 0xFFFFFF;

/// Extended timestamp threshold
/// Timestamps >= this value require extended timestamp field
pub const EXTENDED_TIMESTAMP_THRESHOLD: u32 = 0xFFFFFF;

/// Default inbound staging buffer size
pub const DEFAULT_RING_BUFFER_SIZE: usize = 4096;

// ============================================================================
// Chunk Stream IDs (CSID)
// RTMP spec section 5.3.1.1
// ============================================================================

/// Protocol control messages (Set Chunk Size, Abort, etc.)
pub const CSID_PROTOCOL_CONTROL: u32 = 2;

/// Command messages (connect, createStream, etc.)
pub const CSID_COMMAND: u32 = 3;

/// Audio data
pub const CSID_AUDIO: u32 = 4;

/// Video data
pub const CSID_VIDEO: u32 = 6;

// ============================================================================
// Message Type IDs
// RTMP spec section 5.4
// ============================================================================

/// Set Chunk Size (1) - protocol control
pub const MSG_SET_CHUNK_SIZE: u8 = 1;

/// Abort Message (2) - protocol control
pub const MSG_ABORT: u8 = 2;

/// Acknowledgement (3) - protocol control
pub const MSG_ACKNOWLEDGEMENT: u8 = 3;

/// Window Acknowledgement Size (5) - protocol control
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;

/// Set Peer Bandwidth (6) - protocol control
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;

/// Audio Message (8)
pub const MSG_AUDIO: u8 = 8;

/// Video Message (9)
pub const MSG_VIDEO: u8 = 9;

/// AMF0 Command Message (20) - connect, publish, etc.
pub const MSG_COMMAND_AMF0: u8 = 20;

// ============================================================================
// Command names and codes
// ============================================================================

pub const CMD_CONNECT: &str = "connect";
pub const CMD_RESULT: &str = "_result";
pub const CMD_ERROR: &str = "_error";
pub const CMD_ON_STATUS: &str = "onStatus";

/// Transaction ID used for the connect command
pub const CONNECT_TRANSACTION_ID: f64 = 1.0;

pub const NC_CONNECT_SUCCESS: &str = "NetConnection.Connect.Success";

/// Default Flash version string sent in `connect`
pub const DEFAULT_FLASH_VER: &str = "FMLE/3.0 (compatible; FMSc/1.0)";

// Capability bitmasks advertised in `connect`
pub const CONNECT_AUDIO_CODECS: f64 = 10.0;
pub const CONNECT_VIDEO_CODECS: f64 = 7.0;
pub const CONNECT_VIDEO_FUNCTION: f64 = 1.0;

// ============================================================================
// Chunk Header Format Types (fmt field)
// RTMP spec section 5.3.1.2
// ============================================================================

/// Type 0: Full header (11 bytes) - timestamp, length, type, stream ID
pub const CHUNK_FMT_0: u8 = 0;

/// Type 1: No stream ID (7 bytes) - timestamp delta, length, type
pub const CHUNK_FMT_1: u8 = 1;

/// Type 2: No stream ID, length, type (3 bytes) - timestamp delta only
pub const CHUNK_FMT_2: u8 = 2;

/// Type 3: No header (0 bytes) - use previous chunk's values
pub const CHUNK_FMT_3: u8 = 3;
