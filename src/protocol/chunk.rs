//! RTMP chunk stream codec
//!
//! RTMP messages are split into chunks for multiplexing. Each chunk has a header
//! that identifies the chunk stream and message being sent.
//!
//! ```text
//! Chunk Format:
//! +-------------+----------------+-------------------+
//! | Basic Header| Message Header | Chunk Data        |
//! | (1-3 bytes) | (0,3,7,11 bytes)| (variable)       |
//! +-------------+----------------+-------------------+
//!
//! Basic Header formats:
//! - 1 byte:  fmt(2) + csid(6)        for csid 2-63
//! - 2 bytes: fmt(2) + 0 + csid(8)    for csid 64-319
//! - 3 bytes: fmt(2) + 1 + csid(16)   for csid 64-65599
//!
//! Message Header formats (based on fmt):
//! - Type 0 (11 bytes): timestamp(3) + length(3) + type(1) + stream_id(4, LE)
//! - Type 1 (7 bytes):  timestamp_delta(3) + length(3) + type(1)
//! - Type 2 (3 bytes):  timestamp_delta(3)
//! - Type 3 (0 bytes):  (use previous chunk's values)
//!
//! Extended timestamp (4 bytes) is appended when timestamp >= 0xFFFFFF
//! ```
//!
//! Reference: RTMP Specification Section 5.3

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;

/// A complete RTMP message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Chunk stream the message travels on
    pub csid: u32,
    /// Message timestamp (milliseconds)
    pub timestamp: u32,
    /// Message type ID
    pub type_id: u8,
    /// Message stream ID
    pub stream_id: u32,
    /// Message payload
    pub payload: Bytes,
}

impl Message {
    pub fn new(csid: u32, timestamp: u32, type_id: u8, stream_id: u32, payload: Bytes) -> Self {
        Self {
            csid,
            timestamp,
            type_id,
            stream_id,
            payload,
        }
    }

    /// Whether the message carries audio or video data
    pub fn is_media(&self) -> bool {
        self.type_id == MSG_AUDIO || self.type_id == MSG_VIDEO
    }
}

/// Chunk header format (the `fmt` field of the basic header)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    /// Type 0: every field present
    Full,
    /// Type 1: same message stream, timestamp delta + length + type
    SameStream,
    /// Type 2: only the timestamp delta changes
    TimestampDelta,
    /// Type 3: repeat the previous header
    Continuation,
}

impl ChunkType {
    pub fn fmt(self) -> u8 {
        match self {
            ChunkType::Full => CHUNK_FMT_0,
            ChunkType::SameStream => CHUNK_FMT_1,
            ChunkType::TimestampDelta => CHUNK_FMT_2,
            ChunkType::Continuation => CHUNK_FMT_3,
        }
    }

    fn from_fmt(fmt: u8) -> Self {
        match fmt & 0x03 {
            CHUNK_FMT_0 => ChunkType::Full,
            CHUNK_FMT_1 => ChunkType::SameStream,
            CHUNK_FMT_2 => ChunkType::TimestampDelta,
            _ => ChunkType::Continuation,
        }
    }

    /// Size of the message header following the basic header
    fn message_header_len(self) -> usize {
        match self {
            ChunkType::Full => 11,
            ChunkType::SameStream => 7,
            ChunkType::TimestampDelta => 3,
            ChunkType::Continuation => 0,
        }
    }
}

/// Header of a single outbound chunk
///
/// `timestamp` is absolute for [`ChunkType::Full`] and a delta otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_type: ChunkType,
    pub csid: u32,
    pub timestamp: u32,
    pub message_length: u32,
    pub message_type_id: u8,
    pub message_stream_id: u32,
}

impl ChunkHeader {
    /// Whether the timestamp needs the 4-byte extended field
    pub fn has_extended_timestamp(&self) -> bool {
        self.timestamp >= EXTENDED_TIMESTAMP_THRESHOLD
    }

    /// Serialize basic header, message header and extended timestamp
    pub fn write(&self, buf: &mut BytesMut) {
        write_basic_header(self.csid, self.chunk_type.fmt(), buf);

        let timestamp_field = self.timestamp.min(EXTENDED_TIMESTAMP_THRESHOLD);
        match self.chunk_type {
            ChunkType::Full => {
                write_u24(timestamp_field, buf);
                write_u24(self.message_length, buf);
                buf.put_u8(self.message_type_id);
                // Stream ID is little-endian!
                buf.put_u32_le(self.message_stream_id);
            }
            ChunkType::SameStream => {
                write_u24(timestamp_field, buf);
                write_u24(self.message_length, buf);
                buf.put_u8(self.message_type_id);
            }
            ChunkType::TimestampDelta => {
                write_u24(timestamp_field, buf);
            }
            ChunkType::Continuation => {}
        }

        if self.has_extended_timestamp() {
            buf.put_u32(self.timestamp);
        }
    }
}

/// What the encoder remembers about the last message on a chunk stream
#[derive(Debug, Clone, Copy)]
struct OutboundStreamState {
    timestamp: u32,
    stream_id: u32,
}

/// Chunk stream encoder
///
/// Encodes messages into chunks for transmission.
pub struct ChunkEncoder {
    /// Outgoing chunk size
    chunk_size: u32,
    /// Per-chunk-stream state for header compression
    streams: HashMap<u32, OutboundStreamState>,
}

impl ChunkEncoder {
    /// Create a new encoder with default chunk size
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
        }
    }

    /// Set the chunk size (announce it with a SetChunkSize message first)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
    }

    /// Get current chunk size
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Forget all per-stream state; the next message on every csid gets a
    /// full header
    pub fn reset(&mut self) {
        self.streams.clear();
    }

    /// Header for the first chunk of `msg`
    ///
    /// The first message on a chunk stream gets a full header, as does one
    /// that switches message stream or moves the timestamp backwards.
    /// Later messages send a type 1 header with the timestamp delta.
    pub fn first_header(&self, msg: &Message) -> ChunkHeader {
        let (chunk_type, timestamp) = match self.streams.get(&msg.csid) {
            Some(prev) if prev.stream_id == msg.stream_id && msg.timestamp >= prev.timestamp => {
                (ChunkType::SameStream, msg.timestamp - prev.timestamp)
            }
            _ => (ChunkType::Full, msg.timestamp),
        };

        ChunkHeader {
            chunk_type,
            csid: msg.csid,
            timestamp,
            message_length: msg.payload.len() as u32,
            message_type_id: msg.type_id,
            message_stream_id: msg.stream_id,
        }
    }

    /// Encode a message into chunks
    ///
    /// Fails without writing anything if the payload does not fit the
    /// 3-byte length field.
    pub fn encode(&mut self, msg: &Message, buf: &mut BytesMut) -> Result<()> {
        if msg.payload.len() > MAX_MESSAGE_LENGTH as usize {
            return Err(ProtocolError::MessageTooLarge {
                size: u32::try_from(msg.payload.len()).unwrap_or(u32::MAX),
                max: MAX_MESSAGE_LENGTH,
            }
            .into());
        }

        let chunk_size = self.chunk_size as usize;
        let header = self.first_header(msg);
        let continuation = ChunkHeader {
            chunk_type: ChunkType::Continuation,
            ..header
        };

        let payload = &msg.payload[..];
        let chunks = payload.len().div_ceil(chunk_size).max(1);
        buf.reserve(payload.len() + 18 + (chunks - 1) * 8);

        let mut offset = 0;
        for index in 0..chunks {
            if index == 0 {
                header.write(buf);
            } else {
                continuation.write(buf);
            }
            let len = (payload.len() - offset).min(chunk_size);
            buf.put_slice(&payload[offset..offset + len]);
            offset += len;
        }

        self.streams.insert(
            msg.csid,
            OutboundStreamState {
                timestamp: msg.timestamp,
                stream_id: msg.stream_id,
            },
        );
        Ok(())
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-chunk-stream state for inbound reassembly
#[derive(Debug, Clone, Default)]
struct InboundStreamState {
    /// Last timestamp (absolute)
    timestamp: u32,
    /// Last timestamp delta
    timestamp_delta: u32,
    message_length: u32,
    message_type: u8,
    stream_id: u32,
    /// Whether the last header carried an extended timestamp
    has_extended_timestamp: bool,
    /// Buffer for partial message reassembly
    partial_message: BytesMut,
}

/// Chunk stream decoder for messages sent by the server
///
/// Never consumes a partial chunk: if the buffer ends mid-chunk, nothing of
/// that chunk is taken and `Ok(None)` is returned.
pub struct ChunkDecoder {
    /// Maximum incoming chunk size
    chunk_size: u32,
    /// Per-chunk-stream state
    streams: HashMap<u32, InboundStreamState>,
    /// Maximum message size (sanity limit)
    max_message_size: u32,
}

impl ChunkDecoder {
    /// Create a new decoder with default chunk size
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Set the chunk size (called when receiving SetChunkSize message)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
    }

    /// Get current chunk size
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Drop all reassembly state and return to the default chunk size
    pub fn reset(&mut self) {
        self.streams.clear();
        self.chunk_size = DEFAULT_CHUNK_SIZE;
    }

    /// Try to decode a complete message from the buffer
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed, or Err on protocol error.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            let (chunk_type, csid, basic_len) = match parse_basic_header(buf) {
                Some(v) => v,
                None => return Ok(None),
            };

            let header_len = basic_len + chunk_type.message_header_len();
            if buf.len() < header_len {
                return Ok(None);
            }

            let state = self.streams.entry(csid).or_default();
            let fields = &buf[basic_len..header_len];

            if chunk_type == ChunkType::Continuation && state.message_type == 0 {
                return Err(ProtocolError::InvalidChunkHeader.into());
            }

            let timestamp_field = match chunk_type {
                ChunkType::Continuation => None,
                _ => Some(read_u24(fields)),
            };
            let extended = match timestamp_field {
                Some(ts) => ts >= EXTENDED_TIMESTAMP_THRESHOLD,
                None => state.has_extended_timestamp,
            };
            let full_header_len = header_len + if extended { 4 } else { 0 };
            if buf.len() < full_header_len {
                return Ok(None);
            }

            let (message_length, message_type) = match chunk_type {
                ChunkType::Full | ChunkType::SameStream => (read_u24(&fields[3..]), fields[6]),
                _ => (state.message_length, state.message_type),
            };
            if message_length > self.max_message_size {
                return Err(ProtocolError::MessageTooLarge {
                    size: message_length,
                    max: self.max_message_size,
                }
                .into());
            }

            let continuing = chunk_type == ChunkType::Continuation && !state.partial_message.is_empty();
            let already = if continuing { state.partial_message.len() as u32 } else { 0 };
            let data_len = (message_length - already).min(self.chunk_size) as usize;
            if buf.len() < full_header_len + data_len {
                return Ok(None);
            }

            // The whole chunk is buffered: commit
            let stream_id = match chunk_type {
                ChunkType::Full => u32::from_le_bytes([fields[7], fields[8], fields[9], fields[10]]),
                _ => state.stream_id,
            };
            buf.advance(header_len);
            let timestamp_value = if extended {
                buf.get_u32()
            } else {
                timestamp_field.unwrap_or(state.timestamp_delta)
            };

            if !continuing {
                state.partial_message.clear();
                match chunk_type {
                    ChunkType::Full => {
                        state.timestamp = timestamp_value;
                        state.timestamp_delta = 0;
                    }
                    _ => {
                        state.timestamp_delta = timestamp_value;
                        state.timestamp = state.timestamp.wrapping_add(timestamp_value);
                    }
                }
            }
            state.has_extended_timestamp = extended;
            state.message_length = message_length;
            state.message_type = message_type;
            state.stream_id = stream_id;

            state.partial_message.put_slice(&buf[..data_len]);
            buf.advance(data_len);

            if state.partial_message.len() as u32 >= message_length {
                let payload = state.partial_message.split().freeze();
                return Ok(Some(Message {
                    csid,
                    timestamp: state.timestamp,
                    type_id: message_type,
                    stream_id,
                    payload,
                }));
            }
        }
    }

    /// Abort a message on a chunk stream (when receiving Abort message)
    pub fn abort(&mut self, csid: u32) {
        if let Some(state) = self.streams.get_mut(&csid) {
            state.partial_message.clear();
        }
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse basic header and return (chunk type, csid, header length)
fn parse_basic_header(buf: &[u8]) -> Option<(ChunkType, u32, usize)> {
    let first = *buf.first()?;
    let chunk_type = ChunkType::from_fmt(first >> 6);

    match first & 0x3F {
        0 => {
            // 2-byte header: csid = 64 + second byte
            let second = *buf.get(1)?;
            Some((chunk_type, 64 + second as u32, 2))
        }
        1 => {
            // 3-byte header: csid = 64 + second + third*256
            if buf.len() < 3 {
                return None;
            }
            Some((chunk_type, 64 + buf[1] as u32 + (buf[2] as u32) * 256, 3))
        }
        csid => Some((chunk_type, csid as u32, 1)),
    }
}

/// Write basic header
fn write_basic_header(csid: u32, fmt: u8, buf: &mut BytesMut) {
    if csid >= 64 + 256 {
        // 3-byte header
        buf.put_u8((fmt << 6) | 1);
        let csid_offset = csid - 64;
        buf.put_u8((csid_offset & 0xFF) as u8);
        buf.put_u8(((csid_offset >> 8) & 0xFF) as u8);
    } else if csid >= 64 {
        // 2-byte header
        buf.put_u8(fmt << 6);
        buf.put_u8((csid - 64) as u8);
    } else {
        // 1-byte header
        buf.put_u8((fmt << 6) | (csid as u8));
    }
}

/// Write 24-bit big-endian value
fn write_u24(value: u32, buf: &mut BytesMut) {
    buf.put_u8(((value >> 16) & 0xFF) as u8);
    buf.put_u8(((value >> 8) & 0xFF) as u8);
    buf.put_u8((value & 0xFF) as u8);
}

fn read_u24(bytes: &[u8]) -> u32 {
    ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | (bytes[2] as u32)
}
