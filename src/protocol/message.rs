//! RTMP message types and parsing
//!
//! Only the messages a publishing client exchanges during connection setup
//! are modeled:
//! - Protocol Control Messages (types 1, 2, 3, 5, 6): Chunk/flow control
//! - Command Messages (type 20): AMF0-encoded commands
//!
//! Everything else is carried through as [`RtmpMessage::Unknown`].
//!
//! Reference: RTMP Specification Section 5.4

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::{Amf0Decoder, Amf0Encoder, AmfValue};
use crate::error::{AmfError, ProtocolError, Result};
use crate::protocol::chunk::Message;
use crate::protocol::constants::*;

/// Parsed RTMP message
#[derive(Debug, Clone, PartialEq)]
pub enum RtmpMessage {
    /// Set Chunk Size (type 1)
    SetChunkSize(u32),

    /// Abort Message (type 2)
    Abort { csid: u32 },

    /// Acknowledgement (type 3)
    Acknowledgement { sequence: u32 },

    /// Window Acknowledgement Size (type 5)
    WindowAckSize(u32),

    /// Set Peer Bandwidth (type 6)
    SetPeerBandwidth { size: u32, limit_type: u8 },

    /// AMF0 Command (type 20)
    Command(Command),

    /// Any other message type
    Unknown { type_id: u8, data: Bytes },
}

/// RTMP command (connect, _result, onStatus, etc.)
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Command name
    pub name: String,
    /// Transaction ID
    pub transaction_id: f64,
    /// Command object (often null for responses)
    pub command_object: AmfValue,
    /// Additional arguments
    pub arguments: Vec<AmfValue>,
    /// Message stream ID (from chunk)
    pub stream_id: u32,
}

impl RtmpMessage {
    /// Parse a message reassembled by the chunk decoder
    pub fn from_message(msg: &Message) -> Result<Self> {
        let mut payload = msg.payload.clone();

        match msg.type_id {
            MSG_SET_CHUNK_SIZE => {
                if payload.len() < 4 {
                    return Err(ProtocolError::InvalidChunkHeader.into());
                }
                let size = payload.get_u32() & 0x7FFFFFFF; // Ignore MSB
                Ok(RtmpMessage::SetChunkSize(size))
            }

            MSG_ABORT => {
                if payload.len() < 4 {
                    return Err(ProtocolError::InvalidChunkHeader.into());
                }
                Ok(RtmpMessage::Abort { csid: payload.get_u32() })
            }

            MSG_ACKNOWLEDGEMENT => {
                if payload.len() < 4 {
                    return Err(ProtocolError::InvalidChunkHeader.into());
                }
                Ok(RtmpMessage::Acknowledgement { sequence: payload.get_u32() })
            }

            MSG_WINDOW_ACK_SIZE => {
                if payload.len() < 4 {
                    return Err(ProtocolError::InvalidChunkHeader.into());
                }
                Ok(RtmpMessage::WindowAckSize(payload.get_u32()))
            }

            MSG_SET_PEER_BANDWIDTH => {
                if payload.len() < 5 {
                    return Err(ProtocolError::InvalidChunkHeader.into());
                }
                let size = payload.get_u32();
                let limit_type = payload.get_u8();
                Ok(RtmpMessage::SetPeerBandwidth { size, limit_type })
            }

            MSG_COMMAND_AMF0 => {
                let cmd = parse_command(&mut payload, msg.stream_id)?;
                Ok(RtmpMessage::Command(cmd))
            }

            _ => Ok(RtmpMessage::Unknown {
                type_id: msg.type_id,
                data: payload,
            }),
        }
    }

    /// Encode message to (type id, chunk payload)
    pub fn encode(&self) -> Result<(u8, Bytes)> {
        let encoded = match self {
            RtmpMessage::SetChunkSize(size) => (MSG_SET_CHUNK_SIZE, u32_payload(*size & 0x7FFFFFFF)),

            RtmpMessage::Abort { csid } => (MSG_ABORT, u32_payload(*csid)),

            RtmpMessage::Acknowledgement { sequence } => (MSG_ACKNOWLEDGEMENT, u32_payload(*sequence)),

            RtmpMessage::WindowAckSize(size) => (MSG_WINDOW_ACK_SIZE, u32_payload(*size)),

            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u32(*size);
                buf.put_u8(*limit_type);
                (MSG_SET_PEER_BANDWIDTH, buf.freeze())
            }

            RtmpMessage::Command(cmd) => (MSG_COMMAND_AMF0, encode_command(cmd)?),

            RtmpMessage::Unknown { type_id, data } => (*type_id, data.clone()),
        };
        Ok(encoded)
    }

    /// Encode into a [`Message`] on the chunk stream its type belongs to
    pub fn to_message(&self, timestamp: u32) -> Result<Message> {
        let (type_id, payload) = self.encode()?;
        let (csid, stream_id) = match self {
            RtmpMessage::Command(cmd) => (CSID_COMMAND, cmd.stream_id),
            RtmpMessage::Unknown { .. } => (CSID_COMMAND, 0),
            _ => (CSID_PROTOCOL_CONTROL, 0),
        };
        Ok(Message::new(csid, timestamp, type_id, stream_id, payload))
    }
}

fn u32_payload(value: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(value);
    buf.freeze()
}

/// Parse AMF0 command
fn parse_command(payload: &mut Bytes, stream_id: u32) -> Result<Command> {
    let mut decoder = Amf0Decoder::new();

    // Command name
    let name = match decoder.decode(payload)? {
        AmfValue::String(s) => s,
        other => {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "expected command name, got {:?}",
                other
            ))
            .into())
        }
    };

    // Transaction ID
    let transaction_id = match decoder.decode(payload)? {
        AmfValue::Number(n) => n,
        _ => 0.0, // Lenient: default to 0
    };

    // Command object (can be null)
    let command_object = if payload.has_remaining() {
        decoder.decode(payload)?
    } else {
        AmfValue::Null
    };

    // Additional arguments
    let mut arguments = Vec::new();
    while payload.has_remaining() {
        match decoder.decode(payload) {
            Ok(v) => arguments.push(v),
            Err(AmfError::UnexpectedEof) => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Command {
        name,
        transaction_id,
        command_object,
        arguments,
        stream_id,
    })
}

/// Encode a command to AMF0 bytes
///
/// Nothing is returned if any value fails to encode.
fn encode_command(cmd: &Command) -> Result<Bytes> {
    let mut encoder = Amf0Encoder::new();
    encoder.encode(&AmfValue::String(cmd.name.clone()))?;
    encoder.encode(&AmfValue::Number(cmd.transaction_id))?;
    encoder.encode(&cmd.command_object)?;
    encoder.encode_all(&cmd.arguments)?;
    Ok(encoder.finish())
}

impl Command {
    /// Build the `connect` command for `app`
    ///
    /// The command object keys are sent in a fixed order; some servers
    /// depend on it.
    pub fn connect(app: &str, tc_url: &str, flash_ver: &str) -> Self {
        let command_object = AmfValue::object([
            ("app", AmfValue::from(app)),
            ("flashVer", AmfValue::from(flash_ver)),
            ("tcUrl", AmfValue::from(tc_url)),
            ("fpad", AmfValue::Boolean(false)),
            ("audioCodecs", AmfValue::Number(CONNECT_AUDIO_CODECS)),
            ("videoCodecs", AmfValue::Number(CONNECT_VIDEO_CODECS)),
            ("videoFunction", AmfValue::Number(CONNECT_VIDEO_FUNCTION)),
        ]);

        Command {
            name: CMD_CONNECT.to_string(),
            transaction_id: CONNECT_TRANSACTION_ID,
            command_object,
            arguments: Vec::new(),
            stream_id: 0,
        }
    }

    /// Whether this is the server's reply to a given transaction
    pub fn is_response_to(&self, transaction_id: f64) -> bool {
        (self.name == CMD_RESULT || self.name == CMD_ERROR) && self.transaction_id == transaction_id
    }

    /// `code` of the info object in the first argument, if any
    pub fn status_code(&self) -> Option<&str> {
        self.arguments.first().and_then(|info| info.get_string("code"))
    }

    /// `description` of the info object in the first argument, if any
    pub fn description(&self) -> Option<&str> {
        self.arguments.first().and_then(|info| info.get_string("description"))
    }
}
