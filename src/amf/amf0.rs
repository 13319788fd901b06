//! AMF0 encoder and decoder
//!
//! AMF0 is the original Action Message Format used in Flash/RTMP.
//! Reference: AMF0 File Format Specification (amf0-file-format-specification.pdf)
//!
//! Type Markers handled here:
//! ```text
//! 0x00 - Number (IEEE 754 double, big-endian)
//! 0x01 - Boolean
//! 0x02 - String (UTF-8, 16-bit length prefix)
//! 0x03 - Object (key-value pairs until 0x000009)
//! 0x05 - Null
//! 0x06 - Undefined
//! 0x08 - ECMA Array (associative array)
//! 0x09 - Object End (0x000009 sequence)
//! 0x0A - Strict Array (dense array)
//! 0x0C - Long String (UTF-8, 32-bit length prefix)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::value::{AmfProperties, AmfValue};
use crate::error::AmfError;

// AMF0 type markers
const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_LONG_STRING: u8 = 0x0C;

/// Longest string representable with the 16-bit length prefix
const SHORT_STRING_MAX: usize = 0xFFFF;

/// Longest string representable at all
const LONG_STRING_MAX: usize = 0xFFFF_FFFF;

/// Maximum nesting depth for objects/arrays (prevent stack overflow)
const MAX_NESTING_DEPTH: usize = 64;

/// String header chosen for a given byte length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringHeader {
    Short(u16),
    Long(u32),
}

fn string_header(len: usize) -> Result<StringHeader, AmfError> {
    if len <= SHORT_STRING_MAX {
        Ok(StringHeader::Short(len as u16))
    } else if len <= LONG_STRING_MAX {
        Ok(StringHeader::Long(len as u32))
    } else {
        Err(AmfError::StringTooLarge(len))
    }
}

/// AMF0 encoder
///
/// Encoding is all-or-nothing per value: if a nested value fails, the
/// buffer is truncated back to where that value started.
pub struct Amf0Encoder {
    buf: BytesMut,
}

impl Amf0Encoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Create encoder with specific capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Get the encoded bytes and reset encoder
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Get current encoded length
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if encoder is empty
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Encode a single AMF0 value
    pub fn encode(&mut self, value: &AmfValue) -> Result<(), AmfError> {
        let start = self.buf.len();
        let result = self.encode_value(value);
        if result.is_err() {
            self.buf.truncate(start);
        }
        result
    }

    /// Encode multiple values; on failure nothing from this call remains
    pub fn encode_all(&mut self, values: &[AmfValue]) -> Result<(), AmfError> {
        let start = self.buf.len();
        for value in values {
            if let Err(e) = self.encode_value(value) {
                self.buf.truncate(start);
                return Err(e);
            }
        }
        Ok(())
    }

    fn encode_value(&mut self, value: &AmfValue) -> Result<(), AmfError> {
        match value {
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*n);
            }
            AmfValue::Boolean(b) => {
                self.buf.put_u8(MARKER_BOOLEAN);
                self.buf.put_u8(u8::from(*b));
            }
            AmfValue::String(s) => self.encode_string(s.as_bytes())?,
            AmfValue::Object(props) => {
                self.buf.put_u8(MARKER_OBJECT);
                self.encode_properties(props)?;
            }
            AmfValue::Null => self.buf.put_u8(MARKER_NULL),
            AmfValue::Undefined => self.buf.put_u8(MARKER_UNDEFINED),
            AmfValue::EcmaArray(props) => {
                self.buf.put_u8(MARKER_ECMA_ARRAY);
                self.buf.put_u32(props.len() as u32);
                self.encode_properties(props)?;
            }
            AmfValue::Array(elements) => {
                self.buf.put_u8(MARKER_STRICT_ARRAY);
                self.buf.put_u32(elements.len() as u32);
                for elem in elements {
                    self.encode_value(elem)?;
                }
            }
        }
        Ok(())
    }

    fn encode_string(&mut self, bytes: &[u8]) -> Result<(), AmfError> {
        match string_header(bytes.len())? {
            StringHeader::Short(len) => {
                self.buf.put_u8(MARKER_STRING);
                self.buf.put_u16(len);
            }
            StringHeader::Long(len) => {
                self.buf.put_u8(MARKER_LONG_STRING);
                self.buf.put_u32(len);
            }
        }
        self.buf.put_slice(bytes);
        Ok(())
    }

    fn encode_properties(&mut self, props: &[(String, AmfValue)]) -> Result<(), AmfError> {
        for (key, val) in props {
            self.write_key(key)?;
            self.encode_value(val)?;
        }
        // Empty key followed by the object-end marker
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
        Ok(())
    }

    /// Property keys always use the 16-bit length form, without a marker
    fn write_key(&mut self, key: &str) -> Result<(), AmfError> {
        if key.len() > SHORT_STRING_MAX {
            return Err(AmfError::StringTooLarge(key.len()));
        }
        self.buf.put_u16(key.len() as u16);
        self.buf.put_slice(key.as_bytes());
        Ok(())
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// AMF0 decoder for server replies
pub struct Amf0Decoder {
    depth: usize,
}

impl Amf0Decoder {
    /// Create a new decoder
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Decode a single AMF0 value from the buffer
    pub fn decode(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.is_empty() {
            return Err(AmfError::UnexpectedEof);
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.depth -= 1;
            return Err(AmfError::NestingTooDeep);
        }

        let marker = buf.get_u8();
        let result = self.decode_value(marker, buf);
        self.depth -= 1;
        result
    }

    /// Decode all values from buffer until exhausted
    pub fn decode_all(&mut self, buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while buf.has_remaining() {
            values.push(self.decode(buf)?);
        }
        Ok(values)
    }

    fn decode_value(&mut self, marker: u8, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_NUMBER => {
                if buf.remaining() < 8 {
                    return Err(AmfError::UnexpectedEof);
                }
                Ok(AmfValue::Number(buf.get_f64()))
            }
            MARKER_BOOLEAN => {
                if buf.is_empty() {
                    return Err(AmfError::UnexpectedEof);
                }
                Ok(AmfValue::Boolean(buf.get_u8() != 0))
            }
            MARKER_STRING => Ok(AmfValue::String(read_utf8(buf)?)),
            MARKER_LONG_STRING => Ok(AmfValue::String(read_utf8_long(buf)?)),
            MARKER_OBJECT => Ok(AmfValue::Object(self.decode_properties(buf)?)),
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_UNDEFINED => Ok(AmfValue::Undefined),
            MARKER_ECMA_ARRAY => {
                if buf.remaining() < 4 {
                    return Err(AmfError::UnexpectedEof);
                }
                // Count hint, not always accurate
                let _count = buf.get_u32();
                Ok(AmfValue::EcmaArray(self.decode_properties(buf)?))
            }
            MARKER_STRICT_ARRAY => {
                if buf.remaining() < 4 {
                    return Err(AmfError::UnexpectedEof);
                }
                let count = buf.get_u32() as usize;
                let mut elements = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    elements.push(self.decode(buf)?);
                }
                Ok(AmfValue::Array(elements))
            }
            _ => Err(AmfError::UnknownMarker(marker)),
        }
    }

    fn decode_properties(&mut self, buf: &mut Bytes) -> Result<AmfProperties, AmfError> {
        let mut properties = Vec::new();
        loop {
            let key = read_utf8(buf)?;
            if key.is_empty() {
                if buf.is_empty() {
                    return Err(AmfError::UnexpectedEof);
                }
                if buf.get_u8() != MARKER_OBJECT_END {
                    return Err(AmfError::InvalidObjectEnd);
                }
                return Ok(properties);
            }
            let value = self.decode(buf)?;
            properties.push((key, value));
        }
    }
}

impl Default for Amf0Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read UTF-8 string with 16-bit length prefix
fn read_utf8(buf: &mut Bytes) -> Result<String, AmfError> {
    if buf.remaining() < 2 {
        return Err(AmfError::UnexpectedEof);
    }
    let len = buf.get_u16() as usize;
    read_utf8_bytes(buf, len)
}

/// Read UTF-8 string with 32-bit length prefix
fn read_utf8_long(buf: &mut Bytes) -> Result<String, AmfError> {
    if buf.remaining() < 4 {
        return Err(AmfError::UnexpectedEof);
    }
    let len = buf.get_u32() as usize;
    read_utf8_bytes(buf, len)
}

fn read_utf8_bytes(buf: &mut Bytes, len: usize) -> Result<String, AmfError> {
    if buf.remaining() < len {
        return Err(AmfError::UnexpectedEof);
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// Convenience function to encode a single value
pub fn encode(value: &AmfValue) -> Result<Bytes, AmfError> {
    let mut encoder = Amf0Encoder::new();
    encoder.encode(value)?;
    Ok(encoder.finish())
}

/// Convenience function to encode multiple values
pub fn encode_all(values: &[AmfValue]) -> Result<Bytes, AmfError> {
    let mut encoder = Amf0Encoder::new();
    encoder.encode_all(values)?;
    Ok(encoder.finish())
}

/// Convenience function to decode a single value
pub fn decode(data: &[u8]) -> Result<AmfValue, AmfError> {
    let mut buf = Bytes::copy_from_slice(data);
    Amf0Decoder::new().decode(&mut buf)
}

/// Convenience function to decode all values
pub fn decode_all(data: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
    let mut buf = Bytes::copy_from_slice(data);
    Amf0Decoder::new().decode_all(&mut buf)
}
