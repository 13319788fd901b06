//! AMF (Action Message Format) implementation
//!
//! AMF is Adobe's binary serialization format used in RTMP for encoding
//! command parameters. Only AMF0 is implemented; it is what every server
//! expects for the `connect` command and what they answer with.

pub mod amf0;
pub mod value;

pub use amf0::{Amf0Decoder, Amf0Encoder};
pub use value::{AmfProperties, AmfValue};
