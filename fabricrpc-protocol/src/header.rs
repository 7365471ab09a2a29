//! RPC request/reply headers and the codecs that put them on the wire.
//!
//! The routing layers only ever see `Arc<dyn HeaderCodec>`, so the wire
//! schema can be swapped without touching them. Two codecs ship:
//!
//! - [`ProtoHeaderCodec`] (default): protobuf wire format.
//!   Request: `url = 1 (string)`. Reply: `status_code = 1 (int32)`,
//!   `status_message = 2 (string)`.
//! - [`JsonHeaderCodec`]: the same structs as JSON objects.

use crate::error::HeaderError;
use crate::status::{Status, StatusCode};
use crate::wire;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Header carried by every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub url: String,
}

impl RequestHeader {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Header carried by every reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyHeader {
    pub status_code: i32,
    pub status_message: String,
}

impl ReplyHeader {
    pub fn from_status(status: &Status) -> Self {
        Self {
            status_code: status.code().as_i32(),
            status_message: status.message().to_string(),
        }
    }

    /// Rebuilds the status. Returns `None` for a code this side does not know.
    pub fn to_status(&self) -> Option<Status> {
        StatusCode::from_i32(self.status_code)
            .map(|code| Status::new(code, self.status_message.clone()))
    }
}

/// Converts headers to and from their wire encoding.
pub trait HeaderCodec: Send + Sync {
    fn serialize_request_header(&self, header: &RequestHeader) -> Result<Bytes, HeaderError>;

    fn deserialize_request_header(&self, bytes: &[u8]) -> Result<RequestHeader, HeaderError>;

    /// Fails with [`HeaderError::EmptyStatusMessage`] if the message is empty.
    fn serialize_reply_header(&self, header: &ReplyHeader) -> Result<Bytes, HeaderError>;

    fn deserialize_reply_header(&self, bytes: &[u8]) -> Result<ReplyHeader, HeaderError>;
}

/// Protobuf wire-format header codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoHeaderCodec;

const URL_FIELD: u32 = 1;
const STATUS_CODE_FIELD: u32 = 1;
const STATUS_MESSAGE_FIELD: u32 = 2;

fn read_string(buf: &mut &[u8]) -> Result<String, HeaderError> {
    let raw = wire::decode_length_delimited(buf)
        .ok_or(HeaderError::Malformed("truncated length-delimited field"))?;
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|_| HeaderError::InvalidUtf8)
}

fn skip(wire_type: u8, buf: &mut &[u8]) -> Result<(), HeaderError> {
    wire::skip_field(wire_type, buf).ok_or(HeaderError::Malformed("cannot skip unknown field"))
}

impl HeaderCodec for ProtoHeaderCodec {
    fn serialize_request_header(&self, header: &RequestHeader) -> Result<Bytes, HeaderError> {
        let mut buf = Vec::with_capacity(header.url.len() + 2);
        if !header.url.is_empty() {
            wire::encode_string(URL_FIELD, &header.url, &mut buf);
        }
        Ok(Bytes::from(buf))
    }

    fn deserialize_request_header(&self, bytes: &[u8]) -> Result<RequestHeader, HeaderError> {
        let mut buf = bytes;
        let mut header = RequestHeader::default();

        while !buf.is_empty() {
            let (field, wire_type) =
                wire::decode_tag(&mut buf).ok_or(HeaderError::Malformed("truncated tag"))?;
            match (field, wire_type) {
                (URL_FIELD, wire::WIRE_TYPE_LEN) => header.url = read_string(&mut buf)?,
                (URL_FIELD, _) => return Err(HeaderError::Malformed("url has wrong wire type")),
                (0, _) => return Err(HeaderError::Malformed("field number zero")),
                _ => skip(wire_type, &mut buf)?,
            }
        }

        Ok(header)
    }

    fn serialize_reply_header(&self, header: &ReplyHeader) -> Result<Bytes, HeaderError> {
        if header.status_message.is_empty() {
            return Err(HeaderError::EmptyStatusMessage);
        }
        let mut buf = Vec::with_capacity(header.status_message.len() + 12);
        if header.status_code != 0 {
            wire::encode_int32(STATUS_CODE_FIELD, header.status_code, &mut buf);
        }
        wire::encode_string(STATUS_MESSAGE_FIELD, &header.status_message, &mut buf);
        Ok(Bytes::from(buf))
    }

    fn deserialize_reply_header(&self, bytes: &[u8]) -> Result<ReplyHeader, HeaderError> {
        let mut buf = bytes;
        let mut header = ReplyHeader::default();

        while !buf.is_empty() {
            let (field, wire_type) =
                wire::decode_tag(&mut buf).ok_or(HeaderError::Malformed("truncated tag"))?;
            match (field, wire_type) {
                (STATUS_CODE_FIELD, wire::WIRE_TYPE_VARINT) => {
                    header.status_code = wire::decode_int32(&mut buf)
                        .ok_or(HeaderError::Malformed("truncated varint"))?
                        .map_err(|_| HeaderError::Malformed("status code out of range"))?;
                }
                (STATUS_MESSAGE_FIELD, wire::WIRE_TYPE_LEN) => {
                    header.status_message = read_string(&mut buf)?;
                }
                (STATUS_CODE_FIELD | STATUS_MESSAGE_FIELD, _) => {
                    return Err(HeaderError::Malformed("reply field has wrong wire type"));
                }
                (0, _) => return Err(HeaderError::Malformed("field number zero")),
                _ => skip(wire_type, &mut buf)?,
            }
        }

        Ok(header)
    }
}

/// JSON header codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHeaderCodec;

impl HeaderCodec for JsonHeaderCodec {
    fn serialize_request_header(&self, header: &RequestHeader) -> Result<Bytes, HeaderError> {
        Ok(Bytes::from(serde_json::to_vec(header)?))
    }

    fn deserialize_request_header(&self, bytes: &[u8]) -> Result<RequestHeader, HeaderError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn serialize_reply_header(&self, header: &ReplyHeader) -> Result<Bytes, HeaderError> {
        if header.status_message.is_empty() {
            return Err(HeaderError::EmptyStatusMessage);
        }
        Ok(Bytes::from(serde_json::to_vec(header)?))
    }

    fn deserialize_reply_header(&self, bytes: &[u8]) -> Result<ReplyHeader, HeaderError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
