//! Binary frame format for stream transports.
//!
//! Frame layout (32 bytes fixed header + rpc header + body):
//!
//! ```text
//! +--------+---------+--------+------------+------------+------------+----------+--------+
//! | magic  | version |  kind  | request_id | timeout_ms | header_len | body_len | crc32c |
//! | 4 bytes| 2 bytes |2 bytes |  8 bytes   |  4 bytes   |  4 bytes   | 4 bytes  | 4 bytes|
//! +--------+---------+--------+------------+------------+------------+----------+--------+
//! | rpc header (header_len bytes) | body (body_len bytes)                                |
//! +-------------------------------+------------------------------------------------------+
//! ```
//!
//! The CRC32C covers the rpc header followed by the body.

use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying fabricrpc frames: "FRPC"
pub const MAGIC: [u8; 4] = *b"FRPC";

/// Size of the fixed frame header in bytes (4+2+2+8+4+4+4+4 = 32).
pub const FRAME_HEADER_SIZE: usize = 32;

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A request expecting a reply with the same request id.
    Request,
    /// The reply to a request.
    Reply,
    /// A fire-and-forget message.
    OneWay,
    /// The peer's transport failed the request; body holds the native code.
    Error,
    /// Keep-alive traffic, carries nothing.
    Ping,
}

impl FrameKind {
    pub fn as_u16(self) -> u16 {
        match self {
            FrameKind::Request => 1,
            FrameKind::Reply => 2,
            FrameKind::OneWay => 3,
            FrameKind::Error => 4,
            FrameKind::Ping => 5,
        }
    }

    pub fn from_u16(value: u16) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(FrameKind::Request),
            2 => Ok(FrameKind::Reply),
            3 => Ok(FrameKind::OneWay),
            4 => Ok(FrameKind::Error),
            5 => Ok(FrameKind::Ping),
            other => Err(ProtocolError::InvalidKind(other)),
        }
    }
}

/// A parsed frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u16,
    pub kind: FrameKind,
    /// Correlates a reply with its request. Zero for one-way frames.
    pub request_id: u64,
    /// Caller's timeout budget in milliseconds. Zero when not applicable.
    pub timeout_ms: u32,
    pub header: Bytes,
    pub body: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, request_id: u64, envelope: Envelope) -> Self {
        let (header, body) = envelope.into_parts();
        Self {
            version: crate::PROTOCOL_VERSION,
            kind,
            request_id,
            timeout_ms: 0,
            header,
            body,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// An error frame carrying a transport-native error code and message.
    pub fn error(request_id: u64, native_code: i32, message: &str) -> Self {
        let mut body = BytesMut::with_capacity(4 + message.len());
        body.put_i32(native_code);
        body.put_slice(message.as_bytes());
        Self::new(
            FrameKind::Error,
            request_id,
            Envelope::new(Bytes::new(), body.freeze()),
        )
    }

    /// Splits an error frame body into (native code, message).
    pub fn error_parts(&self) -> Option<(i32, String)> {
        if self.kind != FrameKind::Error || self.body.len() < 4 {
            return None;
        }
        let code = i32::from_be_bytes([self.body[0], self.body[1], self.body[2], self.body[3]]);
        let message = String::from_utf8_lossy(&self.body[4..]).into_owned();
        Some((code, message))
    }

    pub fn ping() -> Self {
        Self::new(FrameKind::Ping, 0, Envelope::default())
    }

    pub fn into_envelope(self) -> Envelope {
        Envelope::new(self.header, self.body)
    }

    fn checksum(header: &[u8], body: &[u8]) -> u32 {
        crc32c::crc32c_append(crc32c::crc32c(header), body)
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        for len in [self.header.len(), self.body.len()] {
            if len > MAX_PAYLOAD_SIZE as usize {
                return Err(ProtocolError::FrameTooLarge {
                    size: u32::try_from(len).unwrap_or(u32::MAX),
                    max: MAX_PAYLOAD_SIZE,
                });
            }
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.header.len() + self.body.len());
        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.kind.as_u16());
        buf.put_u64(self.request_id);
        buf.put_u32(self.timeout_ms);
        buf.put_u32(self.header.len() as u32);
        buf.put_u32(self.body.len() as u32);
        buf.put_u32(Self::checksum(&self.header, &self.body));
        buf.put_slice(&self.header);
        buf.put_slice(&self.body);

        Ok(buf)
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let mut fixed = &buf[4..FRAME_HEADER_SIZE];
        let version = fixed.get_u16();
        if version != crate::PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let kind = FrameKind::from_u16(fixed.get_u16())?;
        let request_id = fixed.get_u64();
        let timeout_ms = fixed.get_u32();
        let header_len = fixed.get_u32();
        let body_len = fixed.get_u32();
        let crc_expected = fixed.get_u32();

        for len in [header_len, body_len] {
            if len > MAX_PAYLOAD_SIZE {
                return Err(ProtocolError::FrameTooLarge {
                    size: len,
                    max: MAX_PAYLOAD_SIZE,
                });
            }
        }

        let total_len = FRAME_HEADER_SIZE + header_len as usize + body_len as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let header = buf.split_to(header_len as usize).freeze();
        let body = buf.split_to(body_len as usize).freeze();

        let crc_actual = Self::checksum(&header, &body);
        if crc_actual != crc_expected {
            return Err(ProtocolError::CrcMismatch {
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        Ok(Some(Self {
            version,
            kind,
            request_id,
            timeout_ms,
            header,
            body,
        }))
    }
}
