//! Message envelopes.
//!
//! A transport message is a header plus a body that may arrive in several
//! chunks. Everything above the transport works on [`Envelope`], whose body
//! is always one contiguous buffer.

use bytes::{Bytes, BytesMut};

/// Shape of a message as handed over by a transport.
pub trait TransportMessage: Send + Sync {
    fn header(&self) -> &[u8];

    /// Body chunks in order. Their concatenation is the body.
    fn body_chunks(&self) -> Vec<&[u8]>;
}

/// Header bytes plus one contiguous body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    header: Bytes,
    body: Bytes,
}

impl Envelope {
    pub fn new(header: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            header: header.into(),
            body: body.into(),
        }
    }

    /// Builds an envelope from a header and a chunked body.
    pub fn from_chunks<I, B>(header: impl Into<Bytes>, chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut body = BytesMut::new();
        for chunk in chunks {
            body.extend_from_slice(chunk.as_ref());
        }
        Self {
            header: header.into(),
            body: body.freeze(),
        }
    }

    /// Copies any transport message, concatenating its body chunks.
    pub fn copy_from<M: TransportMessage + ?Sized>(message: &M) -> Self {
        let chunks = message.body_chunks();
        match chunks.as_slice() {
            [] => Self::new(Bytes::copy_from_slice(message.header()), Bytes::new()),
            [single] => Self::new(
                Bytes::copy_from_slice(message.header()),
                Bytes::copy_from_slice(single),
            ),
            _ => Self::from_chunks(Bytes::copy_from_slice(message.header()), chunks),
        }
    }

    pub fn header(&self) -> &Bytes {
        &self.header
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    pub fn into_parts(self) -> (Bytes, Bytes) {
        (self.header, self.body)
    }
}

impl TransportMessage for Envelope {
    fn header(&self) -> &[u8] {
        &self.header
    }

    fn body_chunks(&self) -> Vec<&[u8]> {
        if self.body.is_empty() {
            Vec::new()
        } else {
            vec![&self.body[..]]
        }
    }
}

/// A message whose body is kept as separate chunks.
#[derive(Debug, Clone, Default)]
pub struct ChunkedMessage {
    pub header: Bytes,
    pub chunks: Vec<Bytes>,
}

impl ChunkedMessage {
    pub fn new(header: impl Into<Bytes>) -> Self {
        Self {
            header: header.into(),
            chunks: Vec::new(),
        }
    }

    pub fn with_chunk(mut self, chunk: impl Into<Bytes>) -> Self {
        self.chunks.push(chunk.into());
        self
    }
}

impl TransportMessage for ChunkedMessage {
    fn header(&self) -> &[u8] {
        &self.header
    }

    fn body_chunks(&self) -> Vec<&[u8]> {
        self.chunks.iter().map(|c| c.as_ref()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_concatenates_chunks() {
        let message = ChunkedMessage::new(&b"hdr"[..])
            .with_chunk(&b"hello"[..])
            .with_chunk(&b" "[..])
            .with_chunk(&b"world"[..]);

        let envelope = Envelope::copy_from(&message);
        assert_eq!(envelope.header().as_ref(), b"hdr");
        assert_eq!(envelope.body().as_ref(), b"hello world");
    }

    #[test]
    fn test_copy_without_body() {
        let envelope = Envelope::copy_from(&ChunkedMessage::new(&b"h"[..]));
        assert!(envelope.body().is_empty());
    }

    #[test]
    fn test_envelope_is_a_transport_message() {
        let original = Envelope::new(&b"h"[..], &b"body"[..]);
        assert_eq!(original.body_chunks().len(), 1);
        assert_eq!(Envelope::copy_from(&original), original);

        let empty = Envelope::default();
        assert!(empty.body_chunks().is_empty());
    }

    #[test]
    fn test_set_body_and_parts() {
        let mut envelope = Envelope::new(&b"h"[..], &b"old"[..]);
        envelope.set_body(Bytes::new());
        let (header, body) = envelope.into_parts();
        assert_eq!(header.as_ref(), b"h");
        assert!(body.is_empty());
    }
}
