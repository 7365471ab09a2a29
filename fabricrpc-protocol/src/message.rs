//! Typed payloads.
//!
//! Operations never look inside a body themselves; they go through
//! [`Message`] to turn bytes into a typed request and a typed response back
//! into bytes.

use crate::error::CodecError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A payload that can be parsed from and serialized to bytes.
pub trait Message: Sized + Send + 'static {
    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;

    fn encode(&self) -> Result<Vec<u8>, CodecError>;
}

/// JSON-encoded payload wrapper.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Message for Json<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(Json(serde_json::from_slice(bytes)?))
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(&self.0)?)
    }
}

impl Message for Vec<u8> {
    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bytes.to_vec())
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.clone())
    }
}

impl Message for String {
    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct HelloRequest {
        name: String,
    }

    #[test]
    fn test_json_message() {
        let msg = Json(HelloRequest {
            name: "world".to_string(),
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes, br#"{"name":"world"}"#);

        let decoded = Json::<HelloRequest>::decode(&bytes).unwrap();
        assert_eq!(decoded.into_inner().name, "world");
    }

    #[test]
    fn test_json_decode_failure() {
        let result = Json::<HelloRequest>::decode(b"\x00\x01garbage");
        assert!(matches!(result, Err(CodecError::Json(_))));
    }

    #[test]
    fn test_string_message_rejects_invalid_utf8() {
        assert!(matches!(
            String::decode(&[0xFF, 0xFE]),
            Err(CodecError::InvalidUtf8)
        ));
        assert_eq!(String::decode(b"ok").unwrap(), "ok");
    }

    #[test]
    fn test_raw_bytes_message() {
        let raw = vec![1u8, 2, 3];
        assert_eq!(Vec::<u8>::decode(&raw.encode().unwrap()).unwrap(), raw);
    }
}
