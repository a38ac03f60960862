//! Body serialization for request and response frames.

use crate::error::{CodecError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Serializer used for frame bodies. Both peers must agree on it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyFormat {
    /// Compact bincode encoding.
    #[default]
    Bincode,
    /// CBOR via ciborium.
    Cbor,
}

impl BodyFormat {
    /// Encode a value into body bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Bytes> {
        match self {
            Self::Bincode => bincode::serialize(value)
                .map(Bytes::from)
                .map_err(|e| CodecError::Encode(e.to_string()).into()),
            Self::Cbor => {
                let mut vec = Vec::new();
                ciborium::ser::into_writer(value, &mut vec).map_err(CodecError::from)?;
                Ok(Bytes::from(vec))
            }
        }
    }

    /// Decode body bytes into a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is invalid for the target type.
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        match self {
            Self::Bincode => bincode::deserialize(data)
                .map_err(|e| CodecError::Decode(e.to_string()).into()),
            Self::Cbor => ciborium::de::from_reader(data)
                .map_err(|e| CodecError::Decode(e.to_string()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestMessage {
        id: u32,
        name: String,
        data: Vec<u8>,
        tags: HashMap<String, String>,
    }

    fn sample() -> TestMessage {
        TestMessage {
            id: 42,
            name: "test".to_string(),
            data: vec![1, 2, 3, 4, 5],
            tags: HashMap::from([("k".to_string(), "v".to_string())]),
        }
    }

    #[test]
    fn test_encode_decode_both_formats() {
        for format in [BodyFormat::Bincode, BodyFormat::Cbor] {
            let encoded = format.encode(&sample()).unwrap();
            let decoded: TestMessage = format.decode(&encoded).unwrap();
            assert_eq!(decoded, sample(), "{format:?}");
        }
    }

    #[test]
    fn test_decode_error() {
        let bad_data = vec![0xFF, 0xFF, 0xFF];
        for format in [BodyFormat::Bincode, BodyFormat::Cbor] {
            let result: Result<TestMessage> = format.decode(&bad_data);
            assert!(result.is_err(), "{format:?}");
        }
    }
}
