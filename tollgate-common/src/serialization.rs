// Standard encoding/decoding patterns for stored and wire-facing records.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("Bincode error: {0}")]
    Bincode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Standard encoding types used throughout Tollgate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingType {
    /// Compact binary encoding for persisted records
    Bincode,
    /// Human-readable format for configuration and HTTP payloads
    Json,
}

/// Trait for standardized serialization across all Tollgate types
pub trait TollSerialize: Serialize + DeserializeOwned {
    /// Get the preferred encoding type for this data structure
    fn preferred_encoding() -> EncodingType;

    /// Serialize using the preferred encoding
    fn encode(&self) -> Result<Vec<u8>, SerializationError> {
        self.encode_as(Self::preferred_encoding())
    }

    /// Serialize using a specific encoding
    fn encode_as(&self, encoding: EncodingType) -> Result<Vec<u8>, SerializationError> {
        match encoding {
            EncodingType::Bincode => {
                bincode::serialize(self).map_err(|e| SerializationError::Bincode(e.to_string()))
            }
            EncodingType::Json => serde_json::to_vec(self).map_err(SerializationError::Json),
        }
    }

    /// Deserialize from bytes using the preferred encoding
    fn decode(bytes: &[u8]) -> Result<Self, SerializationError> {
        Self::decode_as(bytes, Self::preferred_encoding())
    }

    /// Deserialize using a specific encoding
    fn decode_as(bytes: &[u8], encoding: EncodingType) -> Result<Self, SerializationError> {
        match encoding {
            EncodingType::Bincode => {
                bincode::deserialize(bytes).map_err(|e| SerializationError::Bincode(e.to_string()))
            }
            EncodingType::Json => serde_json::from_slice(bytes).map_err(SerializationError::Json),
        }
    }
}

// Implementations for primitive types used as index values
impl TollSerialize for String {
    fn preferred_encoding() -> EncodingType {
        EncodingType::Json
    }
}

impl TollSerialize for u64 {
    fn preferred_encoding() -> EncodingType {
        EncodingType::Json
    }
}

impl TollSerialize for u32 {
    fn preferred_encoding() -> EncodingType {
        EncodingType::Json
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestStruct {
        id: u64,
        name: String,
        data: Vec<u8>,
    }

    impl TollSerialize for TestStruct {
        fn preferred_encoding() -> EncodingType {
            EncodingType::Bincode
        }
    }

    #[test]
    fn test_serialization_roundtrip() {
        let test_data = TestStruct {
            id: 42,
            name: "test".to_string(),
            data: vec![1, 2, 3, 4],
        };

        let encoded = test_data.encode().unwrap();
        let decoded = TestStruct::decode(&encoded).unwrap();

        assert_eq!(test_data, decoded);
    }

    #[test]
    fn test_json_encoding() {
        let test_data = TestStruct {
            id: 7,
            name: "json".to_string(),
            data: vec![],
        };

        let encoded = test_data.encode_as(EncodingType::Json).unwrap();
        let decoded = TestStruct::decode_as(&encoded, EncodingType::Json).unwrap();
        assert_eq!(test_data, decoded);
    }
}
