// Path: crates/types/src/codec.rs

//! Defines the canonical, self-describing binary codec for all wire traffic.
//!
//! This module provides simple wrappers around `rmp-serde` (MessagePack) in
//! *named* mode, so that every struct serialises as a string-keyed map. By
//! centralizing the codec logic here in the base `types` crate, we ensure that
//! all components produce the exact same bytes for semantically equal values:
//! struct fields serialise in declaration order, which keeps any bytes that
//! feed an authentication tag stable across processes.

use crate::error::TransportError;
use serde::{de::DeserializeOwned, Serialize};

/// Encodes a value into its canonical MessagePack map representation.
///
/// Used for every envelope, payload, and on-disk job record. Encoding only
/// fails for values that cannot be represented as string-keyed maps, which
/// the wire types in this crate never are.
pub fn to_bytes<T: Serialize>(v: &T) -> Result<Vec<u8>, TransportError> {
    rmp_serde::to_vec_named(v)
        .map_err(|e| TransportError::ProtocolViolation(format!("encode failed: {}", e)))
}

/// Decodes a value from its canonical MessagePack representation.
///
/// Fails fast on any decoding error. Trailing bytes after a complete value
/// are a protocol violation: a frame carries exactly one envelope.
pub fn from_bytes<T: DeserializeOwned>(b: &[u8]) -> Result<T, TransportError> {
    rmp_serde::from_slice(b)
        .map_err(|e| TransportError::ProtocolViolation(format!("decode failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct TestStruct {
        id: u32,
        name: String,
        tags: Vec<u8>,
    }

    #[test]
    fn test_codec_roundtrip() {
        let original = TestStruct {
            id: 42,
            name: "m1".to_string(),
            tags: vec![1, 2, 3],
        };

        let encoded = to_bytes(&original).unwrap();
        assert!(!encoded.is_empty());

        let decoded = from_bytes::<TestStruct>(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_codec_is_named() {
        // The wire format must be a self-describing map, not a positional
        // array, so that the `enc`/`load` envelope keys survive.
        let original = TestStruct {
            id: 7,
            name: "x".to_string(),
            tags: vec![],
        };
        let encoded = to_bytes(&original).unwrap();
        let value: serde_json::Value =
            rmp_serde::from_slice(&encoded).expect("named encoding decodes as a map");
        assert!(value.is_object());
        assert_eq!(value.get("id").and_then(|v| v.as_u64()), Some(7));
    }

    #[test]
    fn test_codec_decode_failure() {
        let original = TestStruct {
            id: 99,
            name: "trunc".to_string(),
            tags: vec![10, 20, 30],
        };

        let mut encoded = to_bytes(&original).unwrap();
        encoded.pop();
        encoded.pop();

        let result = from_bytes::<TestStruct>(&encoded);
        assert!(result.is_err());
    }
}
