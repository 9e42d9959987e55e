//! Element record encoding for the data file.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::compression::{CompressionAlgorithm, RecordCompressor};
use crate::cache::element::{Element, ElementKey, ElementValue};
use crate::error::{Error, Result};

/// Serializable form of an element value
#[derive(Debug, Serialize, Deserialize)]
enum StoredValue {
    Null,
    Bytes(Vec<u8>),
    Text(String),
    Integer(i64),
    /// JSON text; bincode cannot carry self-describing values
    Json(String),
}

/// On-disk element record
#[derive(Debug, Serialize, Deserialize)]
struct DiskRecord {
    key: ElementKey,
    value: StoredValue,
    version: u64,
    creation_time: u64,
    last_access_time: u64,
    last_update_time: u64,
    hit_count: u64,
    eternal: Option<bool>,
    time_to_live_seconds: Option<u64>,
    time_to_idle_seconds: Option<u64>,
}

impl TryFrom<&Element> for DiskRecord {
    type Error = Error;

    fn try_from(element: &Element) -> Result<Self> {
        let value = match element.value() {
            ElementValue::Null => StoredValue::Null,
            ElementValue::Bytes(b) => StoredValue::Bytes(b.to_vec()),
            ElementValue::Text(s) => StoredValue::Text(s.clone()),
            ElementValue::Integer(i) => StoredValue::Integer(*i),
            ElementValue::Json(v) => StoredValue::Json(
                serde_json::to_string(v).map_err(|e| Error::Serialization(e.to_string()))?,
            ),
            ElementValue::Opaque(_) => {
                return Err(Error::NotSerializable {
                    key: element.key().to_string(),
                })
            }
        };

        Ok(Self {
            key: element.key().clone(),
            value,
            version: element.version(),
            creation_time: element.creation_time(),
            last_access_time: element.last_access_time(),
            last_update_time: element.last_update_time(),
            hit_count: element.hit_count(),
            eternal: element.eternal(),
            time_to_live_seconds: element.time_to_live(),
            time_to_idle_seconds: element.time_to_idle(),
        })
    }
}

impl TryFrom<DiskRecord> for Element {
    type Error = Error;

    fn try_from(record: DiskRecord) -> Result<Self> {
        let value = match record.value {
            StoredValue::Null => ElementValue::Null,
            StoredValue::Bytes(b) => ElementValue::Bytes(Bytes::from(b)),
            StoredValue::Text(s) => ElementValue::Text(s),
            StoredValue::Integer(i) => ElementValue::Integer(i),
            StoredValue::Json(s) => ElementValue::Json(
                serde_json::from_str(&s).map_err(|e| Error::Serialization(e.to_string()))?,
            ),
        };

        Ok(Element::from_parts(
            record.key,
            value,
            record.version,
            record.creation_time,
            record.last_access_time,
            record.last_update_time,
            record.hit_count,
            record.eternal,
            record.time_to_live_seconds,
            record.time_to_idle_seconds,
        ))
    }
}

/// Encodes elements to (optionally compressed) bytes and back
pub struct RecordCodec {
    compressor: RecordCompressor,
}

impl RecordCodec {
    pub fn new(compression: CompressionAlgorithm) -> Self {
        Self {
            compressor: RecordCompressor::new(compression),
        }
    }

    pub fn encode(&self, element: &Element) -> Result<(Vec<u8>, CompressionAlgorithm)> {
        let record = DiskRecord::try_from(element)?;
        let raw = bincode::serialize(&record)?;
        Ok(self.compressor.compress(raw))
    }

    pub fn decode(&self, stored: Vec<u8>, algorithm: CompressionAlgorithm) -> Result<Element> {
        let raw = self.compressor.decompress(stored, algorithm)?;
        let record: DiskRecord = bincode::deserialize(&raw)?;
        Element::try_from(record)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::element::OpaqueValue;

    #[test]
    fn test_metadata_survives_encoding() {
        let codec = RecordCodec::new(CompressionAlgorithm::Lz4);
        let mut element = Element::new_at(42i64, "value", 1_000)
            .with_time_to_live(30)
            .with_eternal(false)
            .with_version(7);
        element.record_access(2_000);
        element.record_update(3_000, 7);

        let (stored, algorithm) = codec.encode(&element).unwrap();
        let decoded = codec.decode(stored, algorithm).unwrap();

        assert_eq!(decoded, element);
        assert_eq!(decoded.version(), 8);
        assert_eq!(decoded.hit_count(), 1);
    }

    #[test]
    fn test_json_values() {
        let codec = RecordCodec::new(CompressionAlgorithm::None);
        let element = Element::new("doc", serde_json::json!({"a": [1, 2, {"b": null}]}));

        let (stored, algorithm) = codec.encode(&element).unwrap();
        assert_eq!(codec.decode(stored, algorithm).unwrap(), element);
    }

    #[test]
    fn test_large_values_compress() {
        let codec = RecordCodec::new(CompressionAlgorithm::Lz4);
        let element = Element::new("big", vec![7u8; 64 * 1024]);

        let (stored, algorithm) = codec.encode(&element).unwrap();
        assert_eq!(algorithm, CompressionAlgorithm::Lz4);
        assert!(stored.len() < 64 * 1024);
        assert_eq!(codec.decode(stored, algorithm).unwrap(), element);
    }

    #[test]
    fn test_opaque_values_rejected() {
        let codec = RecordCodec::new(CompressionAlgorithm::None);
        let element = Element::new("k", OpaqueValue::new(1u8));

        assert!(matches!(
            codec.encode(&element),
            Err(Error::NotSerializable { .. })
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        let codec = RecordCodec::new(CompressionAlgorithm::None);
        assert!(codec
            .decode(vec![0xff, 0xff, 0xff], CompressionAlgorithm::None)
            .is_err());
    }
}
