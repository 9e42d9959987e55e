//! Disk Record Compression
//!
//! Optional LZ4 compression of encoded element records before they are
//! written to the data file. Each record remembers the algorithm it was
//! written with, so toggling compression never invalidates existing data.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported record compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Stored as encoded
    #[default]
    None,
    /// LZ4 block compression
    Lz4,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for CompressionAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressionAlgorithm::None),
            "lz4" => Ok(CompressionAlgorithm::Lz4),
            other => Err(Error::Config(format!("unknown compression: {}", other))),
        }
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    fn algorithm(&self) -> CompressionAlgorithm;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through compressor
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// LZ4 block compressor (size-prefixed blocks)
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(data, Some(lz4::block::CompressionMode::FAST(1)), true).map_err(
            |e| Error::CompressionFailed {
                algorithm: "LZ4".into(),
                reason: e.to_string(),
            },
        )
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Record Compressor
// =============================================================================

/// Compresses records with the configured algorithm, falling back to
/// storing them uncompressed when that does not pay off
pub struct RecordCompressor {
    algorithm: CompressionAlgorithm,
    /// Records smaller than this are never compressed
    min_size_bytes: usize,
    noop: NoopCompressor,
    lz4: Lz4Compressor,
}

impl RecordCompressor {
    /// Default threshold below which records are stored as is
    pub const DEFAULT_MIN_SIZE: usize = 256;

    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        Self::with_min_size(algorithm, Self::DEFAULT_MIN_SIZE)
    }

    pub fn with_min_size(algorithm: CompressionAlgorithm, min_size_bytes: usize) -> Self {
        Self {
            algorithm,
            min_size_bytes,
            noop: NoopCompressor,
            lz4: Lz4Compressor,
        }
    }

    fn compressor(&self, algorithm: CompressionAlgorithm) -> &dyn Compressor {
        match algorithm {
            CompressionAlgorithm::None => &self.noop,
            CompressionAlgorithm::Lz4 => &self.lz4,
        }
    }

    /// Compress a record, returning the bytes to store and how they were stored
    pub fn compress(&self, record: Vec<u8>) -> (Vec<u8>, CompressionAlgorithm) {
        if self.algorithm == CompressionAlgorithm::None || record.len() < self.min_size_bytes {
            return (record, CompressionAlgorithm::None);
        }

        match self.compressor(self.algorithm).compress(&record) {
            Ok(compressed) if compressed.len() < record.len() => (compressed, self.algorithm),
            Ok(_) => (record, CompressionAlgorithm::None),
            Err(e) => {
                tracing::warn!(algorithm = %self.algorithm, error = %e, "Record compression failed, storing uncompressed");
                (record, CompressionAlgorithm::None)
            }
        }
    }

    /// Restore a record stored with `algorithm`
    pub fn decompress(&self, stored: Vec<u8>, algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
        match algorithm {
            CompressionAlgorithm::None => Ok(stored),
            other => self.compressor(other).decompress(&stored),
        }
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn repetitive(len: usize) -> Vec<u8> {
        b"element-record;".iter().cycle().take(len).copied().collect()
    }

    #[test]
    fn test_lz4_compressor() {
        let data = repetitive(4096);
        let compressed = Lz4Compressor.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(Lz4Compressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_record_compressor_lz4() {
        let compressor = RecordCompressor::new(CompressionAlgorithm::Lz4);
        let data = repetitive(4096);

        let (stored, algorithm) = compressor.compress(data.clone());
        assert_eq!(algorithm, CompressionAlgorithm::Lz4);
        assert!(stored.len() < data.len());
        assert_eq!(compressor.decompress(stored, algorithm).unwrap(), data);
    }

    #[test]
    fn test_small_records_stored_raw() {
        let compressor = RecordCompressor::new(CompressionAlgorithm::Lz4);
        let (stored, algorithm) = compressor.compress(b"tiny".to_vec());
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(stored, b"tiny");
    }

    #[test]
    fn test_disabled_compression() {
        let compressor = RecordCompressor::new(CompressionAlgorithm::None);
        let data = repetitive(4096);
        let (stored, algorithm) = compressor.compress(data.clone());
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(stored, data);
    }

    #[test]
    fn test_corrupt_lz4_block() {
        let compressor = RecordCompressor::new(CompressionAlgorithm::Lz4);
        let result = compressor.decompress(vec![0xff; 3], CompressionAlgorithm::Lz4);
        assert!(matches!(result, Err(Error::DecompressionFailed { .. })));
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("LZ4".parse::<CompressionAlgorithm>().unwrap(), CompressionAlgorithm::Lz4);
        assert_eq!(CompressionAlgorithm::None.to_string(), "none");
        assert!("zstd".parse::<CompressionAlgorithm>().is_err());
    }
}
