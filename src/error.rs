//! Error types for tiercache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by loader implementations
pub type LoaderError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur in tiercache
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Data operation on a cache that is not alive
    #[error("Cache {cache} is not alive")]
    NotAlive { cache: String },

    /// Lifecycle operation not permitted in the current status
    #[error("Cannot {operation} cache {cache} while it is {status}")]
    InvalidState {
        cache: String,
        status: String,
        operation: String,
    },

    /// Cache name rejected
    #[error("Invalid cache name: {0:?}")]
    InvalidName(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// A cache with the same name is already registered
    #[error("Cache already exists: {0}")]
    CacheExists(String),

    /// No cache registered under the name
    #[error("Cache not found: {0}")]
    CacheNotFound(String),

    /// The cache manager has been shut down
    #[error("Cache manager has been shut down")]
    ManagerShutdown,

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Loader failed to produce a value
    #[error("Loader for cache {cache} failed on key {key}: {source}")]
    Loader {
        cache: String,
        key: String,
        #[source]
        source: LoaderError,
    },

    /// Synchronous bootstrap failed
    #[error("Bootstrap of cache {cache} failed: {reason}")]
    Bootstrap { cache: String, reason: String },

    // =========================================================================
    // Disk Tier Errors
    // =========================================================================
    /// Element value cannot be written to disk
    #[error("Element {key} holds a value that cannot be serialized")]
    NotSerializable { key: String },

    /// Record encoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Disk data or index could not be decoded
    #[error("Disk store of cache {cache} is corrupt: {reason}")]
    Corrupt { cache: String, reason: String },

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Whether the error reports a cache that is not (or no longer) alive
    pub fn is_not_alive(&self) -> bool {
        matches!(self, Error::NotAlive { .. })
    }
}
