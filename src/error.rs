//! Error types for the consistency layer.

use std::fmt;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the consistency layer.
///
/// All operations return `Result<T>` where `Result` is defined as `std::result::Result<T, Error>`.
///
/// Note that a lost CAS race is *not* an error: `save` and the lock engine
/// report it as `Ok(false)`, and callers are expected to treat it as
/// "another writer already rebuilt this".
#[derive(Debug, Clone)]
pub enum Error {
    /// Invalid caller input: empty or reserved key names, over-length tag
    /// names, a null value, malformed expiry.
    ///
    /// Always synchronous, always surfaced, never retried.
    InvalidArgument(String),

    /// Configuration error during pool construction.
    ///
    /// Common causes:
    /// - Empty server list for the value or tag role
    /// - Malformed `host:port` address
    ///
    /// **Recovery:** Fix configuration and restart.
    ConfigError(String),

    /// A backend call failed to complete (connection lost, timeout).
    ///
    /// Policy: the pool reconnects and retries once; a second failure
    /// permanently degrades the pool to a no-op (fail-open breaker).
    ConnectionError(String),

    /// Serialization of a record for backend storage failed.
    SerializationError(String),

    /// Deserialization of a stored record failed.
    ///
    /// This indicates corrupted or foreign data under a cache key.
    ///
    /// **Recovery:** The entry should be treated as absent and rebuilt.
    DeserializationError(String),

    /// Operation is not part of the supported surface.
    ///
    /// Bulk multi-key fetch, deferred save and commit are unsupported by
    /// design; callers must use per-key `get_item`/`save`.
    NotSupported(String),

    /// Generic error with custom message.
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::ConnectionError(msg) => write!(f, "Connection error: {}", msg),
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Error::NotSupported(msg) => write!(f, "Not supported: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_syntax() || e.is_data() || e.is_eof() {
            Error::DeserializationError(e.to_string())
        } else {
            Error::SerializationError(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::ConnectionError(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}
