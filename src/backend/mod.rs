//! Backend interface: the primitives the consistency layer is built on.
//!
//! The layer does not store bytes itself; it relies on an external
//! memcached-like store that provides atomic insert-if-absent and
//! compare-and-swap. Everything else (locking, versioning, tag floors) is
//! built out of these four primitives plus multi-get.

use crate::error::Result;

pub mod inmemory;

pub use inmemory::InMemoryBackend;

use std::collections::HashMap;

/// A stored value together with its CAS token.
///
/// The token is opaque; presenting it on a [`CacheBackend::cas`] write makes
/// the write succeed only if the value is unchanged since the read.
#[derive(Clone, Debug, PartialEq)]
pub struct CasValue {
    pub data: Vec<u8>,
    pub cas: u64,
}

/// Trait for the key-value store underneath the pool.
///
/// TTLs are in seconds with memcached semantics: `0` means unbounded.
///
/// **IMPORTANT:** All methods take `&self`; implementations use interior
/// mutability so a backend handle can be cloned across tasks cheaply.
///
/// # Errors
///
/// Connectivity failures are reported as `Error::ConnectionError`; a lost
/// CAS race or an already-present key on `add` is `Ok(false)`, not an error.
#[allow(async_fn_in_trait)]
pub trait CacheBackend: Send + Sync + Clone {
    /// Read one value with its CAS token. `Ok(None)` on a miss.
    async fn get(&self, key: &str) -> Result<Option<CasValue>>;

    /// Read several values with CAS tokens; missing keys are absent from
    /// the result map.
    async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, CasValue>> {
        let mut results = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                results.insert((*key).to_string(), value);
            }
        }
        Ok(results)
    }

    /// Atomic insert-if-absent. `Ok(false)` if the key already exists.
    async fn add(&self, key: &str, value: Vec<u8>, ttl_secs: u32) -> Result<bool>;

    /// CAS-conditioned update. `Ok(false)` if the stored value changed
    /// since `token` was issued or the key no longer exists.
    async fn cas(&self, token: u64, key: &str, value: Vec<u8>, ttl_secs: u32) -> Result<bool>;

    /// Unconditional write. Used only for the liveness probe and for
    /// immediate invalidation records.
    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: u32) -> Result<bool>;

    /// Re-establish connectivity after a failed call.
    ///
    /// Backends without a connection (in-memory) accept the default no-op.
    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }
}
