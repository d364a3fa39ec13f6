//! In-memory CAS backend (reference implementation, thread-safe, async).
//!
//! Uses DashMap for lock-free concurrent access with per-key sharding. CAS
//! tokens come from a process-wide counter; TTL expiration is handled on
//! access. This is the backend the test suite runs the full protocol
//! against, and it implements exactly the semantics the pool assumes of a
//! production store: atomic `add`, token-checked `cas`, multi-get with
//! tokens.

use super::{CacheBackend, CasValue};
use crate::error::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct StoredEntry {
    data: Vec<u8>,
    cas: u64,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn new(data: Vec<u8>, cas: u64, ttl_secs: u32) -> Self {
        let expires_at = if ttl_secs == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_secs(u64::from(ttl_secs)))
        };
        StoredEntry {
            data,
            cas,
            expires_at,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

/// Thread-safe in-memory backend with CAS semantics.
///
/// # Example
///
/// ```no_run
/// use tcache::backend::{CacheBackend, InMemoryBackend};
///
/// #[tokio::main]
/// async fn main() -> tcache::Result<()> {
///     let backend = InMemoryBackend::new();
///
///     assert!(backend.add("key", b"value".to_vec(), 0).await?);
///     // Second add loses: the key exists.
///     assert!(!backend.add("key", b"other".to_vec(), 0).await?);
///
///     let read = backend.get("key").await?.expect("present");
///     assert!(backend.cas(read.cas, "key", b"updated".to_vec(), 0).await?);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct InMemoryBackend {
    store: Arc<DashMap<String, StoredEntry>>,
    cas_counter: Arc<AtomicU64>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        InMemoryBackend {
            store: Arc::new(DashMap::new()),
            // Tokens start above zero so a zeroed token never matches.
            cas_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Current number of live entries (expired ones included until touched).
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn next_cas(&self) -> u64 {
        self.cas_counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<CasValue>> {
        if let Some(entry) = self.store.get(key) {
            if !entry.is_expired() {
                debug!("✓ InMemory GET {} -> HIT (cas {})", key, entry.cas);
                return Ok(Some(CasValue {
                    data: entry.data.clone(),
                    cas: entry.cas,
                }));
            }
        }

        // Drop the expired entry, if any.
        self.store.remove_if(key, |_, entry| entry.is_expired());
        debug!("✓ InMemory GET {} -> MISS", key);
        Ok(None)
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, CasValue>> {
        let mut results = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                results.insert((*key).to_string(), value);
            }
        }
        debug!("✓ InMemory MGET {} keys -> {} hits", keys.len(), results.len());
        Ok(results)
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl_secs: u32) -> Result<bool> {
        let cas = self.next_cas();
        match self.store.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredEntry::new(value, cas, ttl_secs));
                    debug!("✓ InMemory ADD {} -> OK (over expired)", key);
                    Ok(true)
                } else {
                    debug!("✗ InMemory ADD {} -> EXISTS", key);
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::new(value, cas, ttl_secs));
                debug!("✓ InMemory ADD {} -> OK", key);
                Ok(true)
            }
        }
    }

    async fn cas(&self, token: u64, key: &str, value: Vec<u8>, ttl_secs: u32) -> Result<bool> {
        let cas = self.next_cas();
        match self.store.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.is_expired() || current.cas != token {
                    debug!("✗ InMemory CAS {} -> TOKEN MISMATCH", key);
                    return Ok(false);
                }
                occupied.insert(StoredEntry::new(value, cas, ttl_secs));
                debug!("✓ InMemory CAS {} -> OK (cas {})", key, cas);
                Ok(true)
            }
            Entry::Vacant(_) => {
                debug!("✗ InMemory CAS {} -> NOT FOUND", key);
                Ok(false)
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: u32) -> Result<bool> {
        let cas = self.next_cas();
        self.store
            .insert(key.to_string(), StoredEntry::new(value, cas, ttl_secs));
        debug!("✓ InMemory SET {} (ttl {}s)", key, ttl_secs);
        Ok(true)
    }
}
