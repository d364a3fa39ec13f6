//! The cache session: one logical get/save/delete cycle per key.
//!
//! A `Pool` orchestrates the read/write/invalidate protocol on top of the
//! backend primitives: it decides validity from version and tag records,
//! runs the stampede-prevention protocol (acquire the build lock versus
//! poll-and-wait), writes new versions, tags and data under CAS, and
//! manages connection-loss degradation.
//!
//! Reads never error for "key does not exist" or "key is stale"; those
//! outcomes come back as `Ok(None)` plus a [`Status`], so stampede handling
//! is plain control flow:
//!
//! ```no_run
//! use tcache::{backend::InMemoryBackend, CacheItem, Pool, Status};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> tcache::Result<()> {
//!     let backend = InMemoryBackend::new();
//!     let mut pool = Pool::with_backends(backend.clone(), backend).await;
//!
//!     match pool.get_item("report_42").await? {
//!         Some(item) => println!("hit: {}", item.value()),
//!         None if pool.status() == Status::NotExistUnderConstruction => {
//!             // This session won the build lock; rebuild and publish.
//!             let item = CacheItem::new(
//!                 "report_42",
//!                 json!({"rows": 10}),
//!                 vec!["reports".into()],
//!                 None,
//!             )?;
//!             pool.save(&item).await?;
//!         }
//!         None => { /* someone else is building, or the pool degraded */ }
//!     }
//!     Ok(())
//! }
//! ```

use crate::backend::{CacheBackend, CasValue};
use crate::clock;
use crate::config::{CacheServer, PoolConfig};
use crate::error::{Error, Result};
use crate::expire::Expirer;
use crate::item::CacheItem;
use crate::key;
use crate::lock::{CasLock, SessionState, Status};
use crate::serialization;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Seconds a key revalidation is assumed to take; used as the lock TTL and
/// as the basis for poll spacing.
pub const DEFAULT_TIME_TO_REBUILD: u32 = 2;

/// How many times a waiting session polls for a key under construction
/// before giving up and building itself. Zero means "never wait".
pub const DEFAULT_REBUILD_CHECK_COUNT: u32 = 0;

/// Default storage TTL for entry payloads; zero is unbounded.
const DEFAULT_STORAGE_TTL: u32 = 0;

/// Reserved key used for the connect-time liveness probe.
const TEST_KEY_NAME: &str = "test_key";

/// Entry payload stored under the sanitized key.
///
/// `tags` records, per tag, the invalidation floor in effect when the entry
/// was built; `data` is the caller's value as JSON bytes. Only a session
/// holding the build lock writes one of these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct CacheRecord {
    pub version: f64,
    pub tags: BTreeMap<String, f64>,
    pub data: Vec<u8>,
}

/// Backend handles for one live pool, per logical role.
struct LiveBackends<B: CacheBackend> {
    values: B,
    tags: B,
    lock: CasLock<B>,
}

impl<B: CacheBackend> Clone for LiveBackends<B> {
    fn clone(&self) -> Self {
        LiveBackends {
            values: self.values.clone(),
            tags: self.tags.clone(),
            lock: self.lock.clone(),
        }
    }
}

/// Connection state of the pool.
///
/// `Degraded` is permanent for the lifetime of the pool: after repeated
/// connectivity failure every operation short-circuits to "not found" /
/// `false`. Availability over consistency, by explicit policy.
enum Backends<B: CacheBackend> {
    Live(LiveBackends<B>),
    Degraded,
}

/// A cache session over two backend roles (values, tags/locks).
///
/// One `Pool` instance serves one logical request at a time; independent
/// processes or tasks each own their instance, and all coordination between
/// them happens through the backend's `add`/`cas` primitives.
pub struct Pool<B: CacheBackend> {
    backends: Backends<B>,
    state: SessionState,
    /// Deduplicated tag names to materialize on the next committed save.
    tags: Vec<String>,
    /// The key this session is authorized to write; set when this session
    /// becomes the builder, compared against the saved item's key.
    build_key: Option<String>,
    time_to_rebuild: u32,
    count_to_rebuild: u32,
    rebuild_check_period: Option<f64>,
}

impl<B: CacheBackend> Pool<B> {
    /// Build a pool over already-constructed backends and probe both roles.
    ///
    /// A failed probe yields a degraded (no-op) pool rather than an error:
    /// the caller keeps a working handle either way.
    pub async fn with_backends(values: B, tags: B) -> Self {
        let backends = match Self::probe(&values, &tags).await {
            Ok(()) => {
                info!("✓ Cache pool connected (value + tag roles probed)");
                Backends::Live(LiveBackends {
                    values,
                    lock: CasLock::new(tags.clone()),
                    tags,
                })
            }
            Err(e) => {
                warn!("⚠ Cache pool degraded to no-op: {}", e);
                Backends::Degraded
            }
        };

        Pool {
            backends,
            state: SessionState::default(),
            tags: Vec::new(),
            build_key: None,
            time_to_rebuild: DEFAULT_TIME_TO_REBUILD,
            count_to_rebuild: DEFAULT_REBUILD_CHECK_COUNT,
            rebuild_check_period: None,
        }
    }

    /// Validate `config` and build one backend per role through `factory`.
    ///
    /// # Errors
    ///
    /// `Error::ConfigError` is fatal: an empty or malformed server list is
    /// a deployment mistake, not a runtime condition to degrade over.
    pub async fn connect<F>(config: &PoolConfig, factory: F) -> Result<Self>
    where
        F: Fn(&[CacheServer]) -> Result<B>,
    {
        config.validate()?;
        let values = factory(&config.value_servers)?;
        let tags = factory(config.tag_servers())?;
        Ok(Self::with_backends(values, tags).await)
    }

    async fn probe(values: &B, tags: &B) -> Result<()> {
        let stamp = serialization::encode(&clock::now())?;
        let values_ok = values.set(TEST_KEY_NAME, stamp.clone(), 1).await?;
        let tags_ok = tags.set(TEST_KEY_NAME, stamp, 1).await?;
        if values_ok && tags_ok {
            Ok(())
        } else {
            Err(Error::ConnectionError("liveness probe write refused".to_string()))
        }
    }

    /// Whether the pool has permanently degraded to a no-op.
    pub fn is_degraded(&self) -> bool {
        matches!(self.backends, Backends::Degraded)
    }

    /// Status of the last `get_item` call.
    pub fn status(&self) -> Status {
        self.state.status
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Fetch `key`, deciding between serving it, serving it stale, or
    /// electing this session as the builder.
    ///
    /// Returns `Ok(None)` with a telling [`Status`]:
    /// - `NotExistUnderConstruction` / `ExpiredUnderConstruction`: this
    ///   session must build the value and call [`save`](Self::save);
    /// - `BuildOutside`: this session still holds a lock from an earlier
    ///   `get_item` and must finish that build first;
    /// - `Unknown`: the pool is degraded.
    ///
    /// When another session is already building and this one is configured
    /// to wait (`count_to_rebuild > 0`), the call polls up to that many
    /// times with `rebuild_check_period` spacing before giving up and
    /// electing itself.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` for an empty or reserved key name.
    pub async fn get_item(&mut self, key: &str) -> Result<Option<CacheItem>> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty cache key".to_string()));
        }
        if key == TEST_KEY_NAME {
            return Err(Error::InvalidArgument(format!(
                "reserved cache key: {}",
                TEST_KEY_NAME
            )));
        }

        if self.state.lock_cas.is_some() {
            self.state.status = Status::BuildOutside;
            return Ok(None);
        }

        let key = key::sanitize_key(key);
        let version_key = key::version_key(&key);

        // Bounded poll loop; each pass re-reads entry and version.
        loop {
            let role = match &self.backends {
                Backends::Live(role) => role.clone(),
                Backends::Degraded => return Ok(None),
            };

            let fetched = match self
                .fetch_with_reconnect(&role, &[key.as_str(), version_key.as_str()])
                .await?
            {
                Some(fetched) => fetched,
                // Second connectivity failure; the pool just degraded.
                None => return Ok(None),
            };

            let entry = fetched.get(key.as_str());
            self.state.data_cas = entry.map(|v| v.cas);
            self.state.version = fetched
                .get(version_key.as_str())
                .and_then(|v| current_version(&v.data));

            let record = entry.and_then(|value| decode_record(&key, value));
            let time_to_rebuild = f64::from(self.time_to_rebuild);

            let Some(record) = record else {
                // Missing (or unreadable) entry: only the lock holder may
                // write it, so try to become the builder first.
                let locked = role.lock.lock(&mut self.state, &key, time_to_rebuild).await?;
                if locked || self.count_to_rebuild == 0 {
                    self.state.status = Status::NotExistUnderConstruction;
                    self.build_key = Some(key.clone());
                    self.reset_rebuild_tuning();
                    return Ok(None);
                }

                let period = match self.rebuild_check_period {
                    Some(period) => period,
                    None => {
                        let period = time_to_rebuild / f64::from(self.count_to_rebuild);
                        self.set_rebuild_check_period(Some(period));
                        period
                    }
                };

                debug!(
                    "Key {} under construction elsewhere; polling again in {:.3}s ({} checks left)",
                    key, period, self.count_to_rebuild
                );
                tokio::time::sleep(Duration::from_secs_f64(period)).await;
                self.set_count_to_rebuild(Some(self.count_to_rebuild - 1));
                continue;
            };

            let needs_rebuild = match self.state.version {
                None => true,
                Some(version) => {
                    version > record.version
                        || !self.tags_are_valid(&role, &record.tags).await?
                }
            };

            if needs_rebuild
                && role.lock.lock(&mut self.state, &key, time_to_rebuild).await?
            {
                self.state.status = Status::ExpiredUnderConstruction;
                self.build_key = Some(key.clone());
                return Ok(None);
            }

            self.state.status = if needs_rebuild {
                // Someone else is rebuilding; serve the stale entry as-is.
                Status::Expired
            } else {
                Status::Actual
            };

            let value = serde_json::from_slice(&record.data)?;
            let tag_names = record.tags.keys().cloned().collect();
            return Ok(Some(CacheItem::hit(key, value, tag_names)));
        }
    }

    /// `get_item(key)` reduced to presence.
    pub async fn has_item(&mut self, key: &str) -> Result<bool> {
        Ok(self.get_item(key).await?.is_some())
    }

    /// Multi-get on `fetch_role` with the reconnect-once / degrade-on-second
    /// -failure policy. `Ok(None)` means the pool is now degraded.
    async fn fetch_with_reconnect(
        &mut self,
        role: &LiveBackends<B>,
        keys: &[&str],
    ) -> Result<Option<std::collections::HashMap<String, CasValue>>> {
        match role.values.get_multi(keys).await {
            Ok(fetched) => Ok(Some(fetched)),
            Err(Error::ConnectionError(_)) => {
                let _ = role.values.reconnect().await;
                match role.values.get_multi(keys).await {
                    Ok(fetched) => Ok(Some(fetched)),
                    Err(Error::ConnectionError(e)) => {
                        warn!("⚠ Backend unreachable after reconnect, degrading pool: {}", e);
                        self.backends = Backends::Degraded;
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Check the entry's captured tag floors against the live ones.
    ///
    /// A missing live tag record counts as invalidating, as does any live
    /// floor above the captured one.
    async fn tags_are_valid(
        &self,
        role: &LiveBackends<B>,
        captured: &BTreeMap<String, f64>,
    ) -> Result<bool> {
        if captured.is_empty() {
            return Ok(true);
        }

        let names: Vec<String> = captured.keys().cloned().collect();
        let live = Expirer::new(role.tags.clone(), role.tags.clone())
            .current_floors(&names)
            .await?;

        for (name, captured_floor) in captured {
            match live.get(name) {
                None => return Ok(false),
                Some(floor) if *floor > *captured_floor => return Ok(false),
                Some(_) => {}
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Publish an item built by this session.
    ///
    /// Returns `Ok(false)` when this session was never granted builder
    /// status for the item's key, lost its lock, lost the CAS race to a
    /// concurrent writer, or discovered a tag invalidated after the build
    /// started. All of those mean "discard this attempt"; none are faults.
    ///
    /// Whatever the outcome, the rebuild tuning is reset to defaults and
    /// the lock is released.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` for the reserved key name or an over-length
    /// tag name. (A null value cannot occur: [`CacheItem::new`] rejects it.)
    pub async fn save(&mut self, item: &CacheItem) -> Result<bool> {
        if item.key() == TEST_KEY_NAME {
            return Err(Error::InvalidArgument(format!(
                "key name can not be: {}",
                TEST_KEY_NAME
            )));
        }
        if self.build_key.as_deref() != Some(item.key()) {
            debug!("✗ save({}) refused: not this session's build key", item.key());
            return Ok(false);
        }
        if !key::check_tags_length(item.tags()) {
            return Err(Error::InvalidArgument("bad tag name length".to_string()));
        }
        self.tags = dedup_tags(item.tags());

        let role = match &self.backends {
            Backends::Live(role) => role.clone(),
            Backends::Degraded => return Ok(false),
        };

        if self.state.lock_cas.is_none() {
            // Listed as builder but the lock is gone; nothing to commit.
            self.build_key = None;
            return Ok(false);
        }

        let result = self.write_entry(&role, item).await;

        self.reset_rebuild_tuning();
        let _ = role.lock.unlock(&mut self.state).await;
        result
    }

    /// The committed part of `save`: version, tags, then the entry itself.
    async fn write_entry(&mut self, role: &LiveBackends<B>, item: &CacheItem) -> Result<bool> {
        let key = self.state.key_name.clone();
        let entry_ttl = item.expire_after().unwrap_or(DEFAULT_STORAGE_TTL);

        // The version is inserted-if-absent: concurrent writers reuse the
        // first one to land, reconciled by max on read.
        let version = match self.state.version {
            Some(version) => version,
            None => {
                let version = clock::normalize(clock::now());
                let bytes = serialization::encode(&vec![version])?;
                if !role
                    .values
                    .add(&key::version_key(&key), bytes, entry_ttl)
                    .await?
                {
                    debug!("✗ save({}) lost the version insert race", key);
                    return Ok(false);
                }
                version
            }
        };

        let mut resolved_tags = BTreeMap::new();
        if !self.tags.is_empty() {
            let lock_time = self.state.lock_time.unwrap_or_else(|| clock::normalize(clock::now()));
            let floors = self.materialize_tags(role, lock_time).await?;

            // A floor above our lock time means the tag was invalidated
            // after this build started: publishing would be stale-by-tag
            // at birth. Equal floors are our own materialization.
            if floors.values().any(|floor| *floor > lock_time) {
                debug!("✗ save({}) aborted: tag invalidated during build", key);
                return Ok(false);
            }
            resolved_tags = floors;
        }

        let record = CacheRecord {
            version,
            tags: resolved_tags,
            data: serde_json::to_vec(item.value())?,
        };
        let bytes = serialization::encode(&record)?;

        let written = match self.state.data_cas {
            None => role.values.add(&key, bytes, entry_ttl).await?,
            Some(cas) => role.values.cas(cas, &key, bytes, DEFAULT_STORAGE_TTL).await?,
        };

        if written {
            debug!("✓ save({}) committed version {}", key, version);
        } else {
            debug!("✗ save({}) lost the data write race", key);
        }
        Ok(written)
    }

    /// Ensure every pending tag has a record and return the resolved
    /// floors, keyed by tag name.
    ///
    /// Missing tags are created with the session's lock time as their
    /// floor; the create-then-refetch cycle repeats until every tag
    /// resolves, covering races with concurrent tag creation.
    async fn materialize_tags(
        &self,
        role: &LiveBackends<B>,
        lock_time: f64,
    ) -> Result<BTreeMap<String, f64>> {
        let expirer = Expirer::new(role.tags.clone(), role.tags.clone());
        let stamp = serialization::encode(&vec![lock_time])?;

        loop {
            for tag in &self.tags {
                let _ = role.tags.add(&key::tag_key(tag), stamp.clone(), 0).await?;
            }

            let floors = expirer.current_floors(&self.tags).await?;
            if floors.len() == self.tags.len() {
                return Ok(floors.into_iter().collect());
            }
            // A concurrent deletion raced our add; try again.
        }
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    /// Invalidate `key` immediately through its version record.
    ///
    /// The entry payload is left in place; readers re-validate and find the
    /// version stale. Returns `Ok(true)` even for a key never created.
    pub async fn delete_item(&mut self, key: &str) -> Result<bool> {
        self.delete_items(&[key.to_string()]).await
    }

    /// Immediate version-record invalidation of several keys.
    pub async fn delete_items(&mut self, keys: &[String]) -> Result<bool> {
        let role = match &self.backends {
            Backends::Live(role) => role.clone(),
            Backends::Degraded => return Ok(false),
        };
        Expirer::new(role.values.clone(), role.tags.clone())
            .expire_keys(keys, true)
            .await
    }

    /// Invalidate `key` through the delayed path with a caller-supplied
    /// window (seconds); zero falls back to the default window.
    pub async fn delete_item_delay(&mut self, key: &str, delay_secs: u32) -> Result<bool> {
        let role = match &self.backends {
            Backends::Live(role) => role.clone(),
            Backends::Degraded => return Ok(false),
        };
        let mut expirer = Expirer::new(role.values.clone(), role.tags.clone());
        expirer.set_expire_time(delay_secs);
        let result = expirer.expire_keys(&[key.to_string()], false).await;
        expirer.reset_expire_time();
        result
    }

    /// Invalidate every key tagged `tag`, with the default delay window.
    pub async fn delete_by_tag(&mut self, tag: &str) -> Result<bool> {
        self.delete_by_tags(&[tag.to_string()]).await
    }

    /// Invalidate every key carrying any of `tags`, with the default delay
    /// window. On a connectivity failure the operation reconnects and
    /// retries once.
    pub async fn delete_by_tags(&mut self, tags: &[String]) -> Result<bool> {
        let role = match &self.backends {
            Backends::Live(role) => role.clone(),
            Backends::Degraded => return Ok(false),
        };

        let expirer = Expirer::new(role.tags.clone(), role.tags.clone());
        match expirer.expire_tags(tags, false).await {
            Err(Error::ConnectionError(_)) => {
                let _ = role.tags.reconnect().await;
                expirer.expire_tags(tags, false).await
            }
            other => other,
        }
    }

    /// Release any lock held by this session. A session reset, not a
    /// backend flush; always reports success.
    pub async fn clear(&mut self) -> Result<bool> {
        if let Backends::Live(role) = &self.backends {
            let lock = role.lock.clone();
            let _ = lock.unlock(&mut self.state).await;
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Unsupported surface
    // ------------------------------------------------------------------

    /// Bulk fetch is unsupported by design; use per-key `get_item`.
    pub async fn get_items(&mut self, _keys: &[String]) -> Result<Vec<CacheItem>> {
        Err(Error::NotSupported("bulk fetch".to_string()))
    }

    /// Deferred save is unsupported by design; use `save`.
    pub async fn save_deferred(&mut self, _item: &CacheItem) -> Result<bool> {
        Err(Error::NotSupported("deferred save".to_string()))
    }

    /// Two-phase commit is unsupported by design.
    pub async fn commit(&mut self) -> Result<bool> {
        Err(Error::NotSupported("deferred commit".to_string()))
    }

    // ------------------------------------------------------------------
    // Rebuild tuning
    // ------------------------------------------------------------------

    /// Seconds a rebuild is assumed to take (lock TTL and poll budget).
    pub fn time_to_rebuild(&self) -> u32 {
        self.time_to_rebuild
    }

    /// `None` or zero restores the default.
    pub fn set_time_to_rebuild(&mut self, seconds: Option<u32>) {
        self.time_to_rebuild = seconds.filter(|t| *t > 0).unwrap_or(DEFAULT_TIME_TO_REBUILD);
    }

    /// How many times this session polls for a key under construction.
    pub fn count_to_rebuild(&self) -> u32 {
        self.count_to_rebuild
    }

    /// `None` or zero restores the default (no waiting).
    pub fn set_count_to_rebuild(&mut self, count: Option<u32>) {
        self.count_to_rebuild = count
            .filter(|c| *c > 0)
            .unwrap_or(DEFAULT_REBUILD_CHECK_COUNT);
    }

    /// Poll spacing in seconds; `None` means "derive from
    /// `time_to_rebuild / count_to_rebuild` on first wait".
    pub fn rebuild_check_period(&self) -> Option<f64> {
        self.rebuild_check_period
    }

    /// Non-positive values clear the override.
    pub fn set_rebuild_check_period(&mut self, period: Option<f64>) {
        self.rebuild_check_period = period.filter(|p| *p > 0.0);
    }

    fn reset_rebuild_tuning(&mut self) {
        self.set_count_to_rebuild(None);
        self.set_time_to_rebuild(None);
        self.set_rebuild_check_period(None);
    }
}

/// Max of a stored timestamp list; `None` for unreadable or empty records,
/// which callers treat as "version unknown, rebuild".
fn current_version(bytes: &[u8]) -> Option<f64> {
    let list: Vec<f64> = serialization::decode(bytes).ok()?;
    list.into_iter().fold(None, |acc, t| match acc {
        Some(current) if current >= t => Some(current),
        _ => Some(t),
    })
}

/// Decode an entry payload; corrupted or foreign bytes are treated as an
/// absent entry so the key gets rebuilt instead of erroring the read.
fn decode_record(key: &str, value: &CasValue) -> Option<CacheRecord> {
    match serialization::decode(&value.data) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("⚠ Unreadable entry under {}, treating as absent: {}", key, e);
            None
        }
    }
}

fn dedup_tags(tags: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tags.iter()
        .filter(|t| seen.insert((*t).clone()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Backend wrapper that can be switched into a connection-failure mode.
    #[derive(Clone)]
    struct FlakyBackend {
        inner: InMemoryBackend,
        fail_reads: Arc<AtomicBool>,
        fail_writes: Arc<AtomicBool>,
    }

    impl FlakyBackend {
        fn new() -> Self {
            FlakyBackend {
                inner: InMemoryBackend::new(),
                fail_reads: Arc::new(AtomicBool::new(false)),
                fail_writes: Arc::new(AtomicBool::new(false)),
            }
        }

        fn check(&self, flag: &AtomicBool) -> Result<()> {
            if flag.load(Ordering::SeqCst) {
                Err(Error::ConnectionError("injected failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl CacheBackend for FlakyBackend {
        async fn get(&self, key: &str) -> Result<Option<CasValue>> {
            self.check(&self.fail_reads)?;
            self.inner.get(key).await
        }

        async fn add(&self, key: &str, value: Vec<u8>, ttl_secs: u32) -> Result<bool> {
            self.check(&self.fail_writes)?;
            self.inner.add(key, value, ttl_secs).await
        }

        async fn cas(&self, token: u64, key: &str, value: Vec<u8>, ttl_secs: u32) -> Result<bool> {
            self.check(&self.fail_writes)?;
            self.inner.cas(token, key, value, ttl_secs).await
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: u32) -> Result<bool> {
            self.check(&self.fail_writes)?;
            self.inner.set(key, value, ttl_secs).await
        }
    }

    async fn pool() -> (Pool<InMemoryBackend>, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        let pool = Pool::with_backends(backend.clone(), backend.clone()).await;
        (pool, backend)
    }

    fn item(key: &str, value: serde_json::Value, tags: &[&str]) -> CacheItem {
        CacheItem::new(
            key,
            value,
            tags.iter().map(|t| t.to_string()).collect(),
            None,
        )
        .expect("valid item")
    }

    #[tokio::test]
    async fn test_get_item_rejects_empty_and_reserved_keys() {
        let (mut pool, _) = pool().await;
        assert!(matches!(
            pool.get_item("").await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            pool.get_item("test_key").await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_key_elects_builder() {
        let (mut pool, _) = pool().await;

        let result = pool.get_item("k").await.expect("Failed to get");
        assert!(result.is_none());
        assert_eq!(pool.status(), Status::NotExistUnderConstruction);
    }

    #[tokio::test]
    async fn test_save_then_get_roundtrip_is_actual() {
        let (mut pool, _) = pool().await;

        assert!(pool.get_item("k").await.expect("Failed to get").is_none());
        let saved = pool
            .save(&item("k", json!({"n": 1}), &["a", "b"]))
            .await
            .expect("Failed to save");
        assert!(saved);

        let read = pool
            .get_item("k")
            .await
            .expect("Failed to get")
            .expect("entry present");
        assert_eq!(pool.status(), Status::Actual);
        assert_eq!(read.key(), "k");
        assert_eq!(read.value(), &json!({"n": 1}));
        let mut tags = read.tags().to_vec();
        tags.sort();
        assert_eq!(tags, vec!["a".to_string(), "b".to_string()]);
        assert!(read.is_hit());
        assert_eq!(read.expire_after(), None);
    }

    #[tokio::test]
    async fn test_second_get_while_building_is_build_outside() {
        let (mut pool, _) = pool().await;

        assert!(pool.get_item("k").await.expect("Failed to get").is_none());
        assert_eq!(pool.status(), Status::NotExistUnderConstruction);

        // Same session, build still in flight.
        assert!(pool.get_item("k").await.expect("Failed to get").is_none());
        assert_eq!(pool.status(), Status::BuildOutside);

        // clear() releases the lock and makes the session usable again.
        assert!(pool.clear().await.expect("Failed to clear"));
        assert!(pool.get_item("k").await.expect("Failed to get").is_none());
        assert_eq!(pool.status(), Status::NotExistUnderConstruction);
    }

    #[tokio::test]
    async fn test_stampede_single_builder_may_save() {
        let backend = InMemoryBackend::new();
        let mut first = Pool::with_backends(backend.clone(), backend.clone()).await;
        let mut second = Pool::with_backends(backend.clone(), backend.clone()).await;

        assert!(first.get_item("k").await.expect("Failed to get").is_none());
        assert!(second.get_item("k").await.expect("Failed to get").is_none());
        assert_eq!(second.status(), Status::NotExistUnderConstruction);

        // Both were told to build, but only the lock holder may publish.
        assert!(!second
            .save(&item("k", json!("loser"), &[]))
            .await
            .expect("Failed to save"));
        assert!(first
            .save(&item("k", json!("winner"), &[]))
            .await
            .expect("Failed to save"));

        let read = first
            .get_item("k")
            .await
            .expect("Failed to get")
            .expect("entry present");
        assert_eq!(read.value(), &json!("winner"));
    }

    #[tokio::test]
    async fn test_save_refused_without_builder_status() {
        let (mut pool, _) = pool().await;
        // Never called get_item; no build key granted.
        assert!(!pool
            .save(&item("k", json!(1), &[]))
            .await
            .expect("Failed to save"));
    }

    #[tokio::test]
    async fn test_save_rejects_reserved_key_and_bad_tags() {
        let (mut pool, _) = pool().await;

        assert!(matches!(
            pool.save(&item("test_key", json!(1), &[])).await,
            Err(Error::InvalidArgument(_))
        ));

        assert!(pool.get_item("k").await.expect("Failed to get").is_none());
        let long_tag = "t".repeat(key::KEY_MAX_LEN + 1);
        let bad = CacheItem::new("k", json!(1), vec![long_tag], None).expect("valid item");
        assert!(matches!(
            pool.save(&bad).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_by_tag_expires_entry_but_keeps_value() {
        let backend = InMemoryBackend::new();
        let mut writer = Pool::with_backends(backend.clone(), backend.clone()).await;

        assert!(writer.get_item("k").await.expect("Failed to get").is_none());
        assert!(writer
            .save(&item("k", json!("v1"), &["t"]))
            .await
            .expect("Failed to save"));

        assert!(writer.delete_by_tag("t").await.expect("Failed to delete"));

        // The pending floor at now + EXPIRE_DELAY already exceeds the
        // floor captured at build time, so the entry is stale at once.
        // A builder session claims the rebuild.
        let mut builder = Pool::with_backends(backend.clone(), backend.clone()).await;
        assert!(builder.get_item("k").await.expect("Failed to get").is_none());
        assert_eq!(builder.status(), Status::ExpiredUnderConstruction);

        // A plain reader still gets the old value, marked stale.
        let mut reader = Pool::with_backends(backend.clone(), backend.clone()).await;
        let stale = reader
            .get_item("k")
            .await
            .expect("Failed to get")
            .expect("stale entry served");
        assert_eq!(reader.status(), Status::Expired);
        assert_eq!(stale.value(), &json!("v1"));
    }

    #[tokio::test]
    async fn test_delete_item_invalidates_version_without_touching_entry() {
        let backend = InMemoryBackend::new();
        let mut writer = Pool::with_backends(backend.clone(), backend.clone()).await;

        assert!(writer.get_item("k").await.expect("Failed to get").is_none());
        assert!(writer
            .save(&item("k", json!("v1"), &[]))
            .await
            .expect("Failed to save"));

        assert!(writer.delete_item("k").await.expect("Failed to delete"));

        // Entry bytes still there; readers just treat them as stale.
        assert!(backend.get("k").await.expect("Failed to get").is_some());

        let mut reader = Pool::with_backends(backend.clone(), backend.clone()).await;
        assert!(reader.get_item("k").await.expect("Failed to get").is_none());
        assert_eq!(reader.status(), Status::ExpiredUnderConstruction);
    }

    #[tokio::test]
    async fn test_delete_item_on_missing_key_reports_success() {
        let (mut pool, _) = pool().await;
        assert!(pool.delete_item("never_created").await.expect("Failed to delete"));
        assert!(!pool.has_item("never_created").await.expect("Failed to check"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_configured_returns_immediately() {
        let backend = InMemoryBackend::new();
        let mut holder = Pool::with_backends(backend.clone(), backend.clone()).await;
        assert!(holder.get_item("k").await.expect("Failed to get").is_none());

        let mut caller = Pool::with_backends(backend.clone(), backend.clone()).await;
        caller.set_count_to_rebuild(None); // default: never wait
        caller.set_rebuild_check_period(Some(30.0)); // must be ignored

        let before = tokio::time::Instant::now();
        assert!(caller.get_item("k").await.expect("Failed to get").is_none());
        // Paused clock: any sleep would have advanced virtual time.
        assert_eq!(tokio::time::Instant::now(), before);
        assert_eq!(caller.status(), Status::NotExistUnderConstruction);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_path_polls_then_gives_definite_answer() {
        let backend = InMemoryBackend::new();
        let mut holder = Pool::with_backends(backend.clone(), backend.clone()).await;
        holder.set_time_to_rebuild(Some(60)); // hold the lock through the test
        assert!(holder.get_item("k").await.expect("Failed to get").is_none());

        let mut waiter = Pool::with_backends(backend.clone(), backend.clone()).await;
        waiter.set_time_to_rebuild(Some(4));
        waiter.set_count_to_rebuild(Some(2));

        let before = tokio::time::Instant::now();
        let result = waiter.get_item("k").await.expect("Failed to get");
        let waited = tokio::time::Instant::now() - before;

        // Two polls at 4s/2 spacing, then a definite answer.
        assert!(result.is_none());
        assert_eq!(waited, Duration::from_secs(4));
        assert_eq!(waiter.status(), Status::NotExistUnderConstruction);
    }

    #[tokio::test]
    async fn test_save_resets_rebuild_tuning() {
        let (mut pool, _) = pool().await;
        pool.set_time_to_rebuild(Some(30));
        pool.set_count_to_rebuild(Some(5));
        pool.set_rebuild_check_period(Some(1.5));

        assert!(pool.get_item("k").await.expect("Failed to get").is_none());
        assert!(pool
            .save(&item("k", json!(1), &[]))
            .await
            .expect("Failed to save"));

        assert_eq!(pool.time_to_rebuild(), DEFAULT_TIME_TO_REBUILD);
        assert_eq!(pool.count_to_rebuild(), DEFAULT_REBUILD_CHECK_COUNT);
        assert_eq!(pool.rebuild_check_period(), None);
    }

    #[tokio::test]
    async fn test_tag_invalidated_during_build_aborts_save() {
        let backend = InMemoryBackend::new();
        let mut builder = Pool::with_backends(backend.clone(), backend.clone()).await;

        assert!(builder.get_item("k").await.expect("Failed to get").is_none());
        let lock_time = builder.state.lock_time.expect("builder holds lock");

        // The tag gets invalidated after the build started.
        backend
            .set(
                "tag_t",
                serialization::encode(&vec![clock::normalize(lock_time + 100.0)])
                    .expect("Failed to encode"),
                0,
            )
            .await
            .expect("Failed to set");

        assert!(!builder
            .save(&item("k", json!(1), &["t"]))
            .await
            .expect("Failed to save"));
        // The lock was released by the aborted save.
        assert!(builder.state.lock_cas.is_none());
    }

    #[tokio::test]
    async fn test_tag_floor_equal_to_lock_time_does_not_abort() {
        let backend = InMemoryBackend::new();
        let mut builder = Pool::with_backends(backend.clone(), backend.clone()).await;

        assert!(builder.get_item("k").await.expect("Failed to get").is_none());
        let lock_time = builder.state.lock_time.expect("builder holds lock");

        backend
            .set(
                "tag_t",
                serialization::encode(&vec![lock_time]).expect("Failed to encode"),
                0,
            )
            .await
            .expect("Failed to set");

        assert!(builder
            .save(&item("k", json!(1), &["t"]))
            .await
            .expect("Failed to save"));
    }

    #[tokio::test]
    async fn test_delete_then_rebuild_serves_new_value() {
        let backend = InMemoryBackend::new();
        let mut builder = Pool::with_backends(backend.clone(), backend.clone()).await;
        let mut other = Pool::with_backends(backend.clone(), backend.clone()).await;

        assert!(builder.get_item("k").await.expect("Failed to get").is_none());
        assert!(builder
            .save(&item("k", json!("v1"), &[]))
            .await
            .expect("Failed to save"));

        // Both sessions see the stale-by-version entry after a delete; the
        // one who locked first rebuilds.
        assert!(builder.delete_item("k").await.expect("Failed to delete"));
        assert!(builder.get_item("k").await.expect("Failed to get").is_none());
        assert_eq!(builder.status(), Status::ExpiredUnderConstruction);

        let stale = other.get_item("k").await.expect("Failed to get");
        assert_eq!(other.status(), Status::Expired);
        assert!(stale.is_some());

        assert!(builder
            .save(&item("k", json!("v2"), &[]))
            .await
            .expect("Failed to save"));
        let fresh = builder
            .get_item("k")
            .await
            .expect("Failed to get")
            .expect("entry present");
        assert_eq!(fresh.value(), &json!("v2"));
    }

    #[tokio::test]
    async fn test_key_sanitization_applies_to_reads_and_writes() {
        let backend = InMemoryBackend::new();
        let mut pool = Pool::with_backends(backend.clone(), backend.clone()).await;

        assert!(pool
            .get_item("with \x01 control")
            .await
            .expect("Failed to get")
            .is_none());
        // Builder key is the sanitized name.
        let saved = pool
            .save(&item("with\x01control", json!(1), &[]))
            .await
            .expect("Failed to save");
        assert!(!saved); // raw name with control char does not match

        assert!(pool.get_item("with \x01 control").await.expect("Failed to get").is_none());
        let saved = pool
            .save(&item("withcontrol", json!(1), &[]))
            .await
            .expect("Failed to save");
        assert!(saved);
        assert!(backend.get("withcontrol").await.expect("Failed to get").is_some());
    }

    #[tokio::test]
    async fn test_unsupported_operations() {
        let (mut pool, _) = pool().await;
        assert!(matches!(
            pool.get_items(&["a".to_string()]).await,
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            pool.save_deferred(&item("k", json!(1), &[])).await,
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(pool.commit().await, Err(Error::NotSupported(_))));
    }

    #[tokio::test]
    async fn test_repeated_read_failure_degrades_pool_permanently() {
        let backend = FlakyBackend::new();
        let mut pool = Pool::with_backends(backend.clone(), backend.clone()).await;
        assert!(!pool.is_degraded());

        backend.fail_reads.store(true, Ordering::SeqCst);

        // Reconnect does not help; second failure flips the breaker.
        assert!(pool.get_item("k").await.expect("Failed to get").is_none());
        assert!(pool.is_degraded());

        // Backend is healthy again, but the pool stays no-op.
        backend.fail_reads.store(false, Ordering::SeqCst);
        assert!(pool.get_item("k").await.expect("Failed to get").is_none());
        assert!(!pool.save(&item("k", json!(1), &[])).await.expect("Failed to save"));
        assert!(!pool.delete_item("k").await.expect("Failed to delete"));
        assert!(!pool.delete_by_tag("t").await.expect("Failed to delete"));
        assert!(pool.clear().await.expect("Failed to clear"));
    }

    #[tokio::test]
    async fn test_failed_probe_constructs_degraded_pool() {
        let backend = FlakyBackend::new();
        backend.fail_writes.store(true, Ordering::SeqCst);

        let pool = Pool::with_backends(backend.clone(), backend.clone()).await;
        assert!(pool.is_degraded());
    }

    #[tokio::test]
    async fn test_connect_validates_config() {
        let config = PoolConfig::default();
        let result =
            Pool::<InMemoryBackend>::connect(&config, |_| Ok(InMemoryBackend::new())).await;
        assert!(matches!(result, Err(Error::ConfigError(_))));

        let config = PoolConfig::new(vec![CacheServer::new("localhost", 11211)], vec![]);
        let pool = Pool::connect(&config, |_| Ok(InMemoryBackend::new()))
            .await
            .expect("Failed to connect");
        assert!(!pool.is_degraded());
    }

    #[tokio::test]
    async fn test_tuning_setters_clamp_to_defaults() {
        let (mut pool, _) = pool().await;

        pool.set_time_to_rebuild(Some(0));
        assert_eq!(pool.time_to_rebuild(), DEFAULT_TIME_TO_REBUILD);
        pool.set_time_to_rebuild(Some(9));
        assert_eq!(pool.time_to_rebuild(), 9);

        pool.set_count_to_rebuild(Some(0));
        assert_eq!(pool.count_to_rebuild(), 0);
        pool.set_count_to_rebuild(Some(3));
        assert_eq!(pool.count_to_rebuild(), 3);

        pool.set_rebuild_check_period(Some(-1.0));
        assert_eq!(pool.rebuild_check_period(), None);
        pool.set_rebuild_check_period(Some(0.5));
        assert_eq!(pool.rebuild_check_period(), Some(0.5));
    }
}
