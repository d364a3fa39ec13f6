//! Tag and version-key invalidation.
//!
//! Invalidation never touches cache entries. It raises the invalidation
//! floor of a tag record (or of a key's version record), and readers detect
//! staleness by comparing the floors captured in an entry against the live
//! ones.
//!
//! The delayed mode exists for read replicas: a fresh invalidation stamped
//! `now` could be missed by a builder reading a lagging replica, so the new
//! floor is stamped `now + delay` where the delay exceeds worst-case
//! replication lag. Until it takes effect the pending timestamp sits in the
//! record's sliding window.

use crate::backend::{CacheBackend, CasValue};
use crate::clock;
use crate::error::{Error, Result};
use crate::key;
use crate::serialization;
use std::collections::HashMap;

/// Default delay window in seconds for delayed invalidation.
///
/// Sized to exceed the worst-case replication lag between the write path
/// and any lagging read replica.
pub const EXPIRE_DELAY: u32 = 4;

/// Timestamp list stored under a `tag_*` or `ver_*` key. The effective
/// floor is the maximum; older entries are trimmed as their delay elapses.
pub(crate) type TimestampList = Vec<f64>;

/// Invalidation engine over the value and tag stores.
///
/// `cache` is the store holding the records being invalidated (version
/// records live in the value store, tag records in the tag store);
/// `tag_cache` is where missing tag records are created.
#[derive(Clone)]
pub(crate) struct Expirer<B: CacheBackend> {
    cache: B,
    tag_cache: B,
    expire_time: Option<u32>,
}

impl<B: CacheBackend> Expirer<B> {
    pub fn new(cache: B, tag_cache: B) -> Self {
        Expirer {
            cache,
            tag_cache,
            expire_time: None,
        }
    }

    /// Override the delay window for subsequent delayed invalidations.
    /// Non-positive values fall back to [`EXPIRE_DELAY`].
    pub fn set_expire_time(&mut self, seconds: u32) {
        self.expire_time = if seconds == 0 { None } else { Some(seconds) };
    }

    pub fn reset_expire_time(&mut self) {
        self.expire_time = None;
    }

    /// Invalidate every key carrying one of `tags`.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` on an empty or over-length tag name;
    /// `Error::ConnectionError` if the delayed path cannot read the
    /// existing records.
    pub async fn expire_tags(&self, tags: &[String], no_delay: bool) -> Result<bool> {
        if !key::check_tags_length(tags) {
            return Err(Error::InvalidArgument("bad tag name length".to_string()));
        }
        self.expire(&key::prefix_tags(tags), no_delay).await
    }

    /// Invalidate keys directly through their version records.
    pub async fn expire_keys(&self, keys: &[String], no_delay: bool) -> Result<bool> {
        self.expire(&key::prefix_version_keys(keys), no_delay).await
    }

    /// Live invalidation floors for `tags`, keyed by unprefixed name.
    /// Tags with no record are omitted; callers decide what omission means.
    pub async fn current_floors(&self, tags: &[String]) -> Result<HashMap<String, f64>> {
        let prefixed = key::prefix_tags(tags);
        let refs: Vec<&str> = prefixed.iter().map(String::as_str).collect();
        let records = self.cache.get_multi(&refs).await?;

        let mut floors = HashMap::with_capacity(records.len());
        for (name, value) in records {
            let list: TimestampList = serialization::decode(&value.data)?;
            if let Some(max) = list.iter().copied().fold(None::<f64>, fold_max) {
                let unprefixed = name
                    .strip_prefix(key::TAG_PREFIX)
                    .unwrap_or(&name)
                    .to_string();
                floors.insert(unprefixed, max);
            }
        }
        Ok(floors)
    }

    /// Shared invalidation path over already-prefixed key names.
    ///
    /// Returns the logical AND of every per-record write outcome.
    async fn expire(&self, prefixed: &[String], no_delay: bool) -> Result<bool> {
        if no_delay {
            let stamp = serialization::encode(&vec![clock::normalize(clock::now())])?;
            let mut all_ok = true;
            for name in prefixed {
                all_ok &= self.cache.set(name, stamp.clone(), 0).await?;
            }
            debug!("✓ Immediate expire of {} records", prefixed.len());
            return Ok(all_ok);
        }

        let refs: Vec<&str> = prefixed.iter().map(String::as_str).collect();
        let existing = self.cache.get_multi(&refs).await?;

        let now = clock::normalize(clock::now());
        let pending = clock::normalize(now + f64::from(self.delay_window()));

        let mut all_ok = true;
        for (name, value) in &existing {
            let queued = push_pending(value, now, pending)?;
            all_ok &= self.cache.cas(value.cas, name, queued, 0).await?;
        }

        // Records that do not exist yet have no prior reader to race
        // against, so they are created with an immediate floor.
        let fresh = serialization::encode(&vec![now])?;
        for name in prefixed {
            if !existing.contains_key(name) {
                all_ok &= self.tag_cache.add(name, fresh.clone(), 0).await?;
            }
        }

        debug!(
            "✓ Delayed expire of {} records ({} pre-existing)",
            prefixed.len(),
            existing.len()
        );
        Ok(all_ok)
    }

    fn delay_window(&self) -> u32 {
        self.expire_time.unwrap_or(EXPIRE_DELAY)
    }
}

/// Trim the elapsed prefix of a timestamp list and append the pending
/// invalidation.
///
/// Scanning newest to oldest, everything older than the newest entry that
/// has already taken effect (`<= now`) is dropped; that entry itself is
/// kept as the current floor. Pending entries (`> now`) are always kept:
/// an invalidation whose delay has not elapsed must never be lost.
fn push_pending(value: &CasValue, now: f64, pending: f64) -> Result<Vec<u8>> {
    let list: TimestampList = serialization::decode(&value.data)?;

    let mut queued = match list.iter().rposition(|t| *t <= now) {
        Some(idx) => list[idx..].to_vec(),
        None => list,
    };
    queued.push(pending);
    serialization::encode(&queued)
}

fn fold_max(acc: Option<f64>, t: f64) -> Option<f64> {
    match acc {
        Some(current) if current >= t => Some(current),
        _ => Some(t),
    }
}
