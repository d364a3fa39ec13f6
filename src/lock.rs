//! Per-key mutual exclusion built on backend CAS.
//!
//! There is no lock service: a lock is just a record in the tag store,
//! claimed with insert-if-absent or CAS and confirmed with a re-read.
//! Expired locks are taken over rather than cleaned up, and "unlocked" is a
//! sentinel value because the backend cannot delete under CAS.

use crate::backend::CacheBackend;
use crate::clock;
use crate::error::Result;
use crate::key;
use crate::serialization;
use serde::{Deserialize, Serialize};

/// Status of the last `get_item` call on a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Status {
    /// Initial state, or after a session reset.
    #[default]
    Unknown,
    /// The entry is valid; no action needed.
    Actual,
    /// The entry is stale but served anyway; another session is rebuilding.
    Expired,
    /// The entry is stale and this session holds the build lock.
    ExpiredUnderConstruction,
    /// The entry is missing and this session holds the build lock.
    NotExistUnderConstruction,
    /// This session already holds a lock from an earlier `get_item`; it must
    /// finish that build before issuing another read.
    BuildOutside,
}

/// Lock record stored under `lock_<hash>`.
///
/// `Unlocked` is written on release instead of deleting the key: the backend
/// has no CAS-conditioned delete, so absence cannot be produced atomically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum LockRecord {
    Unlocked,
    Held { expires_at: f64, token: u32 },
}

/// Per-session mutable state shared between the pool and the lock engine.
///
/// One instance per logical session; nothing here is persisted or shared
/// across sessions. All cross-process coordination goes through the backend.
#[derive(Clone, Debug, Default)]
pub(crate) struct SessionState {
    /// CAS token for the data key, captured during `get_item`.
    pub data_cas: Option<u64>,
    /// Current version of the key, max of the version record.
    pub version: Option<f64>,
    /// CAS token of the lock record while this session holds the lock.
    pub lock_cas: Option<u64>,
    /// When this session acquired the lock.
    pub lock_time: Option<f64>,
    /// Sanitized name of the key being operated on.
    pub key_name: String,
    /// Status of the last read.
    pub status: Status,
}

/// Lock engine over one backend handle (the tag store).
#[derive(Clone)]
pub(crate) struct CasLock<B: CacheBackend> {
    cache: B,
}

impl<B: CacheBackend> CasLock<B> {
    pub fn new(cache: B) -> Self {
        CasLock { cache }
    }

    /// Try to take the build lock for `key` for roughly `time_to_rebuild`
    /// seconds.
    ///
    /// Returns `Ok(true)` on a confirmed claim, or when this session already
    /// holds the lock (idempotent re-entry within one build cycle).
    /// `Ok(false)` means another session holds it; that is expected
    /// control flow, not a fault.
    pub async fn lock(
        &self,
        state: &mut SessionState,
        key: &str,
        time_to_rebuild: f64,
    ) -> Result<bool> {
        state.key_name = key.to_string();
        let lock_key = key::lock_key(key);

        let existing = self.cache.get(&lock_key).await?;
        let lock_time = clock::normalize(clock::now());
        let existing_cas = existing.as_ref().map(|v| v.cas);
        let record = match &existing {
            Some(value) => Some(serialization::decode::<LockRecord>(&value.data)?),
            None => None,
        };

        let reclaimable = match &record {
            None => true,
            Some(LockRecord::Unlocked) => true,
            Some(LockRecord::Held { expires_at, .. }) => *expires_at <= lock_time,
        };

        if reclaimable {
            state.lock_cas = None;
            state.lock_time = None;

            let claim = LockRecord::Held {
                expires_at: clock::normalize(lock_time + time_to_rebuild),
                token: rand::random::<u32>(),
            };
            let bytes = serialization::encode(&claim)?;
            let ttl = time_to_rebuild.ceil() as u32;

            let written = match existing_cas {
                None => self.cache.add(&lock_key, bytes, ttl).await?,
                Some(cas) => self.cache.cas(cas, &lock_key, bytes, ttl).await?,
            };
            if !written {
                debug!("✗ Lock claim for {} lost the write race", key);
                return Ok(false);
            }

            // Confirm the claim: a second claimant may have landed between
            // our write and this read.
            let confirm = self.cache.get(&lock_key).await?;
            match confirm {
                Some(value) if serialization::decode::<LockRecord>(&value.data)? == claim => {
                    state.lock_cas = Some(value.cas);
                    state.lock_time = Some(lock_time);
                    debug!("✓ Lock acquired for {} until +{}s", key, time_to_rebuild);
                    Ok(true)
                }
                _ => {
                    debug!("✗ Lock claim for {} superseded before confirmation", key);
                    Ok(false)
                }
            }
        } else if state.lock_cas.is_some() && state.lock_cas == existing_cas {
            // This session already owns the lock.
            Ok(true)
        } else {
            state.lock_cas = None;
            state.lock_time = None;
            debug!("✗ Lock for {} held elsewhere", key);
            Ok(false)
        }
    }

    /// Release the lock if this session holds it, and reset session state.
    ///
    /// The backend write is advisory: the next `lock` call treats an expired
    /// or mismatched record as reclaimable anyway. The local state reset
    /// always runs.
    pub async fn unlock(&self, state: &mut SessionState) -> Result<bool> {
        let mut released = false;

        if let Some(lock_cas) = state.lock_cas {
            let lock_key = key::lock_key(&state.key_name);
            if let Ok(Some(value)) = self.cache.get(&lock_key).await {
                if value.cas == lock_cas {
                    let sentinel = serialization::encode(&LockRecord::Unlocked)?;
                    released = self
                        .cache
                        .cas(lock_cas, &lock_key, sentinel, 1)
                        .await
                        .unwrap_or(false);
                }
            }
        }

        state.lock_cas = None;
        state.lock_time = None;
        state.data_cas = None;
        state.version = None;
        state.status = Status::Unknown;
        Ok(released)
    }
}
