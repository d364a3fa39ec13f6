//! The value holder consumed and produced by the pool.

use crate::error::{Error, Result};
use serde_json::Value;

/// Immutable key/value/tags/expiry tuple.
///
/// A `CacheItem` is what callers hand to [`Pool::save`](crate::Pool::save)
/// and what [`Pool::get_item`](crate::Pool::get_item) returns. The value is
/// opaque to the pool ([`serde_json::Value`]); `Value::Null` is rejected at
/// construction because the read path uses "no value" to mean "you must
/// build".
///
/// Items are immutable: the `with_*`/`add_*` methods return new instances.
///
/// # Example
///
/// ```
/// use tcache::CacheItem;
/// use serde_json::json;
///
/// let item = CacheItem::new("user_1", json!({"name": "Alice"}), vec!["users".into()], None)
///     .expect("valid item");
/// assert_eq!(item.key(), "user_1");
/// assert!(!item.is_hit());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct CacheItem {
    key: String,
    value: Value,
    tags: Vec<String>,
    expire_after: Option<u32>,
    is_hit: bool,
}

impl CacheItem {
    /// Create an item to be saved.
    ///
    /// `expire_after` is in seconds; `None` or zero means unbounded.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` if `value` is `Value::Null`.
    pub fn new(
        key: impl Into<String>,
        value: Value,
        tags: Vec<String>,
        expire_after: Option<u32>,
    ) -> Result<Self> {
        let key = key.into();
        if value.is_null() {
            return Err(Error::InvalidArgument(format!(
                "null value for cache key: {}",
                key
            )));
        }

        Ok(CacheItem {
            key,
            value,
            tags,
            // Zero and None both mean "no revalidation deadline".
            expire_after: expire_after.filter(|t| *t > 0),
            is_hit: false,
        })
    }

    /// Item produced by a successful read.
    ///
    /// Read items never expose the stored TTL; callers must not infer one.
    pub(crate) fn hit(key: impl Into<String>, value: Value, tags: Vec<String>) -> Self {
        CacheItem {
            key: key.into(),
            value,
            tags,
            expire_after: None,
            is_hit: true,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Tag names attached to this item, in insertion order.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Requested TTL in seconds; `None` means unbounded.
    pub fn expire_after(&self) -> Option<u32> {
        self.expire_after
    }

    /// Whether this item came out of the cache.
    pub fn is_hit(&self) -> bool {
        self.is_hit
    }

    /// Same key, tags and expiry with a replacement value.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` if `value` is `Value::Null`.
    pub fn with_value(&self, value: Value) -> Result<Self> {
        CacheItem::new(self.key.clone(), value, self.tags.clone(), self.expire_after)
    }

    /// New item with one extra tag.
    pub fn add_tag(&self, tag: impl Into<String>) -> Self {
        let mut tags = self.tags.clone();
        tags.push(tag.into());
        CacheItem {
            key: self.key.clone(),
            value: self.value.clone(),
            tags,
            expire_after: self.expire_after,
            is_hit: false,
        }
    }

    /// New item with extra tags appended.
    pub fn add_tags(&self, extra: Vec<String>) -> Self {
        let mut tags = self.tags.clone();
        tags.extend(extra);
        CacheItem {
            key: self.key.clone(),
            value: self.value.clone(),
            tags,
            expire_after: self.expire_after,
            is_hit: false,
        }
    }
}
