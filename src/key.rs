//! Key codec: sanitization, length bounding and derived key names.
//!
//! The backend rejects control characters and keys over a fixed length, so
//! every externally supplied name goes through [`sanitize_key`] before it is
//! used. Derived names (version key, tag key, lock key) are pure string
//! transforms with fixed prefixes.

use sha2::{Digest, Sha256};

/// Maximum byte length the backend accepts for a key or tag name.
pub const KEY_MAX_LEN: usize = 230;

/// Prefix for keys holding tag invalidation timestamps.
pub(crate) const TAG_PREFIX: &str = "tag_";

/// Prefix for keys holding per-key version timestamps.
pub(crate) const VERSION_PREFIX: &str = "ver_";

/// Prefix for lock keys.
pub(crate) const LOCK_PREFIX: &str = "lock_";

/// Bytes of the sanitized name kept verbatim when a key is truncated; the
/// rest of the [`KEY_MAX_LEN`] budget is the hex digest (64 chars).
const TRUNCATED_PREFIX_LEN: usize = KEY_MAX_LEN - 64;

/// Strip characters the backend forbids and bound the key length.
///
/// Control characters (0x00-0x1F), space and DEL are removed. If the result
/// still exceeds [`KEY_MAX_LEN`] bytes it is replaced by a fixed-length
/// prefix plus the SHA-256 of the sanitized name, which keeps distinct long
/// keys distinct.
pub fn sanitize_key(key: &str) -> String {
    let stripped: String = key
        .chars()
        .filter(|c| !c.is_ascii_control() && *c != ' ')
        .collect();

    if stripped.len() <= KEY_MAX_LEN {
        return stripped;
    }

    let digest = hex_digest(&stripped);
    let mut cut = TRUNCATED_PREFIX_LEN;
    // Keep the cut on a char boundary for multi-byte keys.
    while !stripped.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &stripped[..cut], digest)
}

/// Name of the version record for `key`.
pub fn version_key(key: &str) -> String {
    format!("{}{}", VERSION_PREFIX, key)
}

/// Name of the tag record for `tag`.
pub fn tag_key(tag: &str) -> String {
    format!("{}{}", TAG_PREFIX, tag)
}

/// Name of the lock record for `key`.
///
/// The key is hashed so the lock name stays short no matter how long the
/// data key is.
pub fn lock_key(key: &str) -> String {
    format!("{}{}", LOCK_PREFIX, hex_digest(key))
}

/// Prefix every tag name with the tag-record prefix.
pub fn prefix_tags(tags: &[String]) -> Vec<String> {
    tags.iter().map(|t| tag_key(t)).collect()
}

/// Prefix every key name with the version-record prefix.
pub fn prefix_version_keys(keys: &[String]) -> Vec<String> {
    keys.iter().map(|k| version_key(k)).collect()
}

/// Remove the tag-record prefix; inverse of [`prefix_tags`].
pub fn unprefix_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .map(|t| t.strip_prefix(TAG_PREFIX).unwrap_or(t).to_string())
        .collect()
}

/// Validate a batch of tag names before any backend call.
///
/// Every tag must be non-empty and at most [`KEY_MAX_LEN`] bytes; a single
/// bad name fails the whole batch.
pub fn check_tags_length(tags: &[String]) -> bool {
    tags.iter()
        .all(|tag| !tag.is_empty() && tag.len() <= KEY_MAX_LEN)
}

fn hex_digest(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sanitize_strips_control_chars() {
        assert_eq!(sanitize_key("a\x00b\x1fc\x7fd e"), "abcde");
        assert_eq!(sanitize_key("plain_key"), "plain_key");
    }

    #[test]
    fn test_sanitize_short_key_unchanged() {
        let key = "k".repeat(KEY_MAX_LEN);
        assert_eq!(sanitize_key(&key), key);
    }

    #[test]
    fn test_sanitize_truncates_long_key() {
        let key = "k".repeat(KEY_MAX_LEN + 1);
        let out = sanitize_key(&key);
        assert_eq!(out.len(), KEY_MAX_LEN);
        assert!(out.starts_with(&"k".repeat(TRUNCATED_PREFIX_LEN)));
    }

    #[test]
    fn test_sanitize_long_keys_stay_distinct() {
        let a = format!("{}a", "x".repeat(300));
        let b = format!("{}b", "x".repeat(300));
        assert_ne!(sanitize_key(&a), sanitize_key(&b));
    }

    #[test]
    fn test_derived_key_names() {
        assert_eq!(version_key("user_1"), "ver_user_1");
        assert_eq!(tag_key("news"), "tag_news");
        assert!(lock_key("user_1").starts_with(LOCK_PREFIX));
        assert_eq!(lock_key("user_1").len(), LOCK_PREFIX.len() + 64);
        // Pure function: same input, same name.
        assert_eq!(lock_key("user_1"), lock_key("user_1"));
        assert_ne!(lock_key("user_1"), lock_key("user_2"));
    }

    #[test]
    fn test_check_tags_length() {
        assert!(check_tags_length(&[]));
        assert!(check_tags_length(&["a".to_string(), "b".repeat(KEY_MAX_LEN)]));
        assert!(!check_tags_length(&["a".to_string(), String::new()]));
        assert!(!check_tags_length(&["ok".to_string(), "b".repeat(KEY_MAX_LEN + 1)]));
    }

    #[test]
    fn test_prefix_version_keys() {
        let keys = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            prefix_version_keys(&keys),
            vec!["ver_a".to_string(), "ver_b".to_string()]
        );
    }

    proptest! {
        #[test]
        fn prop_prefix_unprefix_roundtrip(tags in proptest::collection::vec(".{0,40}", 0..8)) {
            let prefixed = prefix_tags(&tags);
            prop_assert_eq!(unprefix_tags(&prefixed), tags);
        }
    }
}
