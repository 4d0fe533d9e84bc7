// # Query Keys
//
// A query key identifies a logical resource. Keys are plain strings to the
// cache, but carry `:`-separated segment semantics for bulk invalidation:
// `users:1:posts` is matched by the prefixes `users` and `users:1`.

use crate::error::{FasqError, Result};
use serde::{Deserialize, Serialize};

use super::MAX_KEY_LENGTH;

/// Stable identifier for a logical resource.
///
/// Used both as the cache key and as the routing key for invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryKey(String);

impl QueryKey {
    /// Create a key, validating the character set and length.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        validate_key(&key)?;
        Ok(QueryKey(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix match on `:`-separated segment boundaries.
    ///
    /// `a:b` matches `a:b` and `a:b:c`, but not `a:bc`.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        key_matches_prefix(&self.0, prefix)
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueryKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validate a raw cache key: `[A-Za-z0-9_:\-]`, 1..=255 bytes.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(FasqError::Validation("cache key must not be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(FasqError::Validation(format!(
            "cache key exceeds {} bytes: {}",
            MAX_KEY_LENGTH,
            key.len()
        )));
    }
    for c in key.chars() {
        if !(c.is_ascii_alphanumeric() || c == '_' || c == ':' || c == '-') {
            return Err(FasqError::Validation(format!(
                "cache key contains invalid character {:?}: {}",
                c, key
            )));
        }
    }
    Ok(())
}

/// Segment-boundary prefix match used by bulk invalidation.
pub fn key_matches_prefix(key: &str, prefix: &str) -> bool {
    if key == prefix {
        return true;
    }
    key.starts_with(prefix) && key.as_bytes().get(prefix.len()) == Some(&b':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_keys() {
        assert!(QueryKey::new("users:1").is_ok());
        assert!(QueryKey::new("a-b_c:D9").is_ok());
        assert!(QueryKey::new("x").is_ok());
    }

    #[test]
    fn test_invalid_keys() {
        assert!(QueryKey::new("").is_err());
        assert!(QueryKey::new("has space").is_err());
        assert!(QueryKey::new("emoji\u{1F600}").is_err());
        assert!(QueryKey::new("a".repeat(256)).is_err());
        assert!(QueryKey::new("a".repeat(255)).is_ok());
    }

    #[test]
    fn test_prefix_segment_boundary() {
        assert!(key_matches_prefix("a:b:c", "a"));
        assert!(key_matches_prefix("a:b:c", "a:b"));
        assert!(key_matches_prefix("a:b:c", "a:b:c"));
        assert!(!key_matches_prefix("a:bc", "a:b"));
        assert!(!key_matches_prefix("ab", "a"));
        assert!(!key_matches_prefix("b:1", "a"));
    }
}
