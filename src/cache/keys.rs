//! Cache Key Codec
//!
//! Builds deterministic, hierarchical cache keys of the form
//! `vertex:<namespace>:<operation>:<content_hash>` and matches glob-style
//! invalidation patterns against them.
//!
//! Structured payloads are serialized to canonical JSON (object keys sorted
//! at every depth) before hashing, so two requests that differ only in field
//! order address the same entry. Namespace and operation tokens are
//! percent-encoded, which keeps `:` and glob metacharacters out of the
//! prefix segments.

use crate::error::{Error, Result};
use glob::{MatchOptions, Pattern};
use serde::Serialize;
use serde_json::{Map, Value};
use xxhash_rust::xxh3::xxh3_64;

/// Default leading segment for all keys
pub const DEFAULT_KEY_PREFIX: &str = "vertex";

/// Segment delimiter
pub const KEY_DELIMITER: char = ':';

// =============================================================================
// Key Codec
// =============================================================================

/// Deterministic cache key builder
#[derive(Debug, Clone)]
pub struct KeyCodec {
    prefix: String,
}

impl KeyCodec {
    /// Create a codec with the default `vertex` prefix
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_KEY_PREFIX)
    }

    /// Create a codec with a custom leading segment
    pub fn with_prefix(prefix: impl AsRef<str>) -> Self {
        Self {
            prefix: escape_token(prefix.as_ref()),
        }
    }

    /// Leading segment of every key
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build a cache key for `data`.
    ///
    /// Plain strings are hashed as-is; anything else is hashed through its
    /// canonical JSON form.
    pub fn key<T: Serialize + ?Sized>(
        &self,
        data: &T,
        operation: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<String> {
        let value = serde_json::to_value(data)?;
        let hash = match &value {
            Value::String(s) => content_hash(s.as_bytes()),
            other => content_hash(canonical_json(other)?.as_bytes()),
        };

        let mut key = self.scope(namespace, operation);
        key.push(KEY_DELIMITER);
        key.push_str(&format!("{:016x}", hash));
        Ok(key)
    }

    /// Pattern matching every key under the given namespace/operation scope
    pub fn pattern(&self, namespace: Option<&str>, operation: Option<&str>) -> String {
        let mut pattern = self.scope(namespace, operation);
        pattern.push(KEY_DELIMITER);
        pattern.push('*');
        pattern
    }

    fn scope(&self, namespace: Option<&str>, operation: Option<&str>) -> String {
        let mut scope = self.prefix.clone();
        for token in [namespace, operation].into_iter().flatten() {
            scope.push(KEY_DELIMITER);
            scope.push_str(&escape_token(token));
        }
        scope
    }
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Percent-encode a prefix token so it never contains `:` or glob syntax
pub fn escape_token(token: &str) -> String {
    urlencoding::encode(token).into_owned()
}

/// 64-bit content hash
#[inline]
pub fn content_hash(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// Stable partition index for a key
#[inline]
pub fn partition_of(key: &str, partitions: usize) -> usize {
    (xxh3_64(key.as_bytes()) % partitions.max(1) as u64) as usize
}

/// Serialize a JSON value with object keys sorted at every depth
pub fn canonical_json(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(&canonicalize(value))?)
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for k in keys {
                sorted.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

// =============================================================================
// Key Pattern
// =============================================================================

/// Compiled glob pattern over cache keys.
///
/// Supported syntax is `*`, `?` and bracket classes of plain characters or
/// ranges (`[abc]`, `[0-9]`). Backslash escapes, negated classes and a `]`
/// opening a class are rejected: the local matcher and Redis `SCAN MATCH`
/// read them differently. A literal metacharacter is written as a one-item
/// class such as `[*]`.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    /// Set when the pattern is a literal prefix followed by a single `*`
    prefix: Option<String>,
    glob: Pattern,
}

impl KeyPattern {
    const OPTIONS: MatchOptions = MatchOptions {
        case_sensitive: true,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };

    /// Compile a pattern
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern is empty".into(),
            });
        }

        if let Err(reason) = check_portable(pattern) {
            return Err(Error::InvalidPattern {
                pattern: pattern.to_string(),
                reason: reason.into(),
            });
        }

        let glob = Pattern::new(pattern).map_err(|e| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.msg.to_string(),
        })?;

        let prefix = pattern
            .strip_suffix('*')
            .filter(|head| !head.contains(['*', '?', '[', ']']))
            .map(str::to_string);

        Ok(Self {
            raw: pattern.to_string(),
            prefix,
            glob,
        })
    }

    /// Check whether a key matches
    pub fn matches(&self, key: &str) -> bool {
        match &self.prefix {
            Some(prefix) => key.starts_with(prefix.as_str()),
            None => self.glob.matches_with(key, Self::OPTIONS),
        }
    }

    /// Original pattern text (also valid as a Redis `SCAN MATCH` argument)
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Reject syntax whose meaning differs between glob and Redis MATCH
fn check_portable(pattern: &str) -> std::result::Result<(), &'static str> {
    if pattern.contains('\\') {
        return Err("backslash escapes are not supported");
    }

    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c != '[' {
            continue;
        }
        match chars.next() {
            Some('!') | Some('^') => return Err("negated character classes are not supported"),
            Some(']') => return Err("a character class cannot start with ']'"),
            _ => {}
        }
        for c in chars.by_ref() {
            match c {
                ']' => break,
                '[' => return Err("'[' inside a character class is not supported"),
                _ => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_is_deterministic() {
        let codec = KeyCodec::new();
        let request = json!({"prompt": "hello", "temperature": 0.2});

        let a = codec.key(&request, Some("generate"), Some("user_1")).unwrap();
        let b = codec.key(&request, Some("generate"), Some("user_1")).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("vertex:user_1:generate:"));
        assert_eq!(a.rsplit(':').next().unwrap().len(), 16);
    }

    #[test]
    fn test_key_ignores_field_order() {
        let codec = KeyCodec::new();
        let a = json!({"a": 1, "b": {"x": true, "y": [1, 2]}});
        let b = json!({"b": {"y": [1, 2], "x": true}, "a": 1});

        assert_eq!(
            codec.key(&a, None, None).unwrap(),
            codec.key(&b, None, None).unwrap()
        );
    }

    #[test]
    fn test_different_inputs_differ() {
        let codec = KeyCodec::new();
        let a = codec.key("prompt one", None, Some("ns")).unwrap();
        let b = codec.key("prompt two", None, Some("ns")).unwrap();
        assert_ne!(a, b);

        // Same data under a different operation lands in another scope
        let c = codec.key("prompt one", Some("embed"), Some("ns")).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_struct_payload() {
        #[derive(Serialize)]
        struct Request<'a> {
            model: &'a str,
            prompt: &'a str,
        }

        let codec = KeyCodec::new();
        let typed = codec
            .key(&Request { model: "gemini", prompt: "hi" }, Some("op"), None)
            .unwrap();
        let untyped = codec
            .key(&json!({"prompt": "hi", "model": "gemini"}), Some("op"), None)
            .unwrap();
        assert_eq!(typed, untyped);
    }

    #[test]
    fn test_tokens_are_escaped() {
        let codec = KeyCodec::new();
        let key = codec.key("x", Some("op:1"), Some("ns*")).unwrap();
        let segments: Vec<&str> = key.split(':').collect();
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[1], "ns%2A");
        assert_eq!(segments[2], "op%3A1");
    }

    #[test]
    fn test_scope_pattern_matches_keys() {
        let codec = KeyCodec::new();
        let key = codec.key("data", Some("user_42"), Some("generate_content")).unwrap();
        let other = codec.key("data", Some("user_7"), Some("generate_content")).unwrap();

        let pattern = codec.pattern(Some("generate_content"), Some("user_42"));
        assert_eq!(pattern, "vertex:generate_content:user_42:*");

        let compiled = KeyPattern::new(&pattern).unwrap();
        assert!(compiled.matches(&key));
        assert!(!compiled.matches(&other));
    }

    #[test]
    fn test_glob_patterns() {
        let p = KeyPattern::new("ns1:op:*").unwrap();
        assert!(p.matches("ns1:op:a"));
        assert!(p.matches("ns1:op:"));
        assert!(!p.matches("ns2:op:c"));

        let p = KeyPattern::new("ns?:*:a").unwrap();
        assert!(p.matches("ns1:op:a"));
        assert!(p.matches("ns2:other:a"));
        assert!(!p.matches("ns1:op:b"));

        let p = KeyPattern::new("ns[12]:op:*").unwrap();
        assert!(p.matches("ns2:op:z"));
        assert!(!p.matches("ns3:op:z"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(KeyPattern::new("").is_err());
        assert!(KeyPattern::new("ns:[unclosed").is_err());
    }

    #[test]
    fn test_non_portable_syntax_is_rejected() {
        for pattern in ["ns\\*:op", "ns[!1]:*", "ns[^1]:*", "ns[]]:*", "ns[a[]:*"] {
            let err = KeyPattern::new(pattern).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError, "{}", pattern);
        }

        // A one-item class matches the metacharacter literally
        let p = KeyPattern::new("ns:[*]:op").unwrap();
        assert!(p.matches("ns:*:op"));
        assert!(!p.matches("ns:x:op"));

        let p = KeyPattern::new("ns[0-9]:*").unwrap();
        assert!(p.matches("ns7:op:a"));
        assert!(!p.matches("nsx:op:a"));
    }

    #[test]
    fn test_partition_stability() {
        for i in 0..200 {
            let key = format!("vertex:ns:op:{}", i);
            let first = partition_of(&key, 16);
            assert!(first < 16);
            for _ in 0..5 {
                assert_eq!(partition_of(&key, 16), first);
            }
        }
        assert_eq!(partition_of("anything", 1), 0);
        assert_eq!(partition_of("anything", 0), 0);
    }
}
