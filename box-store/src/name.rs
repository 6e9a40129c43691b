//! Queue-name normalization.
//!
//! Rules:
//! * must begin with `/`
//! * segments separated by `/`, each non-empty, not `.`, not `..`
//! * printable UTF-8 only — no control characters, no NUL
//! * trailing `/` stripped
//! * case-sensitive

use std::fmt;

use crate::{Result, StoreError};

/// A normalized queue path such as `/INBOX` or `/whoswho/<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueName(String);

impl QueueName {
    /// Normalize `raw` or reject it.
    pub fn normalize(raw: &str) -> Result<Self> {
        if !raw.starts_with('/') {
            return Err(StoreError::BadQueueName);
        }
        let trimmed = raw.strip_suffix('/').unwrap_or(raw);
        if trimmed.is_empty() {
            // The bare root "/" names no queue.
            return Err(StoreError::BadQueueName);
        }
        if trimmed.chars().any(char::is_control) {
            return Err(StoreError::BadQueueName);
        }
        for segment in trimmed[1..].split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(StoreError::BadQueueName);
            }
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory name on disk: the path with `/` percent-encoded.
    pub fn fs_name(&self) -> String {
        self.0.replace('/', "%2F")
    }

    /// Whether this queue equals `prefix` or sits underneath it.
    pub fn is_under(&self, prefix: &QueueName) -> bool {
        self.0 == prefix.0 || self.0.starts_with(&format!("{}/", prefix.0))
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_simple_paths() {
        for raw in ["/INBOX", "/whoswho", "/a/b/c", "/Queue.Name-1_x"] {
            let name = QueueName::normalize(raw).unwrap();
            assert_eq!(name.as_str(), raw);
        }
    }

    #[test]
    fn strips_trailing_slash() {
        assert_eq!(QueueName::normalize("/INBOX/").unwrap().as_str(), "/INBOX");
    }

    #[test]
    fn rejection_table() {
        for raw in [
            "",            // empty
            "/",           // bare root
            "INBOX",       // missing leading slash
            "/a//b",       // empty segment
            "/a/./b",      // dot segment
            "/a/../b",     // parent traversal
            "/a\0b",       // NUL
            "/a\nb",       // control character
            "/\t",         // control character
        ] {
            assert!(
                matches!(QueueName::normalize(raw), Err(StoreError::BadQueueName)),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn case_sensitive() {
        let lower = QueueName::normalize("/inbox").unwrap();
        let upper = QueueName::normalize("/INBOX").unwrap();
        assert_ne!(lower, upper);
    }

    #[test]
    fn fs_name_encodes_separators() {
        let name = QueueName::normalize("/whoswho/node-1").unwrap();
        assert_eq!(name.fs_name(), "%2Fwhoswho%2Fnode-1");
    }

    #[test]
    fn prefix_nesting() {
        let root = QueueName::normalize("/whoswho").unwrap();
        let nested = QueueName::normalize("/whoswho/abc").unwrap();
        let sibling = QueueName::normalize("/whoswhoX").unwrap();
        assert!(root.is_under(&root));
        assert!(nested.is_under(&root));
        assert!(!sibling.is_under(&root));
        assert!(!root.is_under(&nested));
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(segments in proptest::collection::vec("[A-Za-z0-9._-]{1,8}", 1..4)) {
            let raw = format!("/{}", segments.join("/"));
            // ".." and "." can be generated by the segment regex; skip those.
            prop_assume!(segments.iter().all(|s| s != "." && s != ".."));
            let once = QueueName::normalize(&raw).unwrap();
            let twice = QueueName::normalize(once.as_str()).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
