use std::borrow::Borrow;
use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// Readable part of a snapshot file name is cut off after this many characters.
const MAX_READABLE_LEN: usize = 64;

/// Identifies one cached collection, such as `orgs:list` or `policies:org-a`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the file name under which snapshots of this key are stored.
    ///
    /// The name looks like `orgs_list-1d9c3b0e6f7a2c44.json`: the key with everything but ASCII
    /// letters and digits replaced by `_`, then the first 16 hex digits of the SHA-256 of the raw
    /// key. The hash keeps keys apart that only differ in replaced characters, such as `a:b` and
    /// `a/b`.
    pub fn snapshot_name(&self) -> String {
        let mut name: String = self
            .0
            .chars()
            .take(MAX_READABLE_LEN)
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();

        let hash = Sha256::digest(self.0.as_bytes());
        name.push('-');
        for b in &hash[..8] {
            // writing into a `String` never fails
            let _ = write!(name, "{b:02x}");
        }
        name.push_str(".json");
        name
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl From<&CacheKey> for CacheKey {
    fn from(key: &CacheKey) -> Self {
        key.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_name() {
        let key = CacheKey::from("orgs:list");
        let name = key.snapshot_name();

        assert!(name.starts_with("orgs_list-"), "{name}");
        assert!(name.ends_with(".json"));
        // readable part, dash, 16 hex digits, extension
        assert_eq!(name.len(), "orgs_list".len() + 1 + 16 + ".json".len());
        assert_eq!(name, CacheKey::from("orgs:list").snapshot_name());
    }

    #[test]
    fn test_snapshot_name_is_safe() {
        let name = CacheKey::from("../../etc/passwd").snapshot_name();
        assert!(!name.contains('/'));
        assert!(name.starts_with("______etc_passwd-"), "{name}");

        let name = CacheKey::from("räksmörgås").snapshot_name();
        assert!(name.is_ascii());
    }

    #[test]
    fn test_snapshot_name_collisions() {
        let a = CacheKey::from("policies:org/a").snapshot_name();
        let b = CacheKey::from("policies:org:a").snapshot_name();
        let c = CacheKey::from("policies_org_a").snapshot_name();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn test_long_keys() {
        let long = "x".repeat(500);
        let name = CacheKey::from(long.as_str()).snapshot_name();
        assert_eq!(name.len(), MAX_READABLE_LEN + 1 + 16 + ".json".len());

        let other = format!("{long}y");
        assert_ne!(name, CacheKey::from(other).snapshot_name());
    }
}
