//! Name -> IPC key derivation (spec.md §3).
//!
//! Independently-started workers must converge on the same SysV key without
//! talking to each other first, so derivation is a pure function of the
//! resource name, an optional derivative suffix, and the semaphore set
//! cardinality.

use sha1::{Digest, Sha1};

/// A validated resource name. Empty names and names containing NUL are
/// rejected at construction (mirrors spec.md §9's "unknown options rejected
/// at registration" philosophy, extended to malformed identifiers).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(String);

#[derive(Debug, thiserror::Error)]
pub enum NameError {
    #[error("resource name must not be empty")]
    Empty,
    #[error("resource name must not contain NUL bytes")]
    ContainsNul,
}

impl Name {
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        if name.as_bytes().contains(&0) {
            return Err(NameError::ContainsNul);
        }
        Ok(Name(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derives a deterministic SysV `key_t` (`i32` on Linux) for `name`, optionally
/// qualified by a derivative `suffix` (e.g. `"_sliding_window"`, `"_pid"`), at
/// a given semaphore-set `cardinality`.
///
/// `SHA-1(name || "_NUM_SEMS_" || cardinality)` truncated to 4 bytes,
/// interpreted little-endian as `i32`. Negative keys are valid SysV keys and
/// are not special-cased.
pub fn derive_key(name: &Name, suffix: Option<&str>, cardinality: usize) -> i32 {
    let mut hasher = Sha1::new();
    hasher.update(name.as_str().as_bytes());
    if let Some(suffix) = suffix {
        hasher.update(suffix.as_bytes());
    }
    hasher.update(b"_NUM_SEMS_");
    hasher.update(cardinality.to_string().as_bytes());
    let digest = hasher.finalize();
    i32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_across_calls() {
        let n = Name::new("mysql_primary").unwrap();
        assert_eq!(derive_key(&n, None, 5), derive_key(&n, None, 5));
    }

    #[test]
    fn different_suffix_different_key() {
        let n = Name::new("mysql_primary").unwrap();
        let base = derive_key(&n, None, 5);
        let window = derive_key(&n, Some("_sliding_window"), 5);
        let pid = derive_key(&n, Some("_pid"), 5);
        assert_ne!(base, window);
        assert_ne!(base, pid);
        assert_ne!(window, pid);
    }

    #[test]
    fn different_cardinality_different_key() {
        let n = Name::new("mysql_primary").unwrap();
        assert_ne!(derive_key(&n, None, 5), derive_key(&n, None, 6));
    }

    #[test]
    fn rejects_empty_name() {
        assert!(matches!(Name::new(""), Err(NameError::Empty)));
    }

    #[test]
    fn rejects_nul_byte() {
        assert!(matches!(
            Name::new("foo\0bar"),
            Err(NameError::ContainsNul)
        ));
    }
}
