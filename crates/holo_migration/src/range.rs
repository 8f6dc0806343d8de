//! Shard, namespace and chunk range identities.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MigrationError, MigrationResult};

/// Name of a shard in the cluster topology.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Logical collection name, `db.collection`.
///
/// A namespace can go stale relative to the collection uuid after a rename or
/// a drop/recreate; the uuid is the identity, the namespace is the lookup key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(ns: impl Into<String>) -> Self {
        Self(ns.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Namespace {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Half-open key interval `[min, max)`. Keys are lexicographic byte strings
/// and an empty `max` means the range is unbounded on the right.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub min: Vec<u8>,
    pub max: Vec<u8>,
}

impl ChunkRange {
    /// Builds a range, rejecting empty or inverted intervals.
    pub fn new(min: impl Into<Vec<u8>>, max: impl Into<Vec<u8>>) -> MigrationResult<Self> {
        let range = Self {
            min: min.into(),
            max: max.into(),
        };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> MigrationResult<()> {
        if !self.max.is_empty() && self.min >= self.max {
            return Err(MigrationError::InvalidRange(format!(
                "min must sort before max in {self}"
            )));
        }
        Ok(())
    }

    pub fn is_unbounded(&self) -> bool {
        self.max.is_empty()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.min.as_slice() && below_max(key, &self.max)
    }

    /// True iff the two intervals share at least one key. Touching ranges
    /// (`self.max == other.min`) do not overlap.
    pub fn overlaps(&self, other: &ChunkRange) -> bool {
        below_max(&self.min, &other.max) && below_max(&other.min, &self.max)
    }
}

fn below_max(key: &[u8], max: &[u8]) -> bool {
    max.is_empty() || key < max
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.max.is_empty() {
            write!(f, "[{}, +inf)", self.min.escape_ascii())
        } else {
            write!(f, "[{}, {})", self.min.escape_ascii(), self.max.escape_ascii())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: &str, max: &str) -> ChunkRange {
        ChunkRange::new(min.as_bytes(), max.as_bytes()).expect("valid range")
    }

    #[test]
    fn overlap_follows_half_open_semantics() {
        let base = range("k10", "k20");
        assert!(base.overlaps(&range("k15", "k25")));
        assert!(base.overlaps(&range("k05", "k11")));
        assert!(base.overlaps(&range("k12", "k13")));
        assert!(base.overlaps(&range("k00", "k99")));
        assert!(base.overlaps(&base));

        assert!(!base.overlaps(&range("k20", "k30")), "adjacent on the right");
        assert!(!base.overlaps(&range("k00", "k10")), "adjacent on the left");
        assert!(!base.overlaps(&range("k30", "k40")));
    }

    #[test]
    fn overlap_is_symmetric() {
        let ranges = [
            range("a", "c"),
            range("b", "d"),
            range("c", "e"),
            range("x", "z"),
            ChunkRange::new(b"d".to_vec(), Vec::<u8>::new()).expect("unbounded"),
        ];
        for a in &ranges {
            for b in &ranges {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn unbounded_max_covers_the_tail() {
        let tail = ChunkRange::new(b"m".to_vec(), Vec::<u8>::new()).expect("unbounded");
        assert!(tail.is_unbounded());
        assert!(tail.contains(b"zzzz"));
        assert!(!tail.contains(b"a"));
        assert!(tail.overlaps(&range("y", "z")));
        assert!(!tail.overlaps(&range("a", "m")));
    }

    #[test]
    fn rejects_empty_and_inverted_ranges() {
        assert!(ChunkRange::new(b"k20".to_vec(), b"k10".to_vec()).is_err());
        assert!(ChunkRange::new(b"k10".to_vec(), b"k10".to_vec()).is_err());
    }

    #[test]
    fn contains_excludes_max() {
        let r = range("k10", "k20");
        assert!(r.contains(b"k10"));
        assert!(r.contains(b"k19"));
        assert!(!r.contains(b"k20"));
    }
}
