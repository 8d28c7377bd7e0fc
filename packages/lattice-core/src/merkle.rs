//! Fixed-fanout Merkle tree for anti-entropy synchronization.
//!
//! The tree has fanout 16 and a fixed depth chosen at construction. A key
//! lands in the leaf bucket `fnv1a_64(key) % 16^depth`; the bucket hash
//! folds the entry hashes of its keys in key order, and every internal
//! node folds its 16 children. Two replicas holding identical content
//! therefore produce identical root hashes, and a mismatching root can be
//! narrowed down to the differing buckets in `depth` round trips.
//!
//! Paths address nodes as hex-digit strings: `""` is the root, `"a"` is
//! child 10 of the root, `"a3"` a grandchild, and a string of `depth`
//! digits names a leaf bucket. Each mutation recomputes the affected
//! bucket and its `O(depth)` ancestors; reading the root is constant time.

use std::collections::BTreeMap;

use crate::hash::{combine_hashes, fnv1a_64};

/// Number of children per internal node.
pub const FANOUT: usize = 16;

/// Default tree depth: `16^3 = 4096` leaf buckets.
pub const DEFAULT_DEPTH: usize = 3;

/// Hash value of an empty bucket or empty subtree.
pub const EMPTY_HASH: u64 = 0;

/// A fixed-depth, fanout-16 hash tree over keyed entry hashes.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    depth: usize,
    /// Leaf buckets: key -> entry hash, iterated in key order for hashing.
    buckets: Vec<BTreeMap<String, u64>>,
    /// `levels[d]` holds the `16^d` node hashes of level `d`;
    /// `levels[0]` is the root, `levels[depth]` the leaf hashes.
    levels: Vec<Vec<u64>>,
}

impl MerkleTree {
    /// Creates an empty tree with the given depth.
    ///
    /// # Panics
    ///
    /// Panics if `depth` is 0 or larger than 7 (the bucket array would
    /// exceed 256M slots).
    #[must_use]
    pub fn new(depth: usize) -> Self {
        assert!(
            (1..=7).contains(&depth),
            "merkle depth must be in 1..=7, got {depth}"
        );
        let levels = (0..=depth).map(|d| vec![EMPTY_HASH; FANOUT.pow(d as u32)]).collect();
        Self {
            depth,
            buckets: vec![BTreeMap::new(); FANOUT.pow(depth as u32)],
            levels,
        }
    }

    /// Creates a tree with [`DEFAULT_DEPTH`].
    #[must_use]
    pub fn default_depth() -> Self {
        Self::new(DEFAULT_DEPTH)
    }

    /// The configured depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Total number of leaf buckets (`16^depth`).
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(BTreeMap::len).sum()
    }

    /// Whether the tree tracks no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(BTreeMap::is_empty)
    }

    /// Leaf bucket index for a key.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // bucket_count <= 16^7 < u32::MAX
    pub fn bucket_of(&self, key: &str) -> usize {
        (fnv1a_64(key) % self.buckets.len() as u64) as usize
    }

    /// Inserts or replaces the entry hash for a key and recomputes the
    /// affected bucket plus its ancestors.
    pub fn update(&mut self, key: &str, entry_hash: u64) {
        let bucket = self.bucket_of(key);
        self.buckets[bucket].insert(key.to_string(), entry_hash);
        self.recompute_from(bucket);
    }

    /// Removes a key, returning whether it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        let bucket = self.bucket_of(key);
        let removed = self.buckets[bucket].remove(key).is_some();
        if removed {
            self.recompute_from(bucket);
        }
        removed
    }

    /// Root hash of the whole tree. [`EMPTY_HASH`] when no keys are tracked.
    #[must_use]
    pub fn root_hash(&self) -> u64 {
        self.levels[0][0]
    }

    /// Whether a path addresses a leaf bucket.
    #[must_use]
    pub fn is_leaf_path(&self, path: &str) -> bool {
        path.len() == self.depth
    }

    /// The 16 child hashes under an internal node path.
    ///
    /// Returns `None` for invalid paths or paths addressing leaves (leaves
    /// have entries, not children; use [`MerkleTree::keys_in_bucket`]).
    #[must_use]
    pub fn child_hashes(&self, path: &str) -> Option<Vec<u64>> {
        if path.len() >= self.depth {
            return None;
        }
        let index = parse_path(path)?;
        let child_level = &self.levels[path.len() + 1];
        let start = index * FANOUT;
        Some(child_level[start..start + FANOUT].to_vec())
    }

    /// The node hash at an arbitrary path (root, internal, or leaf).
    #[must_use]
    pub fn node_hash(&self, path: &str) -> Option<u64> {
        if path.len() > self.depth {
            return None;
        }
        let index = parse_path(path)?;
        Some(self.levels[path.len()][index])
    }

    /// All keys stored in the leaf bucket at `path`, in key order.
    ///
    /// Returns `None` unless `path` addresses a leaf bucket.
    #[must_use]
    pub fn keys_in_bucket(&self, path: &str) -> Option<Vec<String>> {
        if !self.is_leaf_path(path) {
            return None;
        }
        let index = parse_path(path)?;
        Some(self.buckets[index].keys().cloned().collect())
    }

    /// The leaf-bucket path for a key, as a hex-digit string.
    #[must_use]
    pub fn path_of(&self, key: &str) -> String {
        let mut bucket = self.bucket_of(key);
        let mut digits = vec![0_usize; self.depth];
        for d in (0..self.depth).rev() {
            digits[d] = bucket % FANOUT;
            bucket /= FANOUT;
        }
        digits
            .into_iter()
            .map(|d| char::from_digit(d as u32, 16).expect("digit < 16"))
            .collect()
    }

    /// Recomputes the leaf hash for `bucket` and all ancestors up to the root.
    fn recompute_from(&mut self, bucket: usize) {
        let leaf = &self.buckets[bucket];
        self.levels[self.depth][bucket] = if leaf.is_empty() {
            EMPTY_HASH
        } else {
            let entry_hashes: Vec<u64> = leaf.values().copied().collect();
            combine_hashes(&entry_hashes)
        };

        let mut index = bucket;
        for level in (0..self.depth).rev() {
            index /= FANOUT;
            let start = index * FANOUT;
            let children = &self.levels[level + 1][start..start + FANOUT];
            self.levels[level][index] = if children.iter().all(|&h| h == EMPTY_HASH) {
                EMPTY_HASH
            } else {
                combine_hashes(children)
            };
        }
    }
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::default_depth()
    }
}

/// Parses a hex-digit path string into a node index at its level.
fn parse_path(path: &str) -> Option<usize> {
    let mut index = 0_usize;
    for c in path.chars() {
        index = index * FANOUT + c.to_digit(16)? as usize;
    }
    Some(index)
}
