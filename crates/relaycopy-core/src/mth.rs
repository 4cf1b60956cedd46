//! Merkle Tree Hasher.
//!
//! Content is split into [`MTH_BLOCK_SIZE`] blocks. Each block is a leaf
//! hashed with the leaf key; parents hash `left || right` with the node key.
//! Nodes of equal height fold as soon as both exist, so the sequential
//! hasher needs only O(log n) memory and no length in advance.
//!
//! A hasher may start at a non-zero offset (resuming a partial download).
//! The skipped prefix is reconciled later with [`MerkleTree::preadd_from`];
//! the resulting root is identical to hashing the whole stream in one pass.
//!
//! Two leaf stores are provided: [`MthSeq`] folds as it goes, [`MthFat`]
//! keeps every leaf and folds level by level at the end. They agree
//! bit-for-bit and the fat variant exists to cross-check the sequential one.

use std::io::{self, Read, Write};

use crate::error::{CoreError, Result};
use crate::types::ContentHash;

/// Leaf block size.
pub const MTH_BLOCK_SIZE: usize = 128 * 1024;

const LEAF_DOMAIN: &[u8] = b"relaycopy mth leaf";
const NODE_DOMAIN: &[u8] = b"relaycopy mth node";

/// Keys for leaf and node hashing.
#[derive(Clone, Copy)]
pub struct TreeKeys {
    leaf: [u8; 32],
    node: [u8; 32],
}

impl TreeKeys {
    fn new() -> Self {
        Self {
            leaf: *blake3::hash(LEAF_DOMAIN).as_bytes(),
            node: *blake3::hash(NODE_DOMAIN).as_bytes(),
        }
    }

    fn leaf(&self, block: &[u8]) -> [u8; 32] {
        *blake3::keyed_hash(&self.leaf, block).as_bytes()
    }

    fn node(&self, left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_keyed(&self.node);
        hasher.update(left);
        hasher.update(right);
        *hasher.finalize().as_bytes()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Leaf stores
// ─────────────────────────────────────────────────────────────────────────────

/// Where leaf hashes go, and how they fold into a root.
pub trait LeafStore: Default + Send + 'static {
    /// Absorb the leaf with index `ctr`.
    fn push(&mut self, keys: &TreeKeys, ctr: u64, hash: [u8; 32]);

    /// Absorb every leaf of `other`, which directly follows ours.
    fn append(&mut self, keys: &TreeKeys, other: Self);

    /// Number of leaves absorbed so far.
    fn leaves(&self) -> u64;

    /// Fold into the root. Needs at least one leaf.
    fn root(self, keys: &TreeKeys) -> [u8; 32];
}

#[derive(Clone, Copy)]
struct Entry {
    level: u32,
    ctr: u64,
    hash: [u8; 32],
}

/// Fold-as-you-go stack of not-yet-paired subtrees.
#[derive(Default)]
pub struct SeqStack {
    entries: Vec<Entry>,
    leaves: u64,
}

impl SeqStack {
    fn push_entry(&mut self, keys: &TreeKeys, entry: Entry) {
        self.entries.push(entry);
        while self.entries.len() >= 2 {
            let n = self.entries.len();
            let (left, right) = (self.entries[n - 2], self.entries[n - 1]);
            if left.level != right.level || left.ctr % 2 != 0 {
                break;
            }
            self.entries.truncate(n - 2);
            self.entries.push(Entry {
                level: left.level + 1,
                ctr: left.ctr / 2,
                hash: keys.node(&left.hash, &right.hash),
            });
        }
    }
}

impl LeafStore for SeqStack {
    fn push(&mut self, keys: &TreeKeys, ctr: u64, hash: [u8; 32]) {
        self.push_entry(keys, Entry { level: 0, ctr, hash });
        self.leaves += 1;
    }

    fn append(&mut self, keys: &TreeKeys, other: Self) {
        // Entries of `other` are aligned subtrees, so pushing them through
        // the same fold reproduces the stack of a single pass.
        for entry in other.entries {
            self.push_entry(keys, entry);
        }
        self.leaves += other.leaves;
    }

    fn leaves(&self) -> u64 {
        self.leaves
    }

    fn root(mut self, keys: &TreeKeys) -> [u8; 32] {
        if self.leaves == 1 {
            let only = self.entries[0].hash;
            return keys.node(&only, &only);
        }
        while self.entries.len() > 1 {
            let (Some(right), Some(left)) = (self.entries.pop(), self.entries.pop()) else {
                break;
            };
            self.entries.push(Entry {
                level: left.level + 1,
                ctr: left.ctr / 2,
                hash: keys.node(&left.hash, &right.hash),
            });
        }
        self.entries.first().map(|e| e.hash).unwrap_or([0u8; 32])
    }
}

/// Every leaf hash kept in memory.
#[derive(Default)]
pub struct FatLeaves {
    hashes: Vec<[u8; 32]>,
}

impl LeafStore for FatLeaves {
    fn push(&mut self, _keys: &TreeKeys, _ctr: u64, hash: [u8; 32]) {
        self.hashes.push(hash);
    }

    fn append(&mut self, _keys: &TreeKeys, other: Self) {
        self.hashes.extend(other.hashes);
    }

    fn leaves(&self) -> u64 {
        self.hashes.len() as u64
    }

    fn root(self, keys: &TreeKeys) -> [u8; 32] {
        let mut level = self.hashes;
        if level.len() == 1 {
            return keys.node(&level[0], &level[0]);
        }
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => keys.node(left, right),
                    [odd] => *odd,
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();
        }
        level.first().copied().unwrap_or([0u8; 32])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hasher
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded-memory sequential hasher.
pub type MthSeq = MerkleTree<SeqStack>;

/// Reference hasher keeping all leaves.
pub type MthFat = MerkleTree<FatLeaves>;

/// Streaming Merkle tree hasher, optionally starting at a byte offset.
pub struct MerkleTree<L: LeafStore> {
    keys: TreeKeys,
    offset: u64,
    /// Leaves fully covered by the skipped prefix.
    skip: u64,
    /// Bytes of the skipped prefix that fall into the block straddling `offset`.
    head_len: usize,
    /// Written bytes completing the straddling block.
    joint_tail: Vec<u8>,
    buf: Vec<u8>,
    next_ctr: u64,
    written: u64,
    suffix: L,
    prefix: Option<(L, Vec<u8>)>,
    root: Option<ContentHash>,
}

impl<L: LeafStore> MerkleTree<L> {
    /// Hasher for a stream starting at byte zero.
    pub fn new() -> Self {
        Self::new_at(0)
    }

    /// Hasher whose writes start at `offset`; the prefix must later be fed
    /// through [`preadd_from`](Self::preadd_from) before [`sum`](Self::sum).
    pub fn new_at(offset: u64) -> Self {
        let block = MTH_BLOCK_SIZE as u64;
        let skip = offset / block;
        let head_len = (offset % block) as usize;
        Self {
            keys: TreeKeys::new(),
            offset,
            skip,
            head_len,
            joint_tail: Vec::new(),
            buf: Vec::with_capacity(MTH_BLOCK_SIZE),
            next_ctr: if head_len > 0 { skip + 1 } else { skip },
            written: 0,
            suffix: L::default(),
            prefix: None,
            root: None,
        }
    }

    /// Offset the hasher was started at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Absolute stream position reached by writes so far.
    pub fn position(&self) -> u64 {
        self.offset + self.written
    }

    /// Whether [`sum`](Self::sum) can run without a prefix.
    pub fn needs_prefix(&self) -> bool {
        self.offset > 0 && self.prefix.is_none()
    }

    fn feed(&mut self, mut data: &[u8]) {
        self.written += data.len() as u64;

        if self.head_len > 0 {
            let want = MTH_BLOCK_SIZE - self.head_len - self.joint_tail.len();
            let take = want.min(data.len());
            self.joint_tail.extend_from_slice(&data[..take]);
            data = &data[take..];
        }

        while !data.is_empty() {
            let take = (MTH_BLOCK_SIZE - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == MTH_BLOCK_SIZE {
                let leaf = self.keys.leaf(&self.buf);
                self.suffix.push(&self.keys, self.next_ctr, leaf);
                self.next_ctr += 1;
                self.buf.clear();
            }
        }
    }

    /// Reconcile the skipped prefix: reads exactly `offset` bytes.
    pub fn preadd_from<R: Read>(&mut self, mut reader: R) -> Result<()> {
        if self.root.is_some() {
            return Err(CoreError::HasherFinished);
        }
        let mut prefix = L::default();
        let mut block = vec![0u8; MTH_BLOCK_SIZE];
        for ctr in 0..self.skip {
            reader.read_exact(&mut block)?;
            prefix.push(&self.keys, ctr, self.keys.leaf(&block));
        }
        let mut head = vec![0u8; self.head_len];
        reader.read_exact(&mut head)?;
        self.prefix = Some((prefix, head));
        Ok(())
    }

    /// Finish and return the root. Calling again returns the same root.
    pub fn sum(&mut self) -> Result<ContentHash> {
        if let Some(root) = self.root {
            return Ok(root);
        }

        let (mut all, head) = if self.offset > 0 {
            self.prefix.take().ok_or(CoreError::PrefixMissing(self.offset))?
        } else {
            (L::default(), Vec::new())
        };

        if self.head_len > 0 {
            let mut joint = head;
            joint.extend_from_slice(&self.joint_tail);
            all.push(&self.keys, self.skip, self.keys.leaf(&joint));
        }
        all.append(&self.keys, std::mem::take(&mut self.suffix));
        if !self.buf.is_empty() {
            all.push(&self.keys, self.next_ctr, self.keys.leaf(&self.buf));
            self.buf.clear();
        }
        if all.leaves() == 0 {
            all.push(&self.keys, 0, self.keys.leaf(&[]));
        }

        let root = ContentHash(all.root(&self.keys));
        self.root = Some(root);
        Ok(root)
    }
}

impl<L: LeafStore> Default for MerkleTree<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: LeafStore> Write for MerkleTree<L> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.root.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                CoreError::HasherFinished,
            ));
        }
        self.feed(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Hash an in-memory blob.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    let mut mth = MthSeq::new();
    mth.feed(data);
    // A fresh zero-offset hasher never lacks a prefix.
    mth.sum().unwrap_or(ContentHash::ZERO)
}

/// Hash everything a reader yields.
pub fn hash_reader<R: Read>(mut reader: R) -> Result<ContentHash> {
    let mut mth = MthSeq::new();
    io::copy(&mut reader, &mut mth)?;
    mth.sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, RngCore, SeedableRng};

    const B: usize = MTH_BLOCK_SIZE;

    fn data(seed: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        StdRng::seed_from_u64(seed).fill_bytes(&mut out);
        out
    }

    fn fat(data: &[u8]) -> ContentHash {
        let mut mth = MthFat::new();
        mth.write_all(data).unwrap();
        mth.sum().unwrap()
    }

    fn resumed(data: &[u8], k: usize) -> ContentHash {
        let mut mth = MthSeq::new_at(k as u64);
        mth.write_all(&data[k..]).unwrap();
        mth.preadd_from(&data[..k]).unwrap();
        mth.sum().unwrap()
    }

    #[test]
    fn test_empty_differs_from_zero_byte() {
        assert_ne!(hash_bytes(b""), hash_bytes(b"\0"));
    }

    #[test]
    fn test_single_leaf_is_duplicated() {
        let keys = TreeKeys::new();
        let leaf = keys.leaf(b"hello");
        assert_eq!(hash_bytes(b"hello").0, keys.node(&leaf, &leaf));
        assert_ne!(hash_bytes(b"hello").0, leaf);
    }

    #[test]
    fn test_two_leaves() {
        let keys = TreeKeys::new();
        let d = data(1, B + 10);
        let expected = keys.node(&keys.leaf(&d[..B]), &keys.leaf(&d[B..]));
        assert_eq!(hash_bytes(&d).0, expected);
    }

    #[test]
    fn test_fat_matches_seq_across_leaf_counts() {
        for leaves in [0usize, 1, 2, 3, 5, 6, 7, 8, 11, 12] {
            for extra in [0usize, 1] {
                let d = data(leaves as u64, leaves * B + extra);
                assert_eq!(hash_bytes(&d), fat(&d), "leaves={} extra={}", leaves, extra);
            }
        }
    }

    #[test]
    fn test_sum_is_idempotent() {
        let mut mth = MthSeq::new();
        mth.write_all(&data(2, 3 * B + 7)).unwrap();
        let first = mth.sum().unwrap();
        assert_eq!(mth.sum().unwrap(), first);
        assert!(mth.write(b"more").is_err());
    }

    #[test]
    fn test_resume_requires_prefix() {
        let mut mth = MthSeq::new_at(100);
        mth.write_all(b"tail").unwrap();
        assert!(mth.needs_prefix());
        assert!(matches!(mth.sum(), Err(CoreError::PrefixMissing(100))));
    }

    #[test]
    fn test_resume_at_block_boundaries() {
        let d = data(3, 4 * B + 333);
        let whole = hash_bytes(&d);
        for k in [0, 1, B - 1, B, B + 1, 2 * B, 4 * B, 4 * B + 333] {
            assert_eq!(resumed(&d, k), whole, "k={}", k);
        }
    }

    #[test]
    fn test_resume_short_prefix_is_error() {
        let mut mth = MthSeq::new_at(10);
        assert!(mth.preadd_from(&b"short"[..]).is_err());
    }

    #[test]
    fn test_position_tracks_offset() {
        let mut mth = MthFat::new_at(50);
        mth.write_all(&[0u8; 25]).unwrap();
        assert_eq!(mth.position(), 75);
        assert_eq!(mth.offset(), 50);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_split_invariance(seed in any::<u64>(), len in 0usize..(3 * B + 500), split in any::<usize>()) {
            let d = data(seed, len);
            let k = split % (len + 1);
            prop_assert_eq!(resumed(&d, k), hash_bytes(&d));
        }

        #[test]
        fn prop_chunking_invariance(seed in any::<u64>(), len in 0usize..(2 * B + 500), chunks in prop::collection::vec(1usize..70_000, 1..20)) {
            let d = data(seed, len);
            let mut mth = MthSeq::new();
            let mut rest = &d[..];
            for size in chunks.iter().cycle() {
                if rest.is_empty() {
                    break;
                }
                let n = (*size).min(rest.len());
                mth.write_all(&rest[..n]).unwrap();
                rest = &rest[n..];
            }
            prop_assert_eq!(mth.sum().unwrap(), hash_bytes(&d));
        }

        #[test]
        fn prop_fat_equals_seq(seed in any::<u64>(), len in 0usize..(5 * B)) {
            let d = data(seed, len);
            prop_assert_eq!(fat(&d), hash_bytes(&d));
        }

        #[test]
        fn prop_appending_changes_root(seed in any::<u64>(), len in 0usize..(2 * B + 10), byte in any::<u8>()) {
            let mut d = data(seed, len);
            let before = hash_bytes(&d);
            d.push(byte);
            prop_assert_ne!(before, hash_bytes(&d));
        }
    }
}
