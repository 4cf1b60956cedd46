//! Determinism vectors for the Merkle tree hasher.
//!
//! Each vector names a content length and a seed. The root is computed four
//! ways (in one shot, in odd-sized writes, with the reference leaf store and
//! resumed from the middle) and every way must agree. Results serialise to
//! JSON so they can be compared across builds.

use std::io::Write;

use relaycopy_core::{hash_bytes, CoreError, ContentHash, MthFat, MthSeq, MTH_BLOCK_SIZE};
use serde::{Deserialize, Serialize};

use crate::generators::random_payload;

const B: usize = MTH_BLOCK_SIZE;

/// A determinism vector.
#[derive(Debug, Clone, Copy)]
pub struct DeterminismVector {
    /// Human-readable name for the vector.
    pub name: &'static str,
    /// Content length in bytes.
    pub len: usize,
    /// Seed of the pseudo-random content.
    pub seed: u64,
    /// Write size used for the chunked computation.
    pub chunk: usize,
}

/// Get all determinism vectors.
pub fn all_vectors() -> Vec<DeterminismVector> {
    vec![
        DeterminismVector { name: "empty", len: 0, seed: 0, chunk: 1 },
        DeterminismVector { name: "one byte", len: 1, seed: 1, chunk: 1 },
        DeterminismVector { name: "block minus one", len: B - 1, seed: 2, chunk: 4093 },
        DeterminismVector { name: "exact block", len: B, seed: 3, chunk: 65536 },
        DeterminismVector { name: "block plus one", len: B + 1, seed: 4, chunk: 7919 },
        DeterminismVector { name: "three blocks", len: 3 * B, seed: 5, chunk: B / 3 },
        DeterminismVector { name: "five blocks and a half", len: 5 * B + B / 2, seed: 6, chunk: 100_003 },
    ]
}

/// Roots of one vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorResult {
    pub name: String,
    pub len: usize,
    /// Root from a single write, hex.
    pub root: String,
    /// Root in the spool's base32 naming.
    pub name_base32: String,
    pub chunked: String,
    pub fat: String,
    pub resumed: String,
}

impl VectorResult {
    /// Whether every computation produced the same root.
    pub fn consistent(&self) -> bool {
        self.chunked == self.root && self.fat == self.root && self.resumed == self.root
    }
}

/// Compute a vector's roots.
pub fn compute(vector: &DeterminismVector) -> Result<VectorResult, CoreError> {
    let data = random_payload(vector.seed, vector.len);
    let root = hash_bytes(&data);

    let mut chunked = MthSeq::new();
    for piece in data.chunks(vector.chunk.max(1)) {
        chunked.write_all(piece)?;
    }

    let mut fat = MthFat::new();
    fat.write_all(&data)?;

    let half = vector.len / 2;
    let mut resumed = MthSeq::new_at(half as u64);
    resumed.write_all(&data[half..])?;
    if resumed.needs_prefix() {
        resumed.preadd_from(&data[..half])?;
    }

    Ok(VectorResult {
        name: vector.name.to_string(),
        len: vector.len,
        root: hex::encode(root.0),
        name_base32: root.to_base32(),
        chunked: hex_root(chunked.sum()?),
        fat: hex_root(fat.sum()?),
        resumed: hex_root(resumed.sum()?),
    })
}

fn hex_root(root: ContentHash) -> String {
    hex::encode(root.0)
}

/// Compute every vector.
pub fn verify_all_vectors() -> Result<Vec<VectorResult>, CoreError> {
    all_vectors().iter().map(compute).collect()
}

/// Render results as pretty JSON.
pub fn to_json(results: &[VectorResult]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vectors_are_consistent() {
        for result in verify_all_vectors().unwrap() {
            assert!(result.consistent(), "vector '{}' disagrees: {:?}", result.name, result);
        }
    }

    #[test]
    fn test_vectors_are_deterministic() {
        let first = verify_all_vectors().unwrap();
        let second = verify_all_vectors().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_roots_differ_between_vectors() {
        let results = verify_all_vectors().unwrap();
        for (i, a) in results.iter().enumerate() {
            for b in &results[i + 1..] {
                assert_ne!(a.root, b.root, "'{}' and '{}' collide", a.name, b.name);
            }
        }
    }

    #[test]
    fn test_json_round_trip() {
        let results = verify_all_vectors().unwrap();
        let json = to_json(&results).unwrap();
        let parsed: Vec<VectorResult> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, results);
        assert!(json.contains("\"name_base32\""));
    }
}
