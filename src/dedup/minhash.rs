//! MinHash signatures and LSH banding for bulk Jaccard-similarity queries.
//!
//! K=128 hash permutations over the same w=5 token shingles as SimHash.
//! The LSH index uses 16 bands of 8 rows; the S-curve crosses ~0.5 around
//! Jaccard ≈ (1/16)^(1/8) ≈ 0.71 and is steep by 0.8, the target
//! threshold.

use dashmap::DashMap;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use super::simhash::SHINGLE_W;

pub const NUM_PERMUTATIONS: usize = 128;
pub const LSH_BANDS: usize = 16;
pub const LSH_ROWS: usize = 8;

/// A document's MinHash signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinHashSignature(pub Vec<u64>);

impl MinHashSignature {
    /// Compute the signature of a document's text. Deterministic: seeded
    /// permutation hashes, no RNG state.
    pub fn of(text: &str) -> Self {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let mut shingle_hashes: Vec<u64> = Vec::new();

        if tokens.len() < SHINGLE_W {
            for token in &tokens {
                shingle_hashes.push(xxh3_64_with_seed(token.as_bytes(), 0));
            }
        } else {
            for window in tokens.windows(SHINGLE_W) {
                shingle_hashes.push(xxh3_64_with_seed(window.join(" ").as_bytes(), 0));
            }
        }

        let mut signature = vec![u64::MAX; NUM_PERMUTATIONS];
        for &shingle in &shingle_hashes {
            for (perm, slot) in signature.iter_mut().enumerate() {
                // Re-hash the shingle under a per-permutation seed instead
                // of materializing permutation tables.
                let h = xxh3_64_with_seed(&shingle.to_le_bytes(), perm as u64 + 1);
                if h < *slot {
                    *slot = h;
                }
            }
        }

        MinHashSignature(signature)
    }

    /// Estimated Jaccard similarity: fraction of agreeing slots.
    pub fn jaccard(&self, other: &MinHashSignature) -> f64 {
        let agreeing = self
            .0
            .iter()
            .zip(other.0.iter())
            .filter(|(a, b)| a == b)
            .count();
        agreeing as f64 / NUM_PERMUTATIONS as f64
    }

    fn band_key(&self, band: usize) -> u64 {
        let start = band * LSH_ROWS;
        let mut bytes = Vec::with_capacity(LSH_ROWS * 8);
        for slot in &self.0[start..start + LSH_ROWS] {
            bytes.extend_from_slice(&slot.to_le_bytes());
        }
        xxh3_64_with_seed(&bytes, band as u64)
    }
}

/// Append-only LSH index over MinHash signatures.
///
/// Documents sharing at least one band bucket with the query are
/// candidates; candidates are then confirmed against the estimated
/// Jaccard threshold.
#[derive(Default)]
pub struct MinHashLsh {
    buckets: DashMap<(u8, u64), Vec<String>>,
    signatures: DashMap<String, MinHashSignature>,
}

impl MinHashLsh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, doc_id: &str, signature: MinHashSignature) {
        for band in 0..LSH_BANDS {
            self.buckets
                .entry((band as u8, signature.band_key(band)))
                .or_default()
                .push(doc_id.to_string());
        }
        self.signatures.insert(doc_id.to_string(), signature);
    }

    /// Documents with estimated Jaccard ≥ `min_jaccard` against the query.
    pub fn query(&self, signature: &MinHashSignature, min_jaccard: f64) -> Vec<(String, f64)> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();

        for band in 0..LSH_BANDS {
            let Some(bucket) = self.buckets.get(&(band as u8, signature.band_key(band))) else {
                continue;
            };
            for doc_id in bucket.iter() {
                if !seen.insert(doc_id.clone()) {
                    continue;
                }
                if let Some(stored) = self.signatures.get(doc_id) {
                    let similarity = signature.jaccard(&stored);
                    if similarity >= min_jaccard {
                        out.push((doc_id.clone(), similarity));
                    }
                }
            }
        }

        out.sort_by(|a, b| b.1.total_cmp(&a.1));
        out
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(prefix: &str, n: usize) -> String {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_signature_deterministic() {
        let text = doc("w", 300);
        assert_eq!(MinHashSignature::of(&text), MinHashSignature::of(&text));
    }

    #[test]
    fn test_identical_docs_estimate_one() {
        let text = doc("w", 300);
        let a = MinHashSignature::of(&text);
        let b = MinHashSignature::of(&text);
        assert!((a.jaccard(&b) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_disjoint_docs_estimate_near_zero() {
        let a = MinHashSignature::of(&doc("alpha", 300));
        let b = MinHashSignature::of(&doc("beta", 300));
        assert!(a.jaccard(&b) < 0.2);
    }

    #[test]
    fn test_lsh_finds_identical_document() {
        let index = MinHashLsh::new();
        let text = doc("w", 300);
        index.insert("original", MinHashSignature::of(&text));

        let hits = index.query(&MinHashSignature::of(&text), 0.85);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "original");
        assert!(hits[0].1 >= 0.99);
    }

    #[test]
    fn test_lsh_finds_high_overlap_document() {
        // 95% shared shingles comfortably clears the 0.8 banding knee
        let index = MinHashLsh::new();
        let base = doc("w", 1_000);
        index.insert("original", MinHashSignature::of(&base));

        let mut tokens: Vec<String> = base.split_whitespace().map(String::from).collect();
        let len = tokens.len();
        tokens.truncate(len - 10);
        let trimmed = tokens.join(" ");

        let hits = index.query(&MinHashSignature::of(&trimmed), 0.85);
        assert!(
            hits.iter().any(|(id, _)| id == "original"),
            "near-identical doc not found: {:?}",
            hits
        );
    }

    #[test]
    fn test_lsh_excludes_dissimilar_document() {
        let index = MinHashLsh::new();
        index.insert("original", MinHashSignature::of(&doc("alpha", 300)));
        let hits = index.query(&MinHashSignature::of(&doc("beta", 300)), 0.8);
        assert!(hits.is_empty());
    }
}
