//! Content deduplication: exact (SHA-256) and near-duplicate (SimHash)
//! tiers, with a MinHash/LSH index for bulk similarity queries.
//!
//! All indexes are append-only. Writes for a given fingerprint go through
//! a striped lock so two workers landing the same content at once cannot
//! both register it as unique.

pub mod minhash;
pub mod simhash;

use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use minhash::{MinHashLsh, MinHashSignature};
use simhash::SimHashIndex;

const STRIPES: usize = 64;

/// Fingerprints of one document, computed exactly once per fetch result.
/// All three fields are deterministic functions of the text.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub sha256: [u8; 32],
    pub simhash: u64,
    pub minhash: MinHashSignature,
}

impl Fingerprint {
    pub fn of(text: &str) -> Self {
        let normalized = normalize_body(text);
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        let sha256 = hasher.finalize().into();

        Self {
            sha256,
            simhash: simhash::simhash(&normalized),
            minhash: MinHashSignature::of(&normalized),
        }
    }

    pub fn sha_hex(&self) -> String {
        self.sha256.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Whitespace-collapse normalization applied before hashing so markup
/// reflow does not defeat the exact tier.
fn normalize_body(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Outcome of a dedup check.
#[derive(Debug, Clone, PartialEq)]
pub enum DedupVerdict {
    Unique,
    /// Byte-identical normalized content already stored under `of`.
    ExactDuplicate { of: String },
    /// SimHash within the near-dup threshold of `of`.
    NearDuplicate { of: String, hamming: u32 },
}

impl DedupVerdict {
    pub fn tier(&self) -> Option<&'static str> {
        match self {
            DedupVerdict::Unique => None,
            DedupVerdict::ExactDuplicate { .. } => Some("exact"),
            DedupVerdict::NearDuplicate { .. } => Some("near"),
        }
    }
}

/// Two-tier content deduplicator.
pub struct ContentDeduper {
    exact: DashMap<[u8; 32], String>,
    near: SimHashIndex,
    lsh: MinHashLsh,
    /// Canonical URL -> URL it aliases (exact duplicates).
    aliases: DashMap<String, String>,
    stripes: Vec<Mutex<()>>,
}

impl ContentDeduper {
    pub fn new() -> Self {
        Self {
            exact: DashMap::new(),
            near: SimHashIndex::new(),
            lsh: MinHashLsh::new(),
            aliases: DashMap::new(),
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Check a document against both tiers and, if unique, register it.
    /// The check-and-insert pair is atomic per fingerprint stripe.
    pub fn check_and_insert(&self, url: &str, fingerprint: &Fingerprint) -> DedupVerdict {
        let stripe = fingerprint.sha256[0] as usize % STRIPES;
        let _guard = self.stripes[stripe].lock();

        if let Some(original) = self.exact.get(&fingerprint.sha256) {
            let verdict = DedupVerdict::ExactDuplicate {
                of: original.clone(),
            };
            self.aliases.insert(url.to_string(), original.clone());
            return verdict;
        }

        if let Some((original, hamming)) = self.near.find_near(fingerprint.simhash) {
            // Register the exact hash so byte-identical re-fetches of this
            // variant short-circuit on the first tier next time.
            self.exact.insert(fingerprint.sha256, url.to_string());
            return DedupVerdict::NearDuplicate {
                of: original,
                hamming,
            };
        }

        self.exact.insert(fingerprint.sha256, url.to_string());
        self.near.insert(fingerprint.simhash, url);
        self.lsh.insert(url, fingerprint.minhash.clone());
        DedupVerdict::Unique
    }

    /// Bulk similarity query: documents with estimated Jaccard ≥
    /// `min_jaccard` against the given signature.
    pub fn similar_to(&self, signature: &MinHashSignature, min_jaccard: f64) -> Vec<(String, f64)> {
        self.lsh.query(signature, min_jaccard)
    }

    /// The URL a duplicate was recorded as an alias of, if any.
    pub fn alias_of(&self, url: &str) -> Option<String> {
        self.aliases.get(url).map(|v| v.clone())
    }

    pub fn unique_documents(&self) -> usize {
        self.lsh.len()
    }
}

impl Default for ContentDeduper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_stable_across_whitespace() {
        let a = Fingerprint::of("hello   world\n\tfoo");
        let b = Fingerprint::of("hello world foo");
        assert_eq!(a.sha256, b.sha256);
        assert_eq!(a.simhash, b.simhash);
    }

    #[test]
    fn test_fingerprint_computed_once_is_bit_identical() {
        let text = "some document body with enough words to shingle over nicely";
        let a = Fingerprint::of(text);
        let b = Fingerprint::of(text);
        assert_eq!(a.sha256, b.sha256);
        assert_eq!(a.simhash, b.simhash);
        assert_eq!(a.minhash, b.minhash);
    }

    #[test]
    fn test_exact_duplicate_records_alias() {
        let deduper = ContentDeduper::new();
        let fp = Fingerprint::of("identical content here for the exact tier");

        assert_eq!(
            deduper.check_and_insert("https://h/a", &fp),
            DedupVerdict::Unique
        );
        assert_eq!(
            deduper.check_and_insert("https://h/mirror", &fp),
            DedupVerdict::ExactDuplicate {
                of: "https://h/a".to_string()
            }
        );
        assert_eq!(
            deduper.alias_of("https://h/mirror").as_deref(),
            Some("https://h/a")
        );
    }

    #[test]
    fn test_near_duplicate_tier() {
        let deduper = ContentDeduper::new();

        // Hand-built fingerprints pin the simhash distance exactly.
        let mut fp_a = Fingerprint::of("document a");
        fp_a.simhash = 0xAAAA_BBBB_CCCC_DDDD;
        let mut fp_b = Fingerprint::of("document b");
        fp_b.simhash = fp_a.simhash ^ 0b101; // two bits apart

        assert_eq!(
            deduper.check_and_insert("https://h/a", &fp_a),
            DedupVerdict::Unique
        );
        match deduper.check_and_insert("https://h/b", &fp_b) {
            DedupVerdict::NearDuplicate { of, hamming } => {
                assert_eq!(of, "https://h/a");
                assert_eq!(hamming, 2);
            }
            other => panic!("expected near duplicate, got {:?}", other),
        }
    }

    #[test]
    fn test_distinct_content_is_unique() {
        let deduper = ContentDeduper::new();
        let texts = [
            "first entirely distinct document about gardening and soil quality",
            "second document concerning orbital mechanics and launch windows",
            "third text on the history of typography and metal type",
        ];
        for (i, text) in texts.iter().enumerate() {
            let fp = Fingerprint::of(text);
            assert_eq!(
                deduper.check_and_insert(&format!("https://h/{}", i), &fp),
                DedupVerdict::Unique
            );
        }
        assert_eq!(deduper.unique_documents(), 3);
    }

    #[test]
    fn test_similarity_query() {
        let deduper = ContentDeduper::new();
        let base: String = (0..500).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        let fp = Fingerprint::of(&base);
        deduper.check_and_insert("https://h/base", &fp);

        let hits = deduper.similar_to(&fp.minhash, 0.85);
        assert!(hits.iter().any(|(id, _)| id == "https://h/base"));
    }
}
