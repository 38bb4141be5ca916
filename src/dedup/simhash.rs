//! 64-bit SimHash over token shingles, with a banded index for near-
//! duplicate lookup.
//!
//! Two documents are near-duplicates when their SimHashes differ in at
//! most `MAX_HAMMING` bits. The index shards each hash into four 16-bit
//! bands; by pigeonhole, any pair within distance 3 shares at least one
//! band, so a band-bucket scan finds every candidate.

use dashmap::DashMap;
use xxhash_rust::xxh3::xxh3_64;

/// Shingle width in tokens.
pub const SHINGLE_W: usize = 5;
/// Near-duplicate threshold in bits.
pub const MAX_HAMMING: u32 = 3;
const BANDS: usize = 4;

/// Compute the 64-bit SimHash of a document's text.
///
/// Deterministic: the same text always yields the same hash.
pub fn simhash(text: &str) -> u64 {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut weights = [0i64; 64];

    let mut add_feature = |hash: u64| {
        for (bit, weight) in weights.iter_mut().enumerate() {
            if hash & (1 << bit) != 0 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    };

    if tokens.len() < SHINGLE_W {
        // Short documents fall back to single-token features.
        for token in &tokens {
            add_feature(xxh3_64(token.as_bytes()));
        }
    } else {
        for window in tokens.windows(SHINGLE_W) {
            add_feature(xxh3_64(window.join(" ").as_bytes()));
        }
    }

    let mut hash = 0u64;
    for (bit, weight) in weights.iter().enumerate() {
        if *weight > 0 {
            hash |= 1 << bit;
        }
    }
    hash
}

pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

fn band(hash: u64, index: usize) -> u16 {
    ((hash >> (index * 16)) & 0xFFFF) as u16
}

/// Append-only near-duplicate index. Buckets candidates by 16-bit band;
/// a lookup scans at most four buckets.
#[derive(Debug, Default)]
pub struct SimHashIndex {
    /// (band index, band value) -> (full hash, document id) entries.
    buckets: DashMap<(u8, u16), Vec<(u64, String)>>,
}

impl SimHashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document's hash under all four bands.
    pub fn insert(&self, hash: u64, doc_id: &str) {
        for i in 0..BANDS {
            self.buckets
                .entry((i as u8, band(hash, i)))
                .or_default()
                .push((hash, doc_id.to_string()));
        }
    }

    /// Nearest stored document within `MAX_HAMMING`, if any.
    pub fn find_near(&self, hash: u64) -> Option<(String, u32)> {
        let mut best: Option<(String, u32)> = None;
        for i in 0..BANDS {
            if let Some(bucket) = self.buckets.get(&(i as u8, band(hash, i))) {
                for (candidate, doc_id) in bucket.iter() {
                    let distance = hamming(hash, *candidate);
                    if distance <= MAX_HAMMING {
                        match &best {
                            Some((_, d)) if *d <= distance => {}
                            _ => best = Some((doc_id.clone(), distance)),
                        }
                    }
                }
            }
        }
        best
    }

    /// All stored documents within `max_distance` of `hash`.
    pub fn candidates(&self, hash: u64, max_distance: u32) -> Vec<(String, u32)> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for i in 0..BANDS {
            if let Some(bucket) = self.buckets.get(&(i as u8, band(hash, i))) {
                for (candidate, doc_id) in bucket.iter() {
                    let distance = hamming(hash, *candidate);
                    if distance <= max_distance && seen.insert(doc_id.clone()) {
                        out.push((doc_id.clone(), distance));
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_text(n: usize) -> String {
        (0..n).map(|i| format!("token{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_deterministic() {
        let text = sample_text(100);
        assert_eq!(simhash(&text), simhash(&text));
    }

    #[test]
    fn test_single_token_change_is_near_duplicate() {
        let original = sample_text(20_000);
        let mut tokens: Vec<String> = original.split_whitespace().map(String::from).collect();
        tokens[10_000] = "changed".to_string();
        let modified = tokens.join(" ");

        let distance = hamming(simhash(&original), simhash(&modified));
        assert!(distance <= MAX_HAMMING, "distance {} too large", distance);
    }

    #[test]
    fn test_small_edit_stays_close() {
        // ~1% of tokens changed moves only a handful of bits
        let original = sample_text(1_000);
        let mut tokens: Vec<String> = original.split_whitespace().map(String::from).collect();
        for slot in tokens.iter_mut().skip(500).take(10) {
            *slot = "edited".to_string();
        }
        let modified = tokens.join(" ");

        let distance = hamming(simhash(&original), simhash(&modified));
        assert!(distance < 16, "distance {} too large for a 1% edit", distance);
    }

    #[test]
    fn test_different_texts_are_far() {
        let a = sample_text(200);
        let b: String = (0..200).map(|i| format!("other{}", i)).collect::<Vec<_>>().join(" ");
        assert!(hamming(simhash(&a), simhash(&b)) > MAX_HAMMING);
    }

    #[test]
    fn test_index_finds_all_within_threshold() {
        let index = SimHashIndex::new();
        let base = 0xDEAD_BEEF_CAFE_F00Du64;

        index.insert(base, "exact");
        index.insert(base ^ 0b101, "two-bits");
        index.insert(base ^ 0b111, "three-bits");
        index.insert(base ^ 0xFFFF_0000_0000_00FF, "far");

        let hits = index.candidates(base, MAX_HAMMING);
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert!(ids.contains(&"exact"));
        assert!(ids.contains(&"two-bits"));
        assert!(ids.contains(&"three-bits"));
        assert!(!ids.contains(&"far"));
    }

    #[test]
    fn test_find_near_prefers_closest() {
        let index = SimHashIndex::new();
        let base = 0x1234_5678_9ABC_DEF0u64;
        index.insert(base ^ 0b11, "two");
        index.insert(base, "zero");

        let (id, distance) = index.find_near(base).unwrap();
        assert_eq!(id, "zero");
        assert_eq!(distance, 0);
    }

    #[test]
    fn test_short_documents_hash_without_shingles() {
        let short = "one two three";
        assert_eq!(simhash(short), simhash(short));
        assert_ne!(simhash(short), simhash("four five six"));
    }
}
