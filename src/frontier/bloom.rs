//! Counting Bloom filter fronting the visited set.
//!
//! Distributed workers keep one of these as a local negative cache: a miss
//! proves a URL was never admitted (no store round-trip); a hit falls
//! through to the exact set to rule out false positives. 4-bit saturating
//! counters let a snapshot restore rebuild the filter from the exact set.

use xxhash_rust::xxh3::xxh3_64_with_seed;

#[derive(Debug, Clone)]
pub struct CountingBloomFilter {
    /// 4-bit counters packed two per byte.
    counters: Vec<u8>,
    num_counters: usize,
    num_hashes: usize,
}

impl CountingBloomFilter {
    /// Size the filter for `num_items` at the given false-positive rate.
    pub fn new(num_items: usize, false_positive_rate: f64) -> Self {
        // m = -n ln(p) / ln(2)^2
        let m = (-(num_items.max(1) as f64) * false_positive_rate.ln()
            / (2.0_f64.ln().powi(2)))
        .ceil() as usize;
        let num_counters = m.max(8);

        // k = m/n ln(2)
        let k = ((num_counters as f64 / num_items.max(1) as f64) * 2.0_f64.ln()).round() as usize;
        let num_hashes = k.clamp(1, 16);

        Self {
            counters: vec![0u8; (num_counters + 1) / 2],
            num_counters,
            num_hashes,
        }
    }

    pub fn insert(&mut self, item: &[u8]) {
        for i in 0..self.num_hashes {
            let idx = self.probe(item, i);
            self.increment(idx);
        }
    }

    pub fn remove(&mut self, item: &[u8]) {
        for i in 0..self.num_hashes {
            let idx = self.probe(item, i);
            self.decrement(idx);
        }
    }

    /// False negatives are impossible; false positives are bounded by the
    /// configured rate.
    pub fn contains(&self, item: &[u8]) -> bool {
        (0..self.num_hashes).all(|i| self.counter(self.probe(item, i)) > 0)
    }

    pub fn clear(&mut self) {
        self.counters.fill(0);
    }

    fn probe(&self, item: &[u8], seed: usize) -> usize {
        xxh3_64_with_seed(item, seed as u64) as usize % self.num_counters
    }

    fn counter(&self, idx: usize) -> u8 {
        let byte = self.counters[idx / 2];
        if idx % 2 == 0 {
            byte & 0x0F
        } else {
            (byte >> 4) & 0x0F
        }
    }

    fn increment(&mut self, idx: usize) {
        let current = self.counter(idx);
        // Saturate rather than overflow into the neighbor
        if current < 15 {
            let byte = &mut self.counters[idx / 2];
            if idx % 2 == 0 {
                *byte = (*byte & 0xF0) | (current + 1);
            } else {
                *byte = (*byte & 0x0F) | ((current + 1) << 4);
            }
        }
    }

    fn decrement(&mut self, idx: usize) {
        let current = self.counter(idx);
        if current > 0 && current < 15 {
            let byte = &mut self.counters[idx / 2];
            if idx % 2 == 0 {
                *byte = (*byte & 0xF0) | (current - 1);
            } else {
                *byte = (*byte & 0x0F) | ((current - 1) << 4);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_contains() {
        let mut filter = CountingBloomFilter::new(1_000, 0.01);
        filter.insert(b"https://example.com/a");
        filter.insert(b"https://example.com/b");

        assert!(filter.contains(b"https://example.com/a"));
        assert!(filter.contains(b"https://example.com/b"));
        assert!(!filter.contains(b"https://example.com/never-seen"));
    }

    #[test]
    fn test_remove() {
        let mut filter = CountingBloomFilter::new(1_000, 0.01);
        filter.insert(b"url");
        assert!(filter.contains(b"url"));
        filter.remove(b"url");
        assert!(!filter.contains(b"url"));
    }

    #[test]
    fn test_no_false_negatives() {
        let mut filter = CountingBloomFilter::new(10_000, 0.01);
        let items: Vec<String> = (0..5_000).map(|i| format!("https://h/p/{}", i)).collect();
        for item in &items {
            filter.insert(item.as_bytes());
        }
        for item in &items {
            assert!(filter.contains(item.as_bytes()), "false negative for {}", item);
        }
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let mut filter = CountingBloomFilter::new(10_000, 0.01);
        for i in 0..10_000 {
            filter.insert(format!("in-{}", i).as_bytes());
        }
        let false_positives = (0..10_000)
            .filter(|i| filter.contains(format!("out-{}", i).as_bytes()))
            .count();
        // Generous bound: 5x the configured 1% rate
        assert!(false_positives < 500, "{} false positives", false_positives);
    }
}
