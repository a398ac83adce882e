use dashmap::DashMap;

/// 64-bit SimHash over shingle hashes. Near-duplicates land within a small
/// Hamming distance; lookup is sharded into 4 x 16-bit bands so that any two
/// hashes within distance 3 share at least one band (pigeonhole over 4 bands).
pub fn simhash64(shingles: &[u64]) -> u64 {
    let mut counts = [0i64; 64];
    for &shingle in shingles {
        for (bit, count) in counts.iter_mut().enumerate() {
            if shingle >> bit & 1 == 1 {
                *count += 1;
            } else {
                *count -= 1;
            }
        }
    }
    let mut hash = 0u64;
    for (bit, count) in counts.iter().enumerate() {
        if *count > 0 {
            hash |= 1 << bit;
        }
    }
    hash
}

pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

fn bands(hash: u64) -> [u16; 4] {
    [
        hash as u16,
        (hash >> 16) as u16,
        (hash >> 32) as u16,
        (hash >> 48) as u16,
    ]
}

/// Append-only banded index from band value to (full hash, doc id) entries.
#[derive(Debug, Default)]
pub struct SimHashIndex {
    tables: [DashMap<u16, Vec<(u64, u64)>>; 4],
}

impl SimHashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, hash: u64, doc: u64) {
        for (table, band) in self.tables.iter().zip(bands(hash)) {
            table.entry(band).or_default().push((hash, doc));
        }
    }

    /// Closest indexed document within `max_distance`, if any.
    pub fn find_near(&self, hash: u64, max_distance: u32) -> Option<(u64, u32)> {
        let mut best: Option<(u64, u32)> = None;
        for (table, band) in self.tables.iter().zip(bands(hash)) {
            let Some(bucket) = table.get(&band) else {
                continue;
            };
            for &(candidate, doc) in bucket.iter() {
                let distance = hamming(hash, candidate);
                if distance <= max_distance && best.map_or(true, |(_, d)| distance < d) {
                    best = Some((doc, distance));
                }
            }
        }
        best
    }

    pub fn len(&self) -> usize {
        // Every entry appears once per band table.
        self.tables[0].iter().map(|b| b.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shingle::{shingle_hashes, SHINGLE_WIDTH};

    fn toks(s: &str) -> Vec<String> {
        s.split_whitespace().map(|t| t.to_string()).collect()
    }

    fn doc_hash(text: &str) -> u64 {
        simhash64(&shingle_hashes(&toks(text), SHINGLE_WIDTH))
    }

    #[test]
    fn test_identical_documents_collide() {
        let text = "rust is a systems programming language focused on safety";
        assert_eq!(doc_hash(text), doc_hash(text));
    }

    #[test]
    fn test_one_percent_edit_stays_within_distance_three() {
        // 500 tokens with a contiguous 1% block rewritten.
        let base: Vec<String> = (0..500).map(|i| format!("w{i}")).collect();
        let mut edited = base.clone();
        for i in 250..255 {
            edited[i] = format!("x{i}");
        }

        let a = simhash64(&shingle_hashes(&base, SHINGLE_WIDTH));
        let b = simhash64(&shingle_hashes(&edited, SHINGLE_WIDTH));
        assert!(hamming(a, b) <= 3, "distance {}", hamming(a, b));
    }

    #[test]
    fn test_single_token_edit_barely_moves_the_hash() {
        let base: Vec<String> = (0..300).map(|i| format!("w{i}")).collect();
        let mut edited = base.clone();
        edited[7] = "swapped".to_string();

        let a = simhash64(&shingle_hashes(&base, SHINGLE_WIDTH));
        let b = simhash64(&shingle_hashes(&edited, SHINGLE_WIDTH));
        assert!(hamming(a, b) <= 3, "distance {}", hamming(a, b));
    }

    #[test]
    fn test_banded_lookup_finds_all_near_pairs() {
        // Any pair within distance 3 differs in at most 3 of 4 bands, so the
        // untouched band always produces the candidate.
        let index = SimHashIndex::new();
        let base = 0xDEAD_BEEF_CAFE_F00Du64;
        index.insert(base, 1);

        for flipped in [base, base ^ 1, base ^ (1 << 20) ^ (1 << 40), base ^ 0b111] {
            let found = index.find_near(flipped, 3);
            assert_eq!(found.map(|(doc, _)| doc), Some(1), "missed {flipped:x}");
        }
    }

    #[test]
    fn test_distant_hash_not_matched() {
        let index = SimHashIndex::new();
        index.insert(0, 1);
        assert!(index.find_near(u64::MAX, 3).is_none());
    }
}
