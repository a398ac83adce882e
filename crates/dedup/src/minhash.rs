use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::shingle::fnv1a64;

pub const NUM_PERMS: usize = 128;
pub const LSH_BANDS: usize = 16;
pub const LSH_ROWS: usize = 8;

/// Mersenne prime 2^61 - 1; permutations are (a*x + b) mod P.
const MERSENNE_P: u64 = (1 << 61) - 1;

/// Fixed seed: signatures must be bit-identical across runs and workers.
const PERM_SEED: u64 = 0x6d69_6e68_6173_6831;

/// MinHash signature generator with K=128 fixed random permutations.
#[derive(Debug, Clone)]
pub struct MinHasher {
    coeff_a: Vec<u64>,
    coeff_b: Vec<u64>,
}

impl MinHasher {
    pub fn new() -> Self {
        let mut rng = StdRng::seed_from_u64(PERM_SEED);
        let coeff_a = (0..NUM_PERMS)
            .map(|_| rng.gen_range(1..MERSENNE_P))
            .collect();
        let coeff_b = (0..NUM_PERMS)
            .map(|_| rng.gen_range(0..MERSENNE_P))
            .collect();
        Self { coeff_a, coeff_b }
    }

    pub fn signature(&self, shingles: &[u64]) -> Vec<u32> {
        if shingles.is_empty() {
            return vec![u32::MAX; NUM_PERMS];
        }
        let mut signature = vec![u32::MAX; NUM_PERMS];
        for &shingle in shingles {
            let x = (shingle % MERSENNE_P) as u128;
            for i in 0..NUM_PERMS {
                let value =
                    ((self.coeff_a[i] as u128 * x + self.coeff_b[i] as u128) % MERSENNE_P as u128)
                        as u64;
                let folded = (value >> 29) as u32 ^ value as u32;
                if folded < signature[i] {
                    signature[i] = folded;
                }
            }
        }
        signature
    }
}

impl Default for MinHasher {
    fn default() -> Self {
        Self::new()
    }
}

pub fn jaccard_estimate(a: &[u32], b: &[u32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    if a.is_empty() {
        return 0.0;
    }
    let matches = a.iter().zip(b).filter(|(x, y)| x == y).count();
    matches as f64 / a.len() as f64
}

fn band_key(band: usize, rows: &[u32]) -> u64 {
    let mut bytes = Vec::with_capacity(rows.len() * 4 + 1);
    bytes.push(band as u8);
    for row in rows {
        bytes.extend_from_slice(&row.to_le_bytes());
    }
    fnv1a64(&bytes)
}

/// LSH over MinHash signatures: 16 bands x 8 rows, tuned for Jaccard ~0.8.
/// Append-only; documents are never removed.
#[derive(Debug, Default)]
pub struct MinHashLsh {
    buckets: DashMap<u64, Vec<u64>>,
    signatures: DashMap<u64, Vec<u32>>,
}

impl MinHashLsh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, doc: u64, signature: &[u32]) {
        self.signatures.insert(doc, signature.to_vec());
        for band in 0..LSH_BANDS {
            let rows = &signature[band * LSH_ROWS..(band + 1) * LSH_ROWS];
            self.buckets
                .entry(band_key(band, rows))
                .or_default()
                .push(doc);
        }
    }

    /// Documents whose estimated Jaccard similarity with `signature` is at
    /// least `min_jaccard`, sorted most similar first.
    pub fn query(&self, signature: &[u32], min_jaccard: f64) -> Vec<(u64, f64)> {
        let mut candidates = Vec::new();
        for band in 0..LSH_BANDS {
            let rows = &signature[band * LSH_ROWS..(band + 1) * LSH_ROWS];
            if let Some(bucket) = self.buckets.get(&band_key(band, rows)) {
                candidates.extend(bucket.iter().copied());
            }
        }
        candidates.sort_unstable();
        candidates.dedup();

        let mut results: Vec<(u64, f64)> = candidates
            .into_iter()
            .filter_map(|doc| {
                let sig = self.signatures.get(&doc)?;
                let score = jaccard_estimate(signature, &sig);
                (score >= min_jaccard).then_some((doc, score))
            })
            .collect();
        results.sort_by(|a, b| b.1.total_cmp(&a.1));
        results
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
