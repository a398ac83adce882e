pub mod minhash;
pub mod shingle;
pub mod simhash;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::debug;

use deepharvest_core::Fingerprint;

use crate::minhash::{MinHashLsh, MinHasher};
use crate::shingle::{shingle_hashes, SHINGLE_WIDTH};
use crate::simhash::{simhash64, SimHashIndex};

/// Hamming radius for the near-duplicate tier.
pub const NEAR_DUP_DISTANCE: u32 = 3;

const STRIPES: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum DedupVerdict {
    Unique,
    ExactDuplicate { of: String },
    NearDuplicate { of: String, distance: u32 },
}

impl DedupVerdict {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, DedupVerdict::Unique)
    }
}

/// Two-tier content deduper plus a bulk-similarity LSH index.
///
/// Tier 1 is exact SHA-256 over the normalized body (decoded text, collapsed
/// whitespace); tier 2 is SimHash within Hamming distance 3. All indexes are
/// append-only. Writes are single-flight per fingerprint via striped locks.
pub struct ContentDeduper {
    hasher: MinHasher,
    exact: DashMap<[u8; 32], String>,
    aliases: DashMap<String, String>,
    simhash_index: SimHashIndex,
    lsh: MinHashLsh,
    doc_urls: DashMap<u64, String>,
    next_doc: AtomicU64,
    stripes: Vec<Mutex<()>>,
}

impl ContentDeduper {
    pub fn new() -> Self {
        Self {
            hasher: MinHasher::new(),
            exact: DashMap::new(),
            aliases: DashMap::new(),
            simhash_index: SimHashIndex::new(),
            lsh: MinHashLsh::new(),
            doc_urls: DashMap::new(),
            next_doc: AtomicU64::new(1),
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Compute the full fingerprint for one document. Pure function of its
    /// inputs: recomputation yields bit-identical values.
    pub fn fingerprint(&self, normalized_body: &[u8], tokens: &[String]) -> Fingerprint {
        let mut sha = Sha256::new();
        sha.update(normalized_body);
        let shingles = shingle_hashes(tokens, SHINGLE_WIDTH);
        Fingerprint {
            sha256: sha.finalize().into(),
            simhash: simhash64(&shingles),
            minhash: self.hasher.signature(&shingles),
        }
    }

    /// Classify a document and record it in the indexes. The first document
    /// with a given fingerprint wins; later arrivals are reported as
    /// duplicates of it with an alias entry.
    pub fn classify(&self, url: &str, fingerprint: &Fingerprint) -> DedupVerdict {
        let stripe = fingerprint.sha256[0] as usize % STRIPES;
        let _guard = match self.stripes[stripe].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(original) = self.exact.get(&fingerprint.sha256) {
            if original.as_str() != url {
                self.aliases.insert(url.to_string(), original.clone());
                debug!(url, original = %*original, "exact duplicate");
                return DedupVerdict::ExactDuplicate {
                    of: original.clone(),
                };
            }
            return DedupVerdict::Unique;
        }
        self.exact.insert(fingerprint.sha256, url.to_string());

        let near = self
            .simhash_index
            .find_near(fingerprint.simhash, NEAR_DUP_DISTANCE)
            .and_then(|(doc, distance)| {
                let original = self.doc_urls.get(&doc)?;
                Some((original.clone(), distance))
            });

        let doc = self.next_doc.fetch_add(1, Ordering::Relaxed);
        self.doc_urls.insert(doc, url.to_string());
        self.simhash_index.insert(fingerprint.simhash, doc);
        self.lsh.insert(doc, &fingerprint.minhash);

        match near {
            Some((original, distance)) if original != url => {
                self.aliases.insert(url.to_string(), original.clone());
                debug!(url, original = %original, distance, "near duplicate");
                DedupVerdict::NearDuplicate {
                    of: original,
                    distance,
                }
            }
            _ => DedupVerdict::Unique,
        }
    }

    /// Bulk similarity query: URLs with estimated Jaccard >= `min_jaccard`.
    pub fn similar(&self, fingerprint: &Fingerprint, min_jaccard: f64) -> Vec<(String, f64)> {
        self.lsh
            .query(&fingerprint.minhash, min_jaccard)
            .into_iter()
            .filter_map(|(doc, score)| {
                let url = self.doc_urls.get(&doc)?;
                Some((url.clone(), score))
            })
            .collect()
    }

    pub fn alias_of(&self, url: &str) -> Option<String> {
        self.aliases.get(url).map(|a| a.clone())
    }

    pub fn documents(&self) -> usize {
        self.doc_urls.len()
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

    fn toks(n: usize, prefix: &str) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    #[test]
    fn test_fingerprint_is_bit_identical_on_recompute() {
        let deduper = ContentDeduper::new();
        let tokens = toks(100, "w");
        let a = deduper.fingerprint(b"body", &tokens);
        let b = deduper.fingerprint(b"body", &tokens);
        assert_eq!(a, b);
    }

    #[test]
    fn test_exact_duplicate_records_alias() {
        let deduper = ContentDeduper::new();
        let tokens = toks(50, "w");
        let fp = deduper.fingerprint(b"same body", &tokens);

        assert_eq!(deduper.classify("http://h/a", &fp), DedupVerdict::Unique);
        let verdict = deduper.classify("http://h/b", &fp);
        assert_eq!(
            verdict,
            DedupVerdict::ExactDuplicate {
                of: "http://h/a".into()
            }
        );
        assert_eq!(deduper.alias_of("http://h/b").as_deref(), Some("http://h/a"));
    }

    #[test]
    fn test_one_percent_token_change_is_near_duplicate() {
        let deduper = ContentDeduper::new();
        let base = toks(500, "w");
        let mut edited = base.clone();
        for i in 250..255 {
            edited[i] = format!("x{i}");
        }

        let first = deduper.fingerprint(b"body-a", &base);
        let second = deduper.fingerprint(b"body-b", &edited);
        assert_eq!(deduper.classify("http://h/a", &first), DedupVerdict::Unique);

        match deduper.classify("http://h/b", &second) {
            DedupVerdict::NearDuplicate { of, distance } => {
                assert_eq!(of, "http://h/a");
                assert!(distance <= NEAR_DUP_DISTANCE);
            }
            other => panic!("expected near duplicate, got {other:?}"),
        }
    }

    #[test]
    fn test_constructed_fingerprints_within_radius_match() {
        let deduper = ContentDeduper::new();
        let first = Fingerprint {
            sha256: [1; 32],
            simhash: 0xDEAD_BEEF_CAFE_F00D,
            minhash: vec![0; minhash::NUM_PERMS],
        };
        let second = Fingerprint {
            sha256: [2; 32],
            simhash: first.simhash ^ 0b101,
            minhash: vec![1; minhash::NUM_PERMS],
        };
        assert_eq!(deduper.classify("http://h/a", &first), DedupVerdict::Unique);
        assert_eq!(
            deduper.classify("http://h/b", &second),
            DedupVerdict::NearDuplicate {
                of: "http://h/a".into(),
                distance: 2
            }
        );
    }

    #[test]
    fn test_unrelated_documents_stay_unique() {
        let deduper = ContentDeduper::new();
        let a = deduper.fingerprint(b"a", &toks(100, "alpha"));
        let b = deduper.fingerprint(b"b", &toks(100, "omega"));
        assert_eq!(deduper.classify("http://h/a", &a), DedupVerdict::Unique);
        assert_eq!(deduper.classify("http://h/b", &b), DedupVerdict::Unique);
    }

    #[test]
    fn test_bulk_similarity_query() {
        let deduper = ContentDeduper::new();
        let base = toks(300, "w");
        let mut near = base.clone();
        near[0] = "edited".into();

        let fp_near = deduper.fingerprint(b"n", &near);
        let fp_far = deduper.fingerprint(b"f", &toks(300, "z"));
        deduper.classify("http://h/near", &fp_near);
        deduper.classify("http://h/far", &fp_far);

        let fp_query = deduper.fingerprint(b"q", &base);
        let hits = deduper.similar(&fp_query, 0.85);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "http://h/near");
    }
}
