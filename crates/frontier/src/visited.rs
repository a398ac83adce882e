use std::sync::Mutex;

use dashmap::DashSet;
use growable_bloom_filter::GrowableBloom;

/// URL-dedup membership: a growable bloom filter fronting an exact set.
/// The bloom answers definite negatives cheaply; on a bloom hit the exact
/// set resolves false positives. The exact set is the source of truth and
/// is what snapshots iterate.
pub struct VisitedSet {
    bloom: Mutex<GrowableBloom>,
    exact: DashSet<String>,
}

impl VisitedSet {
    pub fn new() -> Self {
        // target FP rate 0.1% with initial capacity hint of 100k.
        Self {
            bloom: Mutex::new(GrowableBloom::new(0.001, 100_000)),
            exact: DashSet::new(),
        }
    }

    /// Returns true when `url` was not yet a member. Insertion is atomic:
    /// of two racing callers exactly one sees true.
    pub fn insert_if_new(&self, url: &str) -> bool {
        let mut bloom = match self.bloom.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !bloom.contains(url) {
            bloom.insert(url);
            self.exact.insert(url.to_string());
            return true;
        }
        drop(bloom);
        // Possible false positive; the exact set decides.
        self.exact.insert(url.to_string())
    }

    pub fn contains(&self, url: &str) -> bool {
        {
            let bloom = match self.bloom.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !bloom.contains(url) {
                return false;
            }
        }
        self.exact.contains(url)
    }

    pub fn mark_batch<I, S>(&self, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut bloom = match self.bloom.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for url in urls {
            let url = url.as_ref();
            bloom.insert(url);
            self.exact.insert(url.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    pub fn iter_urls(&self) -> Vec<String> {
        self.exact.iter().map(|u| u.clone()).collect()
    }
}

impl Default for VisitedSet {
    fn default() -> Self {
        Self::new()
    }
}
