//! Response cache for default-parameter buffered generations
//!
//! Keyed by model id and a hash of the formatted prompt. Eviction is FIFO by
//! insertion order in batches. Entries belong to one session epoch: the
//! first access under a newer epoch drops everything.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

pub const CACHE_CAPACITY: usize = 100;
pub const EVICTION_BATCH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    model_id: String,
    prompt_hash: u64,
}

impl CacheKey {
    pub fn new(model_id: &str, formatted_prompt: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        formatted_prompt.hash(&mut hasher);
        Self {
            model_id: model_id.to_string(),
            prompt_hash: hasher.finish(),
        }
    }
}

struct CacheEntry {
    text: String,
    seq: u64,
}

pub struct ResponseCache {
    entries: DashMap<CacheKey, CacheEntry>,
    next_seq: AtomicU64,
    epoch: AtomicU64,
    capacity: usize,
    eviction_batch: usize,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::with_capacity(CACHE_CAPACITY, EVICTION_BATCH)
    }

    pub fn with_capacity(capacity: usize, eviction_batch: usize) -> Self {
        Self {
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            capacity: capacity.max(1),
            eviction_batch: eviction_batch.max(1),
        }
    }

    pub fn get(&self, key: &CacheKey, epoch: u64) -> Option<String> {
        self.sync_epoch(epoch);
        self.entries.get(key).map(|entry| entry.text.clone())
    }

    pub fn insert(&self, key: CacheKey, text: String, epoch: u64) {
        self.sync_epoch(epoch);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(key, CacheEntry { text, seq });

        if self.entries.len() > self.capacity {
            self.evict_oldest();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sync_epoch(&self, epoch: u64) {
        let previous = self.epoch.swap(epoch, Ordering::AcqRel);
        if previous != epoch && !self.entries.is_empty() {
            tracing::debug!(
                "Active model changed, dropping {} cached responses",
                self.entries.len()
            );
            self.entries.clear();
        }
    }

    fn evict_oldest(&self) {
        let mut by_age: Vec<(u64, CacheKey)> = self
            .entries
            .iter()
            .map(|entry| (entry.seq, entry.key().clone()))
            .collect();
        by_age.sort_unstable_by_key(|(seq, _)| *seq);

        for (_, key) in by_age.into_iter().take(self.eviction_batch) {
            self.entries.remove(&key);
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}
