//! # Result Cache
//!
//! Bounded map from normalized translation requests to prior results, so
//! signage held in frame for several seconds is translated once.
//!
//! ## Cache Key Normalization:
//! Both `lookup` and `insert` derive the key through [`CacheKey::for_request`]:
//! trim, collapse internal whitespace, lowercase. Display text inside the
//! stored result keeps its original casing.
//!
//! ## Concurrency:
//! A `parking_lot::RwLock` guards the entry map. Lookups take the read lock
//! and run concurrently; recency is an atomic tick per entry so a hit does
//! not need the write lock. Inserts, pins and eviction take the write lock.
//!
//! ## Eviction:
//! Least-recently-used among unpinned entries. Pinned entries are never
//! evicted; an insert into a cache full of pinned entries is rejected.

pub mod store;

pub use store::{CacheStoreError, JsonFileStore, SnapshotStore};

use crate::language::{LanguageTag, SourceLanguage};
use crate::stages::translation::{TranslationRequest, TranslationResult};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Normalized identity of a translation request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    pub text: String,
    pub source: SourceLanguage,
    pub target: LanguageTag,
}

impl CacheKey {
    pub fn new(text: &str, source: &SourceLanguage, target: &LanguageTag) -> Self {
        Self {
            text: normalize_text(text),
            source: source.clone(),
            target: target.clone(),
        }
    }

    pub fn for_request(request: &TranslationRequest) -> Self {
        Self::new(
            &request.source_text,
            &request.source_language,
            &request.target_language,
        )
    }
}

/// Trim, collapse whitespace runs to one space, lowercase.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

struct CacheEntry {
    result: TranslationResult,
    last_access: AtomicU64,
    pins: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Existing entry overwritten and made most recent
    Replaced,
    /// Cache is full of pinned entries
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub pinned: usize,
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

pub struct ResultCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    capacity: usize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
}

impl ResultCache {
    /// A cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn lookup(&self, request: &TranslationRequest) -> Option<TranslationResult> {
        let key = CacheKey::for_request(request);
        let entries = self.entries.read();

        match entries.get(&key) {
            Some(entry) => {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.result.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, request: &TranslationRequest, result: TranslationResult) -> InsertOutcome {
        let key = CacheKey::for_request(request);
        let mut entries = self.entries.write();

        if let Some(entry) = entries.get_mut(&key) {
            entry.result = result;
            entry.last_access.store(self.tick(), Ordering::Relaxed);
            return InsertOutcome::Replaced;
        }

        if entries.len() >= self.capacity && !self.evict_one(&mut entries) {
            tracing::warn!(
                capacity = self.capacity,
                "Result cache full of pinned entries, not caching"
            );
            return InsertOutcome::Rejected;
        }

        entries.insert(
            key,
            CacheEntry {
                result,
                last_access: AtomicU64::new(self.tick()),
                pins: 0,
            },
        );
        self.insertions.fetch_add(1, Ordering::Relaxed);
        InsertOutcome::Inserted
    }

    /// Drop the least recently used unpinned entry. False if all are pinned.
    fn evict_one(&self, entries: &mut HashMap<CacheKey, CacheEntry>) -> bool {
        let victim = entries
            .iter()
            .filter(|(_, entry)| entry.pins == 0)
            .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
            .map(|(key, _)| key.clone());

        match victim {
            Some(key) => {
                entries.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(text = %key.text, target = %key.target, "Evicted cache entry");
                true
            }
            None => false,
        }
    }

    /// Protect an entry from eviction. Pins nest. False if absent.
    pub fn pin(&self, request: &TranslationRequest) -> bool {
        let key = CacheKey::for_request(request);
        match self.entries.write().get_mut(&key) {
            Some(entry) => {
                entry.pins += 1;
                true
            }
            None => false,
        }
    }

    pub fn unpin(&self, request: &TranslationRequest) -> bool {
        let key = CacheKey::for_request(request);
        match self.entries.write().get_mut(&key) {
            Some(entry) if entry.pins > 0 => {
                entry.pins -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn is_pinned(&self, request: &TranslationRequest) -> bool {
        let key = CacheKey::for_request(request);
        self.entries
            .read()
            .get(&key)
            .is_some_and(|entry| entry.pins > 0)
    }

    /// Cached results ordered from least to most recently used.
    pub fn snapshot(&self) -> Vec<TranslationResult> {
        let entries = self.entries.read();
        let mut ordered: Vec<(u64, &TranslationResult)> = entries
            .values()
            .map(|entry| (entry.last_access.load(Ordering::Relaxed), &entry.result))
            .collect();
        ordered.sort_by_key(|(tick, _)| *tick);
        ordered.into_iter().map(|(_, result)| result.clone()).collect()
    }

    /// Insert snapshot results in order, so the last one ends up most recent.
    pub fn restore(&self, results: Vec<TranslationResult>) -> usize {
        let mut restored = 0;
        for result in results {
            let request = result.request.clone();
            if self.insert(&request, result) != InsertOutcome::Rejected {
                restored += 1;
            }
        }
        restored
    }

    pub async fn load_from(&self, store: &dyn SnapshotStore) -> Result<usize, CacheStoreError> {
        let results = store.load_snapshot().await?;
        let restored = self.restore(results);
        tracing::info!(restored, capacity = self.capacity, "Result cache warmed from snapshot");
        Ok(restored)
    }

    pub async fn persist_to(&self, store: &dyn SnapshotStore) -> Result<usize, CacheStoreError> {
        let results = self.snapshot();
        let count = results.len();
        store.persist_snapshot(&results).await?;
        tracing::info!(entries = count, "Result cache snapshot persisted");
        Ok(count)
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            entries: entries.len(),
            capacity: self.capacity,
            pinned: entries.values().filter(|entry| entry.pins > 0).count(),
            hits,
            misses,
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn tag(code: &str) -> LanguageTag {
        LanguageTag::parse(code).unwrap()
    }

    fn request(text: &str) -> TranslationRequest {
        TranslationRequest::new(text, SourceLanguage::Tag(tag("en")), tag("fr"))
    }

    fn result(text: &str, translated: &str) -> TranslationResult {
        TranslationResult {
            request: request(text),
            translated_text: translated.to_string(),
            source_language_resolved: tag("en"),
            produced_at: Utc::now(),
            model_version: Some("t1".into()),
        }
    }

    #[test]
    fn test_normalization_equivalent_requests_share_entry() {
        let cache = ResultCache::new(8);
        cache.insert(&request("  Emergency   EXIT "), result("Emergency EXIT", "SORTIE DE SECOURS"));

        let hit = cache.lookup(&request("emergency exit")).unwrap();
        assert_eq!(hit.translated_text, "SORTIE DE SECOURS");
        assert_eq!(hit.request.source_text, "Emergency EXIT");
        assert!(cache.lookup(&request("emergency exit")).is_some());

        let other_target = TranslationRequest::new("emergency exit", SourceLanguage::Tag(tag("en")), tag("de"));
        assert!(cache.lookup(&other_target).is_none());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (2, 1));
    }

    #[test]
    fn test_insert_overwrites_and_refreshes_recency() {
        let cache = ResultCache::new(2);
        assert_eq!(cache.insert(&request("a"), result("a", "1")), InsertOutcome::Inserted);
        cache.insert(&request("b"), result("b", "2"));
        assert_eq!(cache.insert(&request("A"), result("a", "1b")), InsertOutcome::Replaced);

        cache.insert(&request("c"), result("c", "3"));
        assert!(cache.lookup(&request("b")).is_none());
        assert_eq!(cache.lookup(&request("a")).unwrap().translated_text, "1b");
    }

    #[test]
    fn test_bound_holds_and_pinned_entries_survive() {
        let cache = ResultCache::new(3);
        cache.insert(&request("keep"), result("keep", "garder"));
        assert!(cache.pin(&request("KEEP")));

        for i in 0..50 {
            let text = format!("sign {}", i);
            cache.insert(&request(&text), result(&text, "panneau"));
            assert!(cache.len() <= 3);
            assert!(cache.is_pinned(&request("keep")));
        }
        assert_eq!(cache.stats().evictions, 48);

        cache.pin(&request("sign 49"));
        cache.pin(&request("sign 48"));
        assert_eq!(cache.insert(&request("late"), result("late", "tard")), InsertOutcome::Rejected);

        assert!(cache.unpin(&request("sign 48")));
        assert_eq!(cache.insert(&request("late"), result("late", "tard")), InsertOutcome::Inserted);
        assert!(cache.lookup(&request("sign 48")).is_none());
    }

    #[test]
    fn test_snapshot_preserves_recency_order() {
        let cache = ResultCache::new(3);
        cache.insert(&request("one"), result("one", "un"));
        cache.insert(&request("two"), result("two", "deux"));
        cache.lookup(&request("one"));

        let snapshot = cache.snapshot();
        let order: Vec<_> = snapshot.iter().map(|r| r.request.source_text.as_str()).collect();
        assert_eq!(order, vec!["two", "one"]);

        let restored = ResultCache::new(3);
        assert_eq!(restored.restore(snapshot), 2);
        restored.insert(&request("three"), result("three", "trois"));
        restored.insert(&request("four"), result("four", "quatre"));
        assert!(restored.lookup(&request("two")).is_none());
        assert!(restored.lookup(&request("one")).is_some());
    }
}
