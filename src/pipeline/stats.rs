use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters for one pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    submitted: AtomicU64,
    admitted: AtomicU64,
    dropped_stale: AtomicU64,
    superseded: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    awaiting_language: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    translation_retries: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub submitted: u64,
    pub admitted: u64,
    pub dropped_stale: u64,
    pub superseded: u64,
    pub published: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub awaiting_language: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub translation_retries: u64,
}

impl PipelineStatsSnapshot {
    /// Fold another pipeline's counters into this one.
    pub fn merge(&mut self, other: &PipelineStatsSnapshot) {
        self.submitted += other.submitted;
        self.admitted += other.admitted;
        self.dropped_stale += other.dropped_stale;
        self.superseded += other.superseded;
        self.published += other.published;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
        self.timed_out += other.timed_out;
        self.awaiting_language += other.awaiting_language;
        self.cache_hits += other.cache_hits;
        self.cache_misses += other.cache_misses;
        self.translation_retries += other.translation_retries;
    }
}

macro_rules! counter {
    ($($method:ident => $field:ident),* $(,)?) => {
        impl PipelineStats {
            $(
                pub(crate) fn $method(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter! {
    record_submitted => submitted,
    record_admitted => admitted,
    record_stale => dropped_stale,
    record_superseded => superseded,
    record_published => published,
    record_failed => failed,
    record_cancelled => cancelled,
    record_timeout => timed_out,
    record_awaiting_language => awaiting_language,
    record_cache_hit => cache_hits,
    record_cache_miss => cache_misses,
    record_translation_retry => translation_retries,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            dropped_stale: self.dropped_stale.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            awaiting_language: self.awaiting_language.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            translation_retries: self.translation_retries.load(Ordering::Relaxed),
        }
    }
}
