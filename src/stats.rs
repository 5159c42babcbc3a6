//! Cache statistics.
//!
//! Counters live in process as atomics and are mirrored to the `metrics`
//! facade. [`CacheStats::flush`] folds the unflushed part into
//! `stats/stats.json` under the cache root, serialized by a lock of its own
//! so flushing never contends with cache validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use objcache_store::{CacheLock, LockMode};
use serde::{Deserialize, Serialize};

use crate::error::CacheResult;

pub const CACHE_HITS_TOTAL: &str = "objcache_cache_hits_total";
pub const CACHE_MISSES_TOTAL: &str = "objcache_cache_misses_total";
pub const CACHE_OBJECTS_TOTAL: &str = "objcache_cache_objects_total";
pub const CACHE_BYTES_TOTAL: &str = "objcache_cache_bytes_total";

const STATS_DIR: &str = "stats";
const STATS_FILE: &str = "stats.json";

/// Persisted counter totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_objects: u64,
    pub cache_size: u64,
}

impl StatsSnapshot {
    fn path(cache_root: &Path) -> PathBuf {
        cache_root.join(STATS_DIR).join(STATS_FILE)
    }

    /// Read persisted totals; missing or unreadable files count as zero.
    pub fn load(cache_root: &Path) -> Self {
        fs::read_to_string(Self::path(cache_root))
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    fn add(&mut self, other: &StatsSnapshot) {
        self.cache_hits += other.cache_hits;
        self.cache_misses += other.cache_misses;
        self.cache_objects += other.cache_objects;
        self.cache_size += other.cache_size;
    }

    pub fn hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    objects: AtomicU64,
    size: AtomicU64,
}

impl Counters {
    fn add(&self, delta: &StatsSnapshot) {
        self.hits.fetch_add(delta.cache_hits, Ordering::Relaxed);
        self.misses.fetch_add(delta.cache_misses, Ordering::Relaxed);
        self.objects.fetch_add(delta.cache_objects, Ordering::Relaxed);
        self.size.fetch_add(delta.cache_size, Ordering::Relaxed);
    }

    fn load(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            cache_objects: self.objects.load(Ordering::Relaxed),
            cache_size: self.size.load(Ordering::Relaxed),
        }
    }

    fn take(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.hits.swap(0, Ordering::Relaxed),
            cache_misses: self.misses.swap(0, Ordering::Relaxed),
            cache_objects: self.objects.swap(0, Ordering::Relaxed),
            cache_size: self.size.swap(0, Ordering::Relaxed),
        }
    }
}

/// Thread-safe cache counters.
///
/// `recorded` only grows; `pending` holds what has not been flushed yet.
#[derive(Debug, Default)]
pub struct CacheStats {
    recorded: Counters,
    pending: Counters,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, delta: StatsSnapshot) {
        self.recorded.add(&delta);
        self.pending.add(&delta);
    }

    pub fn record_hit(&self) {
        self.record(StatsSnapshot {
            cache_hits: 1,
            ..StatsSnapshot::default()
        });
        metrics::counter!(CACHE_HITS_TOTAL).increment(1);
    }

    pub fn record_miss(&self) {
        self.record(StatsSnapshot {
            cache_misses: 1,
            ..StatsSnapshot::default()
        });
        metrics::counter!(CACHE_MISSES_TOTAL).increment(1);
    }

    /// A new object entered the cache, adding `bytes` to its size.
    pub fn record_object(&self, bytes: u64) {
        self.record(StatsSnapshot {
            cache_objects: 1,
            cache_size: bytes,
            ..StatsSnapshot::default()
        });
        metrics::counter!(CACHE_OBJECTS_TOTAL).increment(1);
        metrics::counter!(CACHE_BYTES_TOTAL).increment(bytes);
    }

    /// Bytes added without a new object (debug-info files).
    pub fn record_bytes(&self, bytes: u64) {
        self.record(StatsSnapshot {
            cache_size: bytes,
            ..StatsSnapshot::default()
        });
        metrics::counter!(CACHE_BYTES_TOTAL).increment(bytes);
    }

    /// Everything recorded by this instance, flushed or not.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.recorded.load()
    }

    /// Counters not yet folded into the persisted totals.
    pub fn pending(&self) -> StatsSnapshot {
        self.pending.load()
    }

    /// Fold pending counters into the persisted totals and return them.
    ///
    /// On failure the pending counters are kept for the next flush.
    pub fn flush(&self, cache_root: &Path, timeout: Duration) -> CacheResult<StatsSnapshot> {
        let delta = self.pending.take();
        match Self::merge(cache_root, timeout, &delta) {
            Ok(total) => Ok(total),
            Err(e) => {
                self.pending.add(&delta);
                Err(e)
            }
        }
    }

    fn merge(cache_root: &Path, timeout: Duration, delta: &StatsSnapshot) -> CacheResult<StatsSnapshot> {
        let _lock = CacheLock::acquire(&cache_root.join(STATS_DIR), LockMode::ReadWrite, timeout)?;

        let mut total = StatsSnapshot::load(cache_root);
        total.add(delta);

        let path = StatsSnapshot::path(cache_root);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&total)?)?;
        fs::rename(&tmp, &path)?;

        Ok(total)
    }
}
