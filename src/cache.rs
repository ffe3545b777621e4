//! Cache capability and integrity-sealed entries.
//!
//! The core never talks to a concrete cache: everything goes through the
//! [`CacheService`] trait (opaque JSON blobs, TTL semantics, pattern
//! invalidation). [`InMemoryCache`] is the bundled implementation, a
//! thread-safe TTL map with hit/miss statistics.
//!
//! Every entry the library stores is wrapped in an integrity envelope
//! `{data, timestamp, checksum}`. A checksum mismatch on read invalidates
//! the entry and reports a miss, so an attacker with write access to the
//! cache cannot poison validation results.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use sha2::{Digest, Sha256};
use telemetry_metrics::counter;
use tracing::warn;

use crate::{Error, Result};

/// Version marker mixed into every envelope checksum.
const INTEGRITY_MARKER: &str = "integrity_check_v1";

/// Cache capability consumed by the core.
///
/// Values are opaque JSON blobs; implementations own expiry. Pattern
/// invalidation accepts a `prefix*` form.
#[async_trait::async_trait]
pub trait CacheService: Send + Sync + 'static {
    /// Fetch a value, or `None` on miss/expiry.
    async fn get(&self, key: &str) -> Option<Value>;

    /// Store a value with a TTL.
    async fn set(&self, key: &str, value: Value, ttl: Duration);

    /// Drop a single key.
    async fn invalidate(&self, key: &str);

    /// Drop every key matching `pattern` (`prefix*`).
    async fn invalidate_pattern(&self, pattern: &str);
}

/// Integrity envelope wrapped around every stored entry.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct CacheEnvelope {
    /// The sealed payload
    pub data: Value,
    /// Seal time (Unix millis)
    pub timestamp: u128,
    /// `SHA256(JSON(data) || timestamp || "integrity_check_v1")`, hex
    pub checksum: String,
}

/// Seal `data` into an integrity envelope.
pub fn seal<T: Serialize>(data: &T) -> Result<Value> {
    let data = serde_json::to_value(data)?;
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let checksum = envelope_checksum(&data, timestamp)?;
    Ok(serde_json::to_value(CacheEnvelope {
        data,
        timestamp,
        checksum,
    })?)
}

/// Open an envelope, verifying its checksum.
///
/// # Errors
///
/// Returns [`Error::Integrity`] on a checksum mismatch or a value that is
/// not an envelope at all. Callers treat either as a cache miss.
pub fn open<T: DeserializeOwned>(value: Value) -> Result<T> {
    let envelope: CacheEnvelope = serde_json::from_value(value)
        .map_err(|e| Error::Integrity(format!("not an envelope: {e}")))?;
    let expected = envelope_checksum(&envelope.data, envelope.timestamp)?;
    if expected != envelope.checksum {
        return Err(Error::Integrity("checksum mismatch".to_string()));
    }
    serde_json::from_value(envelope.data).map_err(Error::from)
}

/// Read a sealed entry through a [`CacheService`].
///
/// Integrity violations invalidate the entry, bump the
/// `cache.integrity_failure` counter, and surface as a miss.
pub async fn get_sealed<T: DeserializeOwned>(cache: &dyn CacheService, key: &str) -> Option<T> {
    let raw = cache.get(key).await?;
    match open(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            counter!("cache.integrity_failure").increment(1);
            warn!(key = %key, error = %e, "cache entry failed integrity check, invalidating");
            cache.invalidate(key).await;
            None
        }
    }
}

/// Write a sealed entry through a [`CacheService`].
pub async fn set_sealed<T: Serialize>(
    cache: &dyn CacheService,
    key: &str,
    value: &T,
    ttl: Duration,
) {
    match seal(value) {
        Ok(envelope) => cache.set(key, envelope, ttl).await,
        Err(e) => warn!(key = %key, error = %e, "failed to seal cache entry, skipping write"),
    }
}

fn envelope_checksum(data: &Value, timestamp: u128) -> Result<String> {
    let json = serde_json::to_string(data)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update(INTEGRITY_MARKER.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Hashed, namespaced cache key: `<namespace>:<sha256(raw)[..16]>`.
#[must_use]
pub fn namespaced_key(namespace: &str, raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{namespace}:{}", &digest[..16])
}

/// A cached value with TTL metadata.
struct CachedEntry {
    value: Value,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedEntry {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// Cache statistics tracked atomically.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time view of cache statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStatsSnapshot {
    /// Entries served from cache
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Expired entries removed
    pub evictions: u64,
    /// Live entry count
    pub size: usize,
    /// hits / (hits + misses), 0.0 when no traffic
    pub hit_rate: f64,
}

/// Thread-safe in-memory TTL cache.
///
/// Bounded by `max_entries`: once the live count crosses
/// `cleanup_threshold × max_entries` a write triggers a sweep of expired
/// entries. TTL expiry is the reclaim mechanism; there is no LRU list.
pub struct InMemoryCache {
    entries: DashMap<String, CachedEntry>,
    stats: CacheStats,
    max_entries: usize,
    cleanup_at: usize,
}

impl InMemoryCache {
    /// Create a cache bounded by `max_entries`.
    #[must_use]
    pub fn new(max_entries: usize, cleanup_threshold: f64) -> Self {
        let cleanup_at = (max_entries as f64 * cleanup_threshold).floor() as usize;
        Self {
            entries: DashMap::new(),
            stats: CacheStats::default(),
            max_entries,
            cleanup_at: cleanup_at.max(1),
        }
    }

    /// Current statistics.
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStatsSnapshot {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 { 0.0 } else { hits as f64 / total as f64 };
        CacheStatsSnapshot {
            hits,
            misses,
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
            hit_rate,
        }
    }

    fn sweep_expired(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(10_000, 0.8)
    }
}

#[async_trait::async_trait]
impl CacheService for InMemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) {
        if self.entries.len() >= self.cleanup_at {
            self.sweep_expired();
        }
        if self.entries.len() >= self.max_entries {
            warn!(max = self.max_entries, "cache full, dropping write");
            return;
        }
        self.entries.insert(
            key.to_string(),
            CachedEntry {
                value,
                cached_at: Instant::now(),
                ttl,
            },
        );
    }

    async fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn invalidate_pattern(&self, pattern: &str) {
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        self.entries.retain(|key, _| !key.starts_with(prefix));
    }
}
