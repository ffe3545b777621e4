//! Replay protection — time-bounded `(jti, iat)` markers.
//!
//! A marker lives for the remaining lifetime of its JWT (at least 60 s).
//! Seeing the same `(jti, iat)` pair again while the marker is alive means
//! the token is being replayed.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use telemetry_metrics::counter;
use tracing::debug;

/// Floor on marker lifetime, regardless of token expiry.
const MIN_TTL_SECS: u64 = 60;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// In-memory `(jti, iat)` replay cache with lazy eviction.
pub struct ReplayCache {
    markers: DashMap<String, u64>,
}

impl ReplayCache {
    /// Create an empty replay cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            markers: DashMap::new(),
        }
    }

    /// Record a `(jti, iat)` sighting.
    ///
    /// Returns `true` if the pair was already seen (replay). Otherwise the
    /// marker is inserted with TTL `max(60, exp - now)` and `false` is
    /// returned.
    pub fn check_and_insert(&self, jti: &str, iat: u64, exp: u64) -> bool {
        let now = now_secs();
        let key = format!("{jti}:{iat}");

        if let Some(expires_at) = self.markers.get(&key) {
            if *expires_at > now {
                counter!("keycloak.token.replay_detected").increment(1);
                debug!(jti = %jti, "token replay detected");
                return true;
            }
            // Marker outlived its token; fall through and refresh it.
            drop(expires_at);
            self.markers.remove(&key);
        }

        let ttl = exp.saturating_sub(now).max(MIN_TTL_SECS);
        self.markers.insert(key, now + ttl);
        false
    }

    /// Remove expired markers. Returns how many were dropped.
    pub fn reap_expired(&self) -> usize {
        let now = now_secs();
        let before = self.markers.len();
        self.markers.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.markers.len())
    }

    /// Live marker count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    /// Whether the cache holds no markers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Drop every marker.
    pub fn clear(&self) {
        self.markers.clear();
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_is_not_replay() {
        let cache = ReplayCache::new();
        assert!(!cache.check_and_insert("j1", 100, now_secs() + 600));
    }

    #[test]
    fn second_sighting_is_replay() {
        let cache = ReplayCache::new();
        let exp = now_secs() + 600;
        assert!(!cache.check_and_insert("j1", 100, exp));
        assert!(cache.check_and_insert("j1", 100, exp));
    }

    #[test]
    fn different_iat_is_a_different_marker() {
        let cache = ReplayCache::new();
        let exp = now_secs() + 600;
        assert!(!cache.check_and_insert("j1", 100, exp));
        assert!(!cache.check_and_insert("j1", 101, exp));
    }

    #[test]
    fn marker_ttl_has_a_floor() {
        let cache = ReplayCache::new();
        // token already expired: marker still lives MIN_TTL_SECS
        assert!(!cache.check_and_insert("j1", 100, 0));
        assert!(cache.check_and_insert("j1", 100, 0));
    }

    #[test]
    fn reap_drops_only_expired_markers() {
        let cache = ReplayCache::new();
        cache.check_and_insert("live", 1, now_secs() + 600);
        cache.markers.insert("dead:1".to_string(), now_secs() - 1);
        assert_eq!(cache.reap_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = ReplayCache::new();
        cache.check_and_insert("j1", 1, now_secs() + 60);
        cache.clear();
        assert!(cache.is_empty());
    }
}
