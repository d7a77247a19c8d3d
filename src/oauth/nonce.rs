//! Single-use tracking for state nonces.
//!
//! A signed state is valid for its whole TTL, so without this cache a
//! captured callback URL could be replayed. Each nonce is consumed once;
//! entries are dropped after the TTL since expired states are rejected
//! before reaching the cache anyway.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Purge expired entries inline once the map grows past this size
const INLINE_PURGE_THRESHOLD: usize = 10_000;

/// Consumed-nonce cache with automatic expiration
#[derive(Clone)]
pub struct NonceCache {
    seen: Arc<DashMap<String, DateTime<Utc>>>,
    ttl: Duration,
}

impl NonceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Marks `nonce` as used.
    ///
    /// Returns `false` if it had already been consumed.
    pub fn consume(&self, nonce: &str, issued_at: DateTime<Utc>) -> bool {
        if self.seen.len() >= INLINE_PURGE_THRESHOLD {
            self.cleanup_expired();
        }

        match self.seen.entry(nonce.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(issued_at);
                true
            }
        }
    }

    /// Clean up expired nonces (should be called periodically)
    pub fn cleanup_expired(&self) {
        let cutoff = Utc::now() - self.ttl;
        self.seen.retain(|_, issued_at| *issued_at >= cutoff);
    }

    pub fn count(&self) -> usize {
        self.seen.len()
    }
}

/// Background task to periodically purge expired nonces.
///
/// An interval of zero is treated as one second.
pub async fn run_nonce_cleanup(cache: NonceCache, interval_seconds: u64) {
    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds.max(1)));

    loop {
        interval.tick().await;
        cache.cleanup_expired();
        tracing::debug!(remaining = cache.count(), "OAuth nonce cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_is_single_use() {
        let cache = NonceCache::new(Duration::minutes(10));
        let now = Utc::now();

        assert!(cache.consume("abc", now));
        assert!(!cache.consume("abc", now));
        assert!(cache.consume("def", now));
        assert_eq!(cache.count(), 2);
    }

    #[test]
    fn test_cleanup_removes_expired() {
        let cache = NonceCache::new(Duration::minutes(10));

        cache.consume("old", Utc::now() - Duration::minutes(11));
        cache.consume("fresh", Utc::now());

        cache.cleanup_expired();
        assert_eq!(cache.count(), 1);
        assert!(!cache.consume("fresh", Utc::now()));
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = NonceCache::new(Duration::minutes(10));
        let other = cache.clone();

        assert!(cache.consume("shared", Utc::now()));
        assert!(!other.consume("shared", Utc::now()));
    }

    #[tokio::test]
    async fn test_cleanup_task_survives_zero_interval() {
        let cache = NonceCache::new(Duration::minutes(10));
        cache.consume("old", Utc::now() - Duration::minutes(11));

        let task = tokio::spawn(run_nonce_cleanup(cache.clone(), 0));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(!task.is_finished());
        assert_eq!(cache.count(), 0);
        task.abort();
    }
}
