//! Revocation status cache with TTL and per-key single-flight
//!
//! Entries are keyed by [`RevocationKey`]. A miss goes through
//! [`RevocationCache::get_or_resolve`], which lets exactly one caller per key
//! run the resolver while concurrent callers for the same key wait for it and
//! then share its result, including a failure.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{RevocationKey, RevocationRecord};
use crate::{Error, Result};

/// Thread-safe revocation cache
pub struct RevocationCache {
    entries: DashMap<RevocationKey, CachedRecord>,
    flights: DashMap<RevocationKey, Arc<Mutex<Flight>>>,
    stats: CacheStats,
}

struct CachedRecord {
    record: RevocationRecord,
    cached_at: Instant,
}

impl CachedRecord {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.record.ttl
    }
}

/// Outcome of the last resolution attempt for a key
#[derive(Default)]
struct Flight {
    failure: Option<(Instant, String)>,
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    resolutions: AtomicU64,
    coalesced: AtomicU64,
}

impl CacheStats {
    fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    #[allow(clippy::cast_precision_loss)]
    fn hit_rate(&self) -> f64 {
        let hits = Self::load(&self.hits);
        let total = hits + Self::load(&self.misses);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

impl RevocationCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            flights: DashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Cached record for `key`, if present and not expired.
    ///
    /// Expired entries are evicted on access.
    pub fn get(&self, key: &RevocationKey) -> Option<RevocationRecord> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.record.clone())
            }
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Store a record. A zero TTL is not stored.
    pub fn insert(&self, key: RevocationKey, record: RevocationRecord) {
        if record.ttl.is_zero() {
            return;
        }
        self.entries.insert(
            key,
            CachedRecord {
                record,
                cached_at: Instant::now(),
            },
        );
    }

    /// Serve `key` from cache, or run `resolve` once for all concurrent
    /// callers that missed on it.
    ///
    /// Successful resolutions are cached for their record's TTL. Failures are
    /// never cached; callers already waiting on the failed flight receive the
    /// same failure instead of issuing their own query.
    pub async fn get_or_resolve<F, Fut>(&self, key: &RevocationKey, resolve: F) -> Result<RevocationRecord>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RevocationRecord>>,
    {
        if let Some(record) = self.get(key) {
            return Ok(record);
        }

        let arrived = Instant::now();
        let flight = Arc::clone(
            self.flights
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Flight::default())))
                .value(),
        );

        let result = {
            let mut slot = flight.lock().await;
            self.resolve_locked(key, &mut slot, arrived, resolve).await
        };

        // Drop the slot unless other callers still hold it; they need the
        // failure recorded there.
        self.flights
            .remove_if(key, |_, held| Arc::ptr_eq(held, &flight) && Arc::strong_count(held) <= 2);
        result
    }

    async fn resolve_locked<F, Fut>(
        &self,
        key: &RevocationKey,
        slot: &mut Flight,
        arrived: Instant,
        resolve: F,
    ) -> Result<RevocationRecord>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RevocationRecord>>,
    {
        // Another caller may have resolved the key while we waited.
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.record.clone());
            }
        }
        if let Some((failed_at, message)) = &slot.failure {
            if *failed_at >= arrived {
                self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                return Err(Error::Revocation(message.clone()));
            }
        }

        self.stats.resolutions.fetch_add(1, Ordering::Relaxed);
        match resolve().await {
            Ok(record) => {
                slot.failure = None;
                self.insert(key.clone(), record.clone());
                Ok(record)
            }
            Err(e) => {
                slot.failure = Some((Instant::now(), e.to_string()));
                Err(e)
            }
        }
    }

    /// Remove expired entries and idle flight slots
    pub fn evict_expired(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let evicted = before.saturating_sub(self.entries.len());

        self.flights.retain(|_, flight| Arc::strong_count(flight) > 1);

        if evicted > 0 {
            self.stats
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
    }

    /// Number of keys with a resolution in progress or waiters pending
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of cached records (including not yet evicted expired ones)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no records
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: CacheStats::load(&self.stats.hits),
            misses: CacheStats::load(&self.stats.misses),
            evictions: CacheStats::load(&self.stats.evictions),
            resolutions: CacheStats::load(&self.stats.resolutions),
            coalesced: CacheStats::load(&self.stats.coalesced),
            size: self.entries.len(),
            hit_rate: self.stats.hit_rate(),
        }
    }
}

impl Default for RevocationCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a background task that evicts expired records every `interval`.
///
/// The task holds only a weak reference, so it also ends once the cache is
/// dropped. It stops when `shutdown_rx` fires.
pub fn spawn_cleanup_task(
    cache: &Arc<RevocationCache>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let cache: Weak<RevocationCache> = Arc::downgrade(cache);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(cache) = cache.upgrade() else {
                        break;
                    };
                    cache.evict_expired();
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("Revocation cache cleanup stopped");
    })
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Lookups served from cache
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Expired entries removed
    pub evictions: u64,
    /// Resolver invocations (external queries)
    pub resolutions: u64,
    /// Misses satisfied by another caller's in-flight resolution
    pub coalesced: u64,
    /// Current number of entries
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revocation::RevocationStatus;
    use std::sync::atomic::AtomicUsize;
    use time::OffsetDateTime;

    fn key(serial: u8) -> RevocationKey {
        RevocationKey {
            issuer: b"issuer".to_vec(),
            serial: vec![serial],
        }
    }

    fn record(status: RevocationStatus, ttl: Duration) -> RevocationRecord {
        RevocationRecord {
            issuer: "CN=IntermediateCA".to_string(),
            serial: "01".to_string(),
            status,
            checked_at: OffsetDateTime::now_utc(),
            ttl,
        }
    }

    #[test]
    fn test_cache_hit_and_miss() {
        let cache = RevocationCache::new();
        cache.insert(key(1), record(RevocationStatus::Good, Duration::from_secs(60)));

        assert_eq!(cache.get(&key(1)).unwrap().status, RevocationStatus::Good);
        assert!(cache.get(&key(2)).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cache_expiry() {
        let cache = RevocationCache::new();
        cache.insert(key(1), record(RevocationStatus::Good, Duration::from_millis(1)));

        std::thread::sleep(Duration::from_millis(5));

        assert!(cache.get(&key(1)).is_none());
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_ttl_is_not_stored() {
        let cache = RevocationCache::new();
        cache.insert(key(1), record(RevocationStatus::Good, Duration::ZERO));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict_expired() {
        let cache = RevocationCache::new();
        cache.insert(key(1), record(RevocationStatus::Good, Duration::from_millis(1)));
        cache.insert(key(2), record(RevocationStatus::Good, Duration::from_secs(60)));

        std::thread::sleep(Duration::from_millis(5));
        cache.evict_expired();

        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key(2)).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_clear() {
        let cache = RevocationCache::default();
        cache.insert(key(1), record(RevocationStatus::Unknown, Duration::from_secs(60)));
        cache.clear();
        assert!(cache.get(&key(1)).is_none());
    }

    #[tokio::test]
    async fn resolved_record_is_served_from_cache() {
        let cache = RevocationCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let record = cache
                .get_or_resolve(&key(1), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(record(RevocationStatus::Good, Duration::from_secs(60)))
                })
                .await
                .unwrap();
            assert_eq!(record.status, RevocationStatus::Good);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().resolutions, 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = RevocationCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let result = cache
                .get_or_resolve(&key(1), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Revocation("unreachable".into()))
                })
                .await;
            assert!(result.is_err());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_resolution() {
        let cache = Arc::new(RevocationCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_resolve(&key(7), || async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(record(RevocationStatus::Good, Duration::from_secs(60)))
                        })
                        .await
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            assert_eq!(result.unwrap().unwrap().status, RevocationStatus::Good);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_failure() {
        let cache = Arc::new(RevocationCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_resolve(&key(9), || async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Err::<RevocationRecord, _>(Error::Revocation("down".into()))
                        })
                        .await
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            assert!(result.unwrap().is_err());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn flight_slot_is_released_after_resolution() {
        let cache = RevocationCache::new();
        cache
            .get_or_resolve(&key(3), || async {
                Ok(record(RevocationStatus::Good, Duration::from_secs(60)))
            })
            .await
            .unwrap();
        assert_eq!(cache.in_flight(), 0);

        let _ = cache
            .get_or_resolve(&key(4), || async {
                Err::<RevocationRecord, _>(Error::Revocation("down".into()))
            })
            .await;
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn expired_record_is_refreshed_once_for_a_burst() {
        let cache = Arc::new(RevocationCache::new());
        cache.insert(key(5), record(RevocationStatus::Good, Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(30)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_resolve(&key(5), || async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            let status = RevocationStatus::Revoked {
                                reason: "superseded".into(),
                            };
                            Ok(record(status, Duration::from_secs(60)))
                        })
                        .await
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            assert!(matches!(
                result.unwrap().unwrap().status,
                RevocationStatus::Revoked { .. }
            ));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().resolutions, 1);
    }

    #[tokio::test]
    async fn cleanup_task_reclaims_distinct_expired_keys() {
        let cache = Arc::new(RevocationCache::new());
        for n in 0..=255u8 {
            cache
                .get_or_resolve(&key(n), || async {
                    Ok(record(RevocationStatus::Good, Duration::from_millis(1)))
                })
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 256);
        assert_eq!(cache.in_flight(), 0);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = spawn_cleanup_task(&cache, Duration::from_millis(10), shutdown_rx);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.is_empty());
        assert_eq!(cache.stats().evictions, 256);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cleanup_task_ends_with_the_cache() {
        let cache = Arc::new(RevocationCache::new());
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = spawn_cleanup_task(&cache, Duration::from_millis(5), shutdown_rx);
        drop(cache);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
