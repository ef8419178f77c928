//! TTL-bounded metrics cache with single-flight refresh
//!
//! One entry per monitored key. Readers see the current snapshot through an
//! `Arc` swap, so they observe either the old or the new snapshot, never a
//! partial write. A refresh is a spawned fetch whose outcome is shared through
//! a future stored on the entry: the first caller that finds the entry stale
//! starts it, everyone arriving while it is pending awaits the same future and
//! receives the same outcome.

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ScalerError;
use crate::metrics::Metrics;
use crate::model::{MetricsSnapshot, MonitorKey};
use crate::source::MetricsSource;

/// Snapshot returned by a cache lookup
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub snapshot: Arc<MetricsSnapshot>,
    /// True when the refresh failed and the last known snapshot was served instead
    pub degraded: bool,
    /// Time since the snapshot was fetched
    pub age: Duration,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<CacheLookup, ScalerError>>>;

struct CachedSnapshot {
    snapshot: Arc<MetricsSnapshot>,
    fetched_at: Instant,
}

#[derive(Default)]
struct CacheEntry {
    current: RwLock<Option<CachedSnapshot>>,
    in_flight: Mutex<Option<RefreshFuture>>,
}

impl CacheEntry {
    fn lookup(&self, degraded: bool) -> Option<CacheLookup> {
        let current = self.current.read().unwrap_or_else(|p| p.into_inner());
        current.as_ref().map(|cached| CacheLookup {
            snapshot: cached.snapshot.clone(),
            degraded,
            age: cached.fetched_at.elapsed(),
        })
    }

    fn fresh(&self, ttl: Duration) -> Option<CacheLookup> {
        self.lookup(false).filter(|lookup| lookup.age <= ttl)
    }

    fn store(&self, snapshot: MetricsSnapshot) -> CacheLookup {
        let snapshot = Arc::new(snapshot);
        let mut current = self.current.write().unwrap_or_else(|p| p.into_inner());
        *current = Some(CachedSnapshot {
            snapshot: snapshot.clone(),
            fetched_at: Instant::now(),
        });
        CacheLookup {
            snapshot,
            degraded: false,
            age: Duration::ZERO,
        }
    }
}

/// Metrics cache shared by the scaler service and the collector
pub struct MetricsCache {
    source: Arc<dyn MetricsSource>,
    ttl: Duration,
    fetch_timeout: Duration,
    allow_dynamic_keys: bool,
    entries: RwLock<HashMap<MonitorKey, Arc<CacheEntry>>>,
    metrics: Metrics,
}

impl MetricsCache {
    pub fn new(source: Arc<dyn MetricsSource>, ttl: Duration, fetch_timeout: Duration) -> Self {
        Self {
            source,
            ttl,
            fetch_timeout,
            allow_dynamic_keys: false,
            entries: RwLock::new(HashMap::new()),
            metrics: Metrics,
        }
    }

    /// Create entries on first query for keys that were never registered
    pub fn with_dynamic_keys(mut self, allow: bool) -> Self {
        self.allow_dynamic_keys = allow;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Start monitoring `key`; registering an existing key is a no-op
    pub fn register(&self, key: MonitorKey) {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        if !entries.contains_key(&key) {
            info!(
                component = %key.component_name,
                endpoint = %key.endpoint_name,
                "Registered monitor key"
            );
            entries.insert(key, Arc::new(CacheEntry::default()));
        }
    }

    /// Stop monitoring `key` and drop its cached snapshot
    pub fn deregister(&self, key: &MonitorKey) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.remove(key).is_some()
    }

    pub fn is_registered(&self, key: &MonitorKey) -> bool {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries.contains_key(key)
    }

    /// Whether a query for `key` can be answered at all
    pub fn accepts(&self, key: &MonitorKey) -> bool {
        self.allow_dynamic_keys || self.is_registered(key)
    }

    /// Registered keys, in stable order
    pub fn keys(&self) -> Vec<MonitorKey> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        let mut keys: Vec<MonitorKey> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Get the snapshot for `key`, refreshing it when stale or when forced.
    ///
    /// A failed refresh falls back to the last known snapshot marked
    /// `degraded`; with nothing cached it fails with `NoDataAvailable`.
    pub async fn get(
        &self,
        key: &MonitorKey,
        force_refresh: bool,
    ) -> Result<CacheLookup, ScalerError> {
        let entry = self.entry(key)?;

        if !force_refresh {
            if let Some(lookup) = entry.fresh(self.ttl) {
                return Ok(lookup);
            }
        }

        self.refresh(key, &entry, force_refresh).await
    }

    fn entry(&self, key: &MonitorKey) -> Result<Arc<CacheEntry>, ScalerError> {
        {
            let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
            if let Some(entry) = entries.get(key) {
                return Ok(entry.clone());
            }
        }

        if !self.allow_dynamic_keys {
            return Err(ScalerError::InvalidKey { key: key.clone() });
        }

        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            info!(
                component = %key.component_name,
                endpoint = %key.endpoint_name,
                "Monitoring new key on first query"
            );
            Arc::new(CacheEntry::default())
        });
        Ok(entry.clone())
    }

    /// Join the pending refresh of `entry` or start one.
    ///
    /// Freshness is re-checked under the in-flight lock: a refresh that
    /// finished after the caller's first look has already stored its
    /// snapshot by the time it clears the marker.
    fn refresh(
        &self,
        key: &MonitorKey,
        entry: &Arc<CacheEntry>,
        force_refresh: bool,
    ) -> RefreshFuture {
        let mut in_flight = entry.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(pending) = in_flight.as_ref() {
            debug!(
                component = %key.component_name,
                endpoint = %key.endpoint_name,
                "Joining in-flight refresh"
            );
            return pending.clone();
        }

        if !force_refresh {
            if let Some(lookup) = entry.fresh(self.ttl) {
                return future::ready(Ok(lookup)).boxed().shared();
            }
        }

        // The fetch runs as its own task so it completes even when every
        // waiter is cancelled
        let task = tokio::spawn(fetch_and_store(
            self.source.clone(),
            self.fetch_timeout,
            self.metrics,
            key.clone(),
            entry.clone(),
        ));

        let failed_key = key.clone();
        let target = Arc::downgrade(entry);
        let refresh = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    if let Some(target) = target.upgrade() {
                        target
                            .in_flight
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .take();
                    }
                    Err(ScalerError::source_unavailable(
                        &failed_key,
                        format!("refresh task failed: {}", e),
                    ))
                }
            }
        }
        .boxed()
        .shared();

        *in_flight = Some(refresh.clone());
        refresh
    }
}

async fn fetch_and_store(
    source: Arc<dyn MetricsSource>,
    fetch_timeout: Duration,
    metrics: Metrics,
    key: MonitorKey,
    target: Arc<CacheEntry>,
) -> Result<CacheLookup, ScalerError> {
    let started = Instant::now();
    let fetched = match tokio::time::timeout(fetch_timeout, source.fetch(&key)).await {
        Ok(result) => result,
        Err(_) => Err(ScalerError::source_unavailable(
            &key,
            format!("fetch timed out after {:?}", fetch_timeout),
        )),
    };

    let outcome = match fetched {
        Ok(snapshot) => {
            metrics.record_fetch(&key, "ok", started.elapsed());
            metrics.update_gauges(&key, &snapshot);
            Ok(target.store(snapshot))
        }
        Err(err) => {
            metrics.record_fetch(&key, err.kind(), started.elapsed());
            match target.lookup(true) {
                Some(stale) => {
                    warn!(
                        component = %key.component_name,
                        endpoint = %key.endpoint_name,
                        error = %err,
                        "Metrics refresh failed, keeping last known snapshot"
                    );
                    metrics.record_degraded(&key, stale.age);
                    Ok(stale)
                }
                None => {
                    warn!(
                        component = %key.component_name,
                        endpoint = %key.endpoint_name,
                        error = %err,
                        "Metrics refresh failed with nothing cached"
                    );
                    Err(ScalerError::NoDataAvailable { key: key.clone() })
                }
            }
        }
    };

    target
        .in_flight
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .take();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    impl CountingSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl MetricsSource for CountingSource {
        async fn fetch(&self, key: &MonitorKey) -> Result<MetricsSnapshot, ScalerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail.load(Ordering::SeqCst) {
                return Err(ScalerError::source_unavailable(key, "down"));
            }
            Ok(MetricsSnapshot::new(n as f64 / 10.0, 0.0, 0.0))
        }
    }

    fn key() -> MonitorKey {
        MonitorKey::new("llm-worker", "kv-router")
    }

    fn cache(source: Arc<CountingSource>) -> MetricsCache {
        let cache = MetricsCache::new(source, Duration::from_secs(5), Duration::from_secs(1));
        cache.register(key());
        cache
    }

    #[tokio::test]
    async fn test_unregistered_key_is_invalid() {
        let cache = cache(CountingSource::new());
        let err = cache
            .get(&MonitorKey::new("other", "ep"), false)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ScalerError::InvalidKey {
                key: MonitorKey::new("other", "ep")
            }
        );
    }

    #[tokio::test]
    async fn test_dynamic_keys_created_lazily() {
        let source = CountingSource::new();
        let cache = MetricsCache::new(source.clone(), Duration::from_secs(5), Duration::from_secs(1))
            .with_dynamic_keys(true);
        let other = MonitorKey::new("other", "ep");

        let lookup = cache.get(&other, false).await.unwrap();
        assert!(!lookup.degraded);
        assert!(cache.is_registered(&other));
    }

    #[tokio::test]
    async fn test_failure_without_data_is_no_data() {
        let source = CountingSource::new();
        source.fail.store(true, Ordering::SeqCst);
        let cache = cache(source);

        let err = cache.get(&key(), false).await.unwrap_err();
        assert_eq!(err, ScalerError::NoDataAvailable { key: key() });
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_fresh_entry() {
        let source = CountingSource::new();
        let cache = cache(source.clone());

        cache.get(&key(), false).await.unwrap();
        cache.get(&key(), false).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        let lookup = cache.get(&key(), true).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(lookup.snapshot.load_average, 0.2);
    }

    #[tokio::test]
    async fn test_deregister_removes_entry() {
        let cache = cache(CountingSource::new());
        assert!(cache.deregister(&key()));
        assert!(!cache.is_registered(&key()));
        assert!(cache.keys().is_empty());
    }
}
