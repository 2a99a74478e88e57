use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::api::errors::FlagError;
use crate::config::ConfigError;
use crate::flags::flag_models::Flag;
use crate::health::HealthHandle;
use crate::metrics_consts::{
    FLAG_CACHE_HIT_COUNTER, FLAG_CACHE_INVALIDATIONS_COUNTER, FLAG_CACHE_LOAD_ERRORS_COUNTER,
    FLAG_CACHE_MISS_COUNTER, FLAG_CACHE_REFRESH_COUNTER, FLAG_CACHE_REFRESH_ERRORS_COUNTER,
    FLAG_CACHE_SIZE_GAUGE,
};
use crate::metrics_utils::{gauge, inc};
use crate::store::FlagStore;

/// The whole working set lives under a single key.
const SNAPSHOT_KEY: u8 = 0;

/// Timing knobs for [`FlagCache`]. The TTL must be longer than the refresh interval so a
/// healthy refresher always replaces the snapshot before it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    ttl: Duration,
    refresh_interval: Duration,
    load_timeout: Duration,
}

impl CacheSettings {
    pub fn new(
        ttl: Duration,
        refresh_interval: Duration,
        load_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if refresh_interval.is_zero() {
            return Err(ConfigError::MustBePositive("CACHE_REFRESH_INTERVAL_SECONDS"));
        }
        if load_timeout.is_zero() {
            return Err(ConfigError::MustBePositive("CACHE_LOAD_TIMEOUT_MS"));
        }
        if ttl <= refresh_interval {
            return Err(ConfigError::TtlNotAboveRefresh {
                ttl,
                refresh: refresh_interval,
            });
        }
        Ok(Self {
            ttl,
            refresh_interval,
            load_timeout,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn load_timeout(&self) -> Duration {
        self.load_timeout
    }
}

/// Time-bounded snapshot of every enabled flag, with its rules.
///
/// Readers always get a complete `Arc<Vec<Flag>>`, either the previous snapshot or the next
/// one. A snapshot is served until its TTL runs out or it is invalidated; after that the
/// next reader loads synchronously from the store and concurrent cold readers wait on that
/// single load. A background refresher reloads on a fixed interval.
///
/// Every invalidation bumps a generation counter. A load that started before an
/// invalidation never leaves its result in the cache, so a write followed by
/// [`FlagCache::invalidate`] is visible to the next read.
pub struct FlagCache {
    store: Arc<dyn FlagStore>,
    cache: Cache<u8, Arc<Vec<Flag>>>,
    fetch_lock: Mutex<()>,
    generation: AtomicU64,
    settings: CacheSettings,
}

impl FlagCache {
    pub fn new(store: Arc<dyn FlagStore>, settings: CacheSettings) -> Self {
        let cache = Cache::builder()
            .time_to_live(settings.ttl)
            .max_capacity(1)
            .build();

        Self {
            store,
            cache,
            fetch_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            settings,
        }
    }

    pub fn settings(&self) -> CacheSettings {
        self.settings
    }

    /// Current working set, loading it from the store when absent or expired.
    pub async fn get_enabled_flags(&self) -> Result<Arc<Vec<Flag>>, FlagError> {
        if let Some(snapshot) = self.cache.get(&SNAPSHOT_KEY).await {
            inc(FLAG_CACHE_HIT_COUNTER, &[], 1);
            return Ok(snapshot);
        }

        let _lock = self.fetch_lock.lock().await;

        // another reader may have loaded while we waited for the lock
        if let Some(snapshot) = self.cache.get(&SNAPSHOT_KEY).await {
            inc(FLAG_CACHE_HIT_COUNTER, &[], 1);
            return Ok(snapshot);
        }

        inc(FLAG_CACHE_MISS_COUNTER, &[], 1);
        let generation = self.generation.load(Ordering::SeqCst);
        match self.load().await {
            Ok(flags) => {
                self.publish(generation, flags.clone()).await;
                Ok(flags)
            }
            Err(e) => {
                inc(FLAG_CACHE_LOAD_ERRORS_COUNTER, &[], 1);
                error!("Failed to load flags on cache miss: {}", e);
                Err(e)
            }
        }
    }

    /// Linear scan of the current snapshot.
    pub async fn get_flag_by_name(&self, name: &str) -> Result<Option<Flag>, FlagError> {
        let flags = self.get_enabled_flags().await?;
        Ok(flags.iter().find(|flag| flag.name == name).cloned())
    }

    /// Unconditionally reloads the working set and replaces the snapshot with a fresh TTL.
    /// On failure the existing snapshot is left alone.
    #[instrument(skip_all)]
    pub async fn refresh(&self) -> Result<usize, FlagError> {
        let generation = self.generation.load(Ordering::SeqCst);
        match self.load().await {
            Ok(flags) => {
                let count = flags.len();
                self.publish(generation, flags).await;
                inc(FLAG_CACHE_REFRESH_COUNTER, &[], 1);
                Ok(count)
            }
            Err(e) => {
                inc(FLAG_CACHE_REFRESH_ERRORS_COUNTER, &[], 1);
                Err(e)
            }
        }
    }

    /// Drops the snapshot. Never blocks the caller.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cache.invalidate_all();
        inc(FLAG_CACHE_INVALIDATIONS_COUNTER, &[], 1);
        debug!("Flag cache invalidated");
    }

    async fn load(&self) -> Result<Arc<Vec<Flag>>, FlagError> {
        let loaded = tokio::time::timeout(
            self.settings.load_timeout,
            self.store.load_enabled_flags_with_rules(),
        )
        .await;

        match loaded {
            Ok(Ok(flags)) => {
                gauge(FLAG_CACHE_SIZE_GAUGE, &[], flags.len() as f64);
                Ok(Arc::new(flags))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(FlagError::TimeoutError),
        }
    }

    /// Inserts a loaded snapshot, then takes it back out if an invalidation happened since
    /// the load began. Checking after the insert closes the gap between check and insert.
    async fn publish(&self, generation: u64, flags: Arc<Vec<Flag>>) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.cache.insert(SNAPSHOT_KEY, flags).await;
        if self.generation.load(Ordering::SeqCst) != generation {
            self.cache.invalidate(&SNAPSHOT_KEY).await;
        }
    }

    /// Starts the background refresher. The first tick fires immediately, which warms the
    /// cache at startup. The task exits when `shutdown` is cancelled.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        shutdown: CancellationToken,
        liveness: HealthHandle,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.settings.refresh_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                match cache.refresh().await {
                    Ok(count) => debug!(flags = count, "Refreshed flag cache"),
                    Err(e) => error!("Failed to refresh flag cache, keeping previous snapshot: {}", e),
                }
                liveness.report_healthy();
            }
            info!("Flag cache refresher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join_all;

    use super::*;
    use crate::health::HealthRegistry;
    use crate::test_utils::{test_flag, MemoryStore};

    fn settings(ttl_ms: u64, refresh_ms: u64, timeout_ms: u64) -> CacheSettings {
        CacheSettings::new(
            Duration::from_millis(ttl_ms),
            Duration::from_millis(refresh_ms),
            Duration::from_millis(timeout_ms),
        )
        .unwrap()
    }

    fn cache_with(store: &Arc<MemoryStore>, settings: CacheSettings) -> Arc<FlagCache> {
        Arc::new(FlagCache::new(store.clone(), settings))
    }

    #[test]
    fn test_ttl_must_exceed_refresh_interval() {
        let err = CacheSettings::new(
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::TtlNotAboveRefresh { .. }));

        assert!(CacheSettings::new(
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(1)
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_cold_read_loads_once_then_hits() {
        let store = Arc::new(MemoryStore::new());
        store.seed_flag(test_flag("a", true, 10));
        store.seed_flag(test_flag("b", false, 10));
        let cache = cache_with(&store, settings(60_000, 30_000, 1_000));

        let flags = cache.get_enabled_flags().await.unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].name, "a");

        let again = cache.get_enabled_flags().await.unwrap();
        assert!(Arc::ptr_eq(&flags, &again));
        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_cold_readers_share_one_load() {
        let store = Arc::new(MemoryStore::new());
        store.seed_flag(test_flag("a", true, 10));
        store.set_load_delay(Some(Duration::from_millis(50)));
        let cache = cache_with(&store, settings(60_000, 30_000, 1_000));

        let readers = (0..10).map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_enabled_flags().await })
        });
        for result in join_all(readers).await {
            assert_eq!(result.unwrap().unwrap().len(), 1);
        }
        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_makes_next_read_see_the_write() {
        let store = Arc::new(MemoryStore::new());
        store.seed_flag(test_flag("a", true, 10));
        let cache = cache_with(&store, settings(60_000, 30_000, 1_000));
        assert_eq!(cache.get_enabled_flags().await.unwrap()[0].rollout_percentage, 10);

        store.modify_flag("a", |flag| flag.rollout_percentage = 80);
        // still served from the snapshot
        assert_eq!(cache.get_enabled_flags().await.unwrap()[0].rollout_percentage, 10);

        cache.invalidate();
        assert_eq!(cache.get_enabled_flags().await.unwrap()[0].rollout_percentage, 80);
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_expires_after_ttl() {
        let store = Arc::new(MemoryStore::new());
        store.seed_flag(test_flag("a", true, 10));
        let cache = cache_with(&store, settings(100, 50, 1_000));

        cache.get_enabled_flags().await.unwrap();
        store.modify_flag("a", |flag| flag.enabled = false);
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(cache.get_enabled_flags().await.unwrap().is_empty());
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test]
    async fn test_cold_read_fails_loudly_when_store_is_down() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_reads(true);
        let cache = cache_with(&store, settings(60_000, 30_000, 1_000));

        let err = cache.get_enabled_flags().await.unwrap_err();
        assert!(matches!(err, FlagError::DatabaseUnavailable));
    }

    #[tokio::test]
    async fn test_cold_read_times_out() {
        let store = Arc::new(MemoryStore::new());
        store.seed_flag(test_flag("a", true, 10));
        store.set_load_delay(Some(Duration::from_millis(500)));
        let cache = cache_with(&store, settings(60_000, 30_000, 50));

        let err = cache.get_enabled_flags().await.unwrap_err();
        assert!(matches!(err, FlagError::TimeoutError));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.seed_flag(test_flag("a", true, 10));
        let cache = cache_with(&store, settings(60_000, 30_000, 1_000));
        cache.get_enabled_flags().await.unwrap();

        store.set_fail_reads(true);
        assert!(cache.refresh().await.is_err());

        let flags = cache.get_enabled_flags().await.unwrap();
        assert_eq!(flags.len(), 1);
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.seed_flag(test_flag("a", true, 10));
        let cache = cache_with(&store, settings(60_000, 30_000, 1_000));
        cache.get_enabled_flags().await.unwrap();

        store.seed_flag(test_flag("b", true, 10));
        assert_eq!(cache.refresh().await.unwrap(), 2);
        assert_eq!(cache.get_enabled_flags().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_started_before_invalidation_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        store.seed_flag(test_flag("a", true, 10));
        store.set_load_delay(Some(Duration::from_millis(100)));
        let cache = cache_with(&store, settings(60_000, 30_000, 1_000));

        let refresh = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // a write lands while the slow refresh still holds the old data
        store.modify_flag("a", |flag| flag.rollout_percentage = 90);
        cache.invalidate();
        refresh.await.unwrap().unwrap();

        store.set_load_delay(None);
        let flags = cache.get_enabled_flags().await.unwrap();
        assert_eq!(flags[0].rollout_percentage, 90);
    }

    #[tokio::test]
    async fn test_get_flag_by_name() {
        let store = Arc::new(MemoryStore::new());
        store.seed_flag(test_flag("a", true, 10));
        store.seed_flag(test_flag("off", false, 10));
        let cache = cache_with(&store, settings(60_000, 30_000, 1_000));

        assert!(cache.get_flag_by_name("a").await.unwrap().is_some());
        assert!(cache.get_flag_by_name("off").await.unwrap().is_none());
        assert!(cache.get_flag_by_name("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresher_runs_until_cancelled() {
        let store = Arc::new(MemoryStore::new());
        store.seed_flag(test_flag("a", true, 10));
        let cache = cache_with(&store, settings(200, 50, 1_000));
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("cache_refresher", Duration::from_secs(10));

        let shutdown = CancellationToken::new();
        let task = cache.spawn_refresher(shutdown.clone(), handle);

        tokio::time::sleep(Duration::from_millis(180)).await;
        assert!(store.load_count() >= 2);
        assert!(registry.get_status().healthy);

        shutdown.cancel();
        task.await.unwrap();
        let after_stop = store.load_count();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.load_count(), after_stop);
    }
}
