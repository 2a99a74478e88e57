use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::analytics::aggregator::AnalyticsAggregator;
use crate::api::errors::FlagError;
use crate::health::HealthHandle;
use crate::metrics_consts::{
    RETENTION_DELETED_COUNTER, RETENTION_ERRORS_COUNTER, RETENTION_LAST_RUN_GAUGE,
};
use crate::metrics_utils::{gauge, get_current_timestamp_seconds, inc};

/// Periodically deletes evaluation records older than the retention horizon.
pub struct RetentionSweeper {
    aggregator: AnalyticsAggregator,
    retention_days: u32,
}

impl RetentionSweeper {
    pub fn new(aggregator: AnalyticsAggregator, retention_days: u32) -> Self {
        Self {
            aggregator,
            retention_days,
        }
    }

    /// One sweep: everything evaluated before `now - retention_days` goes.
    pub async fn sweep(&self) -> Result<u64, FlagError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.retention_days));
        let deleted = self.aggregator.delete_older_than(cutoff).await?;

        inc(RETENTION_DELETED_COUNTER, &[], deleted);
        gauge(RETENTION_LAST_RUN_GAUGE, &[], get_current_timestamp_seconds());
        info!(deleted, %cutoff, "Deleted expired evaluation records");
        Ok(deleted)
    }

    pub fn spawn(
        self,
        interval: Duration,
        shutdown: CancellationToken,
        liveness: HealthHandle,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                if let Err(e) = self.sweep().await {
                    inc(RETENTION_ERRORS_COUNTER, &[], 1);
                    error!("Retention sweep failed: {}", e);
                }
                liveness.report_healthy();
            }
            info!("Retention sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::health::HealthRegistry;
    use crate::test_utils::{test_flag, test_record, MemoryStore};

    fn sweeper(store: &Arc<MemoryStore>, retention_days: u32) -> RetentionSweeper {
        RetentionSweeper::new(
            AnalyticsAggregator::new(store.clone(), store.clone()),
            retention_days,
        )
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_expired_records() {
        let store = Arc::new(MemoryStore::new());
        let flag = test_flag("aged", true, 50);
        store.seed_record(test_record(flag.id, true, Utc::now() - chrono::Duration::days(31)));
        store.seed_record(test_record(flag.id, true, Utc::now() - chrono::Duration::days(29)));
        store.seed_record(test_record(flag.id, false, Utc::now()));

        assert_eq!(sweeper(&store, 30).sweep().await.unwrap(), 1);
        assert_eq!(store.records().len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_failure_is_reported() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_writes(true);
        assert!(matches!(
            sweeper(&store, 30).sweep().await,
            Err(FlagError::DatabaseUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_spawned_sweeper_runs_and_stops() {
        let store = Arc::new(MemoryStore::new());
        let flag = test_flag("aged", true, 50);
        store.seed_record(test_record(flag.id, true, Utc::now() - chrono::Duration::days(40)));
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("retention_sweeper", Duration::from_secs(10));

        let shutdown = CancellationToken::new();
        let task = sweeper(&store, 30).spawn(Duration::from_secs(3600), shutdown.clone(), handle);

        for _ in 0..100 {
            if store.records().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.records().is_empty());

        shutdown.cancel();
        task.await.unwrap();
        assert!(registry.get_status().healthy);
    }
}
