use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::analytics::aggregator::AnalyticsAggregator;
use crate::analytics::retention::RetentionSweeper;
use crate::config::{Config, ConfigError};
use crate::flags::flag_admin::FlagAdminService;
use crate::flags::flag_cache::FlagCache;
use crate::flags::flag_service::FlagEvaluationService;
use crate::health::HealthRegistry;
use crate::metrics_utils::setup_metrics_recorder;
use crate::recorder::EvaluationRecorder;
use crate::router;
use crate::store::postgres::PgStore;
use crate::store::{EvaluationStore, FlagAdminStore, FlagStore};

/// A wired engine: the HTTP router plus the background tasks feeding it.
pub struct Engine {
    pub router: Router,
    pub liveness: HealthRegistry,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Builds the cache, recorder, analytics and admin services over `store` and starts
    /// the refresher, recorder worker and retention sweeper.
    pub fn start<S>(
        config: &Config,
        store: Arc<S>,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Engine, ConfigError>
    where
        S: FlagAdminStore + EvaluationStore + 'static,
    {
        config.validate()?;
        let settings = config.cache_settings()?;

        let flag_store: Arc<dyn FlagStore> = store.clone();
        let admin_store: Arc<dyn FlagAdminStore> = store.clone();
        let evaluation_store: Arc<dyn EvaluationStore> = store;

        let shutdown = CancellationToken::new();
        let liveness = HealthRegistry::new("liveness");
        let mut tasks = Vec::with_capacity(3);

        let cache = Arc::new(FlagCache::new(flag_store.clone(), settings));
        // a refresher that misses three ticks in a row is stalled
        let refresher_health =
            liveness.register("cache_refresher", settings.refresh_interval() * 3);
        tasks.push(cache.spawn_refresher(shutdown.clone(), refresher_health));

        let (recorder, recorder_worker) = EvaluationRecorder::start(
            evaluation_store.clone(),
            config.recorder_queue_capacity,
            shutdown.clone(),
        );
        tasks.push(recorder_worker);

        let aggregator = AnalyticsAggregator::new(flag_store.clone(), evaluation_store);
        let retention_interval = config.retention_interval();
        let sweeper_health = liveness.register(
            "retention_sweeper",
            retention_interval * 2 + Duration::from_secs(60),
        );
        tasks.push(
            RetentionSweeper::new(aggregator.clone(), config.retention_days).spawn(
                retention_interval,
                shutdown.clone(),
                sweeper_health,
            ),
        );

        let state = router::State {
            evaluation: Arc::new(FlagEvaluationService::new(
                cache.clone(),
                recorder,
                aggregator,
            )),
            admin: Arc::new(FlagAdminService::new(admin_store, cache)),
            default_analytics_hours: config.default_analytics_hours,
        };
        let router = router::router(state, flag_store, liveness.clone(), metrics);

        Ok(Engine {
            router,
            liveness,
            shutdown,
            tasks,
        })
    }

    /// Stops the background loops and waits for the recorder to flush its queue.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Background task failed during shutdown: {}", e);
            }
        }
    }
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let store = match PgStore::new(
        &config.database_url,
        config.max_pg_connections,
        config.acquire_timeout(),
    ) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("Failed to create database pool: {}", e);
            return;
        }
    };

    if *config.run_migrations {
        if let Err(e) = store.run_migrations().await {
            tracing::error!("Failed to run migrations: {}", e);
            return;
        }
        tracing::info!("Database migrations applied");
    }

    // Installing a global recorder more than once per process fails, so only do it here.
    let metrics = if config.enable_metrics {
        match setup_metrics_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!("Failed to install metrics recorder: {}", e);
                return;
            }
        }
    } else {
        None
    };

    let engine = match Engine::start(&config, store, metrics) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            return;
        }
    };

    let app = engine
        .router
        .clone()
        .into_make_service_with_connect_info::<SocketAddr>();

    match listener.local_addr() {
        Ok(addr) => tracing::info!("listening on {:?}", addr),
        Err(e) => tracing::warn!("listening on an unknown address: {}", e),
    }
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("Server error: {}", e);
    }

    engine.shutdown().await;
    tracing::info!("Flag engine stopped");
}
