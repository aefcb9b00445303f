//! Process-wide dependencies, built once and passed to handlers and
//! background tasks.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::backup::BackupCoordinator;
use crate::application::error::AppError;
use crate::application::health::{HealthMonitor, checks};
use crate::application::migrations::{self, MigrationRunner};
use crate::application::pool::{ConnectionPool, PoolOptions};
use crate::application::query_metrics::QueryMetricsTracker;
use crate::application::rate_limit::RateLimiter;
use crate::application::shared_state::SharedState;
use crate::cache::{CacheConfig, CacheWriter, PageCache};
use crate::config::Settings;
use crate::infra::docstore::{Connector, CouchConnector, MemoryConnector, MemoryDocumentStore};
use crate::infra::kv::{KeyValueStore, MemoryStore, RedisStore};

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub kv: Arc<dyn KeyValueStore>,
    pub pool: ConnectionPool,
    pub rate_limiter: Arc<RateLimiter>,
    pub page_cache: PageCache,
    pub shared_state: SharedState,
    pub query_metrics: Arc<QueryMetricsTracker>,
    pub health: Arc<HealthMonitor>,
    pub migrations: Arc<MigrationRunner>,
    pub backups: Arc<BackupCoordinator>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("kv", &self.kv.backend())
            .field("pool", &self.pool)
            .field("page_cache", &self.page_cache)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    /// Connect to the configured stores. A missing URL selects the
    /// in-process backend for that store.
    pub async fn connect(settings: Settings) -> Result<Self, AppError> {
        let kv: Arc<dyn KeyValueStore> = match settings.store.url.as_deref() {
            Some(url) => Arc::new(RedisStore::connect(url, settings.store.operation_timeout).await?),
            None => {
                warn!(
                    target = "quire::context",
                    "no key-value store URL configured, using the in-process store"
                );
                Arc::new(MemoryStore::new())
            }
        };

        match settings.database.url.clone() {
            Some(url) => {
                let connector = CouchConnector::new(url, settings.database.ping_timeout);
                Self::assemble(settings, kv, &connector).await
            }
            None => {
                warn!(
                    target = "quire::context",
                    "no document store URL configured, using the in-process store"
                );
                let connector = MemoryConnector::new(MemoryDocumentStore::new());
                Self::assemble(settings, kv, &connector).await
            }
        }
    }

    /// Wire every component over the given stores.
    pub async fn assemble(
        settings: Settings,
        kv: Arc<dyn KeyValueStore>,
        connector: &dyn Connector,
    ) -> Result<Self, AppError> {
        let settings = Arc::new(settings);
        let cancel = CancellationToken::new();

        let pool = ConnectionPool::connect(connector, PoolOptions::from(&settings.database)).await?;
        let query_metrics = Arc::new(QueryMetricsTracker::new());
        let rate_limiter = Arc::new(RateLimiter::new(kv.clone(), &settings.rate_limit));

        let cache_config = CacheConfig::from(&settings.page_cache);
        let writer = CacheWriter::spawn(
            kv.clone(),
            cache_config.write_queue_capacity,
            cache_config.write_workers,
            cancel.child_token(),
        );
        let page_cache = PageCache::new(kv.clone(), cache_config, writer);
        let shared_state = SharedState::new(kv.clone());

        let health = Arc::new(HealthMonitor::new(
            settings.health.clone(),
            settings.database.collections.clone(),
            pool.clone(),
            query_metrics.clone(),
            checks::builtin(
                &settings.health,
                &settings.database,
                settings.store.operation_timeout,
                &pool,
                &kv,
                &query_metrics,
            ),
        ));

        let migrations = Arc::new(
            MigrationRunner::new(pool.shared(), migrations::builtin()).with_lease(kv.clone()),
        );
        let backups = Arc::new(BackupCoordinator::new(
            pool.shared(),
            &settings.backup,
            settings.database.collections.clone(),
        ));

        info!(
            target = "quire::context",
            kv = kv.backend(),
            pool_size = settings.database.pool_size.get(),
            page_cache = settings.page_cache.enabled,
            "application context ready"
        );

        Ok(Self {
            settings,
            kv,
            pool,
            rate_limiter,
            page_cache,
            shared_state,
            query_metrics,
            health,
            migrations,
            backups,
            cancel,
        })
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Start the health monitor and, when enabled, scheduled backups.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = self.health.spawn(&self.cancel);
        if self.settings.backup.enabled {
            handles.push(self.backups.spawn(&self.cancel));
        }
        handles
    }

    /// Stop background loops, drain pending cache writes and close the pool.
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>) {
        self.page_cache.flush().await;
        self.cancel.cancel();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(target = "quire::context", error = %err, "background task ended abnormally");
            }
        }
        self.pool.close().await;
        info!(target = "quire::context", "application context shut down");
    }
}
