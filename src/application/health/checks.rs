use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::application::pool::ConnectionPool;
use crate::application::query_metrics::QueryMetricsTracker;
use crate::config::{DatabaseSettings, HealthSettings};
use crate::infra::kv::KeyValueStore;

use super::{HealthCheck, HealthIssue, Severity};

/// Document-store reachability and round-trip latency.
pub struct DocumentStoreCheck {
    pool: ConnectionPool,
    interval: Duration,
    warn_after: Duration,
}

impl DocumentStoreCheck {
    pub fn new(pool: ConnectionPool, interval: Duration, warn_after: Duration) -> Self {
        Self {
            pool,
            interval,
            warn_after,
        }
    }
}

#[async_trait]
impl HealthCheck for DocumentStoreCheck {
    fn name(&self) -> &str {
        "database_connectivity"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Option<HealthIssue> {
        match self.pool.health().await {
            Err(err) => Some(HealthIssue::new(
                "connectivity",
                Severity::Critical,
                format!("document store connectivity failed: {err}"),
            )),
            Ok(health) if health.latency > self.warn_after => Some(HealthIssue::new(
                "performance",
                Severity::Warning,
                format!(
                    "document store response time is slow: {}ms",
                    health.latency.as_millis()
                ),
            )),
            Ok(_) => None,
        }
    }
}

/// Key-value store reachability. Only a warning: without the store the
/// service keeps serving, minus caching and rate limiting.
pub struct KeyValueStoreCheck {
    store: Arc<dyn KeyValueStore>,
    interval: Duration,
    timeout: Duration,
}

impl KeyValueStoreCheck {
    pub fn new(store: Arc<dyn KeyValueStore>, interval: Duration, timeout: Duration) -> Self {
        Self {
            store,
            interval,
            timeout,
        }
    }
}

#[async_trait]
impl HealthCheck for KeyValueStoreCheck {
    fn name(&self) -> &str {
        "key_value_connectivity"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Option<HealthIssue> {
        let message = match tokio::time::timeout(self.timeout, self.store.ping()).await {
            Ok(Ok(())) => return None,
            Ok(Err(err)) => format!("key-value store unreachable: {err}"),
            Err(_) => format!(
                "key-value store did not answer within {}ms",
                self.timeout.as_millis()
            ),
        };
        Some(HealthIssue::new("connectivity", Severity::Warning, message).scoped("key_value_store"))
    }
}

pub struct PoolUsageCheck {
    pool: ConnectionPool,
    interval: Duration,
    threshold: f64,
}

impl PoolUsageCheck {
    pub fn new(pool: ConnectionPool, interval: Duration, threshold: f64) -> Self {
        Self {
            pool,
            interval,
            threshold,
        }
    }
}

#[async_trait]
impl HealthCheck for PoolUsageCheck {
    fn name(&self) -> &str {
        "connection_pool_usage"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Option<HealthIssue> {
        let usage = self.pool.status().usage();
        (usage > self.threshold).then(|| {
            HealthIssue::new(
                "resource",
                Severity::Warning,
                format!("connection pool usage is high: {:.1}%", usage * 100.0),
            )
        })
    }
}

/// Every configured collection must exist. One issue names all missing ones.
pub struct CollectionsCheck {
    pool: ConnectionPool,
    collections: Vec<String>,
    interval: Duration,
}

impl CollectionsCheck {
    pub fn new(pool: ConnectionPool, collections: Vec<String>, interval: Duration) -> Self {
        Self {
            pool,
            collections,
            interval,
        }
    }
}

#[async_trait]
impl HealthCheck for CollectionsCheck {
    fn name(&self) -> &str {
        "collections"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Option<HealthIssue> {
        let store = self.pool.acquire();
        let mut missing = Vec::new();
        for collection in &self.collections {
            match store.database_exists(collection).await {
                Ok(true) => {}
                Ok(false) => missing.push(collection.as_str()),
                Err(err) => {
                    // Reachability is the connectivity check's concern.
                    debug!(
                        target = "quire::health",
                        collection = %collection,
                        error = %err,
                        "collection lookup failed"
                    );
                    return None;
                }
            }
        }
        if missing.is_empty() {
            return None;
        }

        let names = missing.join(", ");
        let message = match missing.len() {
            1 => format!("collection {names} does not exist"),
            _ => format!("collections {names} do not exist"),
        };
        Some(HealthIssue::new("configuration", Severity::Critical, message).scoped(names))
    }
}

/// Flags the slowest operation whose average exceeds the threshold.
pub struct SlowQueryCheck {
    metrics: Arc<QueryMetricsTracker>,
    interval: Duration,
    threshold: Duration,
}

impl SlowQueryCheck {
    pub fn new(metrics: Arc<QueryMetricsTracker>, interval: Duration, threshold: Duration) -> Self {
        Self {
            metrics,
            interval,
            threshold,
        }
    }
}

#[async_trait]
impl HealthCheck for SlowQueryCheck {
    fn name(&self) -> &str {
        "slow_queries"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Option<HealthIssue> {
        let (operation, metric) = self
            .metrics
            .slow_operations(self.threshold)
            .into_iter()
            .next()?;
        Some(
            HealthIssue::new(
                "performance",
                Severity::Warning,
                format!(
                    "query {operation} has slow average time: {}ms",
                    metric.average.as_millis()
                ),
            )
            .scoped(operation),
        )
    }
}

/// The standard check set.
pub fn builtin(
    settings: &HealthSettings,
    database: &DatabaseSettings,
    kv_timeout: Duration,
    pool: &ConnectionPool,
    store: &Arc<dyn KeyValueStore>,
    metrics: &Arc<QueryMetricsTracker>,
) -> Vec<Arc<dyn HealthCheck>> {
    vec![
        Arc::new(DocumentStoreCheck::new(
            pool.clone(),
            settings.connectivity_interval,
            settings.response_time_warning,
        )),
        Arc::new(KeyValueStoreCheck::new(
            store.clone(),
            settings.connectivity_interval,
            kv_timeout,
        )),
        Arc::new(PoolUsageCheck::new(
            pool.clone(),
            settings.pool_interval,
            settings.pool_usage_warning,
        )),
        Arc::new(CollectionsCheck::new(
            pool.clone(),
            database.collections.clone(),
            settings.collections_interval,
        )),
        Arc::new(SlowQueryCheck::new(
            metrics.clone(),
            settings.slow_query_interval,
            settings.slow_query_warning,
        )),
    ]
}
