//! Periodic health monitoring.
//!
//! Each registered [`HealthCheck`] runs on its own interval and yields at
//! most one [`HealthIssue`] per run. Issues land in an [`IssueLedger`] that
//! keeps one unresolved record per `(type, scope)`; the aggregate
//! [`HealthStatus`] is derived from it on demand. Alongside the checks, a
//! collector samples document counts and pool gauges, and a summarizer logs
//! a periodic report. None of this sits on the request path.

pub mod checks;
mod ledger;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::gauge;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::pool::{ConnectionPool, PoolStatus};
use crate::application::query_metrics::{QueryMetric, QueryMetricsTracker};
use crate::application::tasks::spawn_periodic;
use crate::config::HealthSettings;

pub use ledger::IssueLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthIssue {
    #[serde(rename = "type")]
    pub issue_type: String,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Name of the check that raised the issue, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub resolved: bool,
}

impl HealthIssue {
    pub fn new(
        issue_type: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            issue_type: issue_type.into(),
            severity,
            message: message.into(),
            scope: None,
            check: None,
            timestamp: OffsetDateTime::now_utc(),
            resolved: false,
        }
    }

    pub fn scoped(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn from_check(mut self, check: impl Into<String>) -> Self {
        self.check = Some(check.into());
        self
    }

    /// Deduplication identity: `(type, scope)`.
    pub fn same_subject(&self, other: &HealthIssue) -> bool {
        self.issue_type == other.issue_type && self.scope == other.scope
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Stable name; issues raised by the check are tagged with it.
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    async fn run(&self) -> Option<HealthIssue>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckPhase {
    Idle,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    Healthy,
    IssueRecorded {
        #[serde(rename = "type")]
        issue_type: String,
        severity: Severity,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckState {
    pub name: String,
    pub interval_secs: u64,
    pub phase: CheckPhase,
    pub runs: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run: Option<OffsetDateTime>,
    pub last_outcome: Option<CheckOutcome>,
}

impl CheckState {
    fn new(check: &dyn HealthCheck) -> Self {
        Self {
            name: check.name().to_string(),
            interval_secs: check.interval().as_secs(),
            phase: CheckPhase::Idle,
            runs: 0,
            last_run: None,
            last_outcome: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub uptime_secs: u64,
    pub issues: Vec<HealthIssue>,
    pub checks: Vec<CheckState>,
    pub pool: PoolStatus,
    pub documents: BTreeMap<String, u64>,
    pub metrics: BTreeMap<String, QueryMetric>,
}

pub struct HealthMonitor {
    ledger: IssueLedger,
    checks: Vec<Arc<dyn HealthCheck>>,
    states: DashMap<String, CheckState>,
    pool: ConnectionPool,
    metrics: Arc<QueryMetricsTracker>,
    settings: HealthSettings,
    collections: Vec<String>,
    documents: DashMap<String, u64>,
    started: Instant,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("checks", &self.checks.len())
            .field("status", &self.status())
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(
        settings: HealthSettings,
        collections: Vec<String>,
        pool: ConnectionPool,
        metrics: Arc<QueryMetricsTracker>,
        checks: Vec<Arc<dyn HealthCheck>>,
    ) -> Self {
        let states = DashMap::new();
        for check in &checks {
            states.insert(check.name().to_string(), CheckState::new(check.as_ref()));
        }
        Self {
            ledger: IssueLedger::new(settings.max_issues),
            checks,
            states,
            pool,
            metrics,
            settings,
            collections,
            documents: DashMap::new(),
            started: Instant::now(),
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.ledger.status()
    }

    pub fn issues(&self) -> Vec<HealthIssue> {
        self.ledger.snapshot()
    }

    pub fn record(&self, issue: HealthIssue) {
        self.ledger.record(issue);
    }

    pub fn resolve(&self, issue_type: &str, scope: Option<&str>) -> bool {
        self.ledger.resolve(issue_type, scope)
    }

    pub fn check_states(&self) -> Vec<CheckState> {
        let mut states: Vec<_> = self
            .states
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    /// One run of `check`: idle, running, then back to idle with the
    /// outcome recorded. A healthy run clears the check's open issues.
    pub async fn run_check(&self, check: &dyn HealthCheck) -> Option<HealthIssue> {
        let name = check.name().to_string();
        if let Some(mut state) = self.states.get_mut(&name) {
            state.phase = CheckPhase::Running;
        }

        let outcome = check.run().await.map(|issue| issue.from_check(name.clone()));

        let recorded = match outcome.as_ref() {
            Some(issue) => {
                self.ledger.resolve_from_check(&name, Some(issue));
                match issue.severity {
                    Severity::Critical => error!(
                        target = "quire::health",
                        check = %name,
                        issue_type = %issue.issue_type,
                        scope = issue.scope.as_deref().unwrap_or(""),
                        message = %issue.message,
                        "health check failed"
                    ),
                    Severity::Warning => warn!(
                        target = "quire::health",
                        check = %name,
                        issue_type = %issue.issue_type,
                        scope = issue.scope.as_deref().unwrap_or(""),
                        message = %issue.message,
                        "health check degraded"
                    ),
                    Severity::Info => info!(
                        target = "quire::health",
                        check = %name,
                        message = %issue.message,
                        "health check note"
                    ),
                }
                self.ledger.record(issue.clone());
                CheckOutcome::IssueRecorded {
                    issue_type: issue.issue_type.clone(),
                    severity: issue.severity,
                }
            }
            None => {
                self.ledger.resolve_from_check(&name, None);
                debug!(target = "quire::health", check = %name, "health check passed");
                CheckOutcome::Healthy
            }
        };

        let mut state = self
            .states
            .entry(name)
            .or_insert_with(|| CheckState::new(check));
        state.phase = CheckPhase::Idle;
        state.runs += 1;
        state.last_run = Some(OffsetDateTime::now_utc());
        state.last_outcome = Some(recorded);

        outcome
    }

    /// Run every registered check once, in registration order.
    pub async fn run_all(&self) -> Vec<HealthIssue> {
        let mut issues = Vec::new();
        for check in &self.checks {
            if let Some(issue) = self.run_check(check.as_ref()).await {
                issues.push(issue);
            }
        }
        issues
    }

    /// Sample document counts and pool gauges.
    pub async fn collect(&self) {
        let status = self.pool.status();
        gauge!("quire_pool_in_use").set(status.in_use as f64);
        gauge!("quire_pool_idle").set(status.idle as f64);

        let store = self.pool.shared();
        for collection in &self.collections {
            match store.count_docs(collection).await {
                Ok(count) => {
                    gauge!("quire_documents", "collection" => collection.clone()).set(count as f64);
                    self.documents.insert(collection.clone(), count);
                }
                Err(err) => {
                    debug!(
                        target = "quire::health",
                        collection = %collection,
                        error = %err,
                        "document count unavailable"
                    );
                }
            }
        }
    }

    /// Log a one-line summary plus a warning per slow operation.
    pub fn summarize(&self) {
        let pool = self.pool.status();
        let total_documents: u64 = self.documents.iter().map(|entry| *entry.value()).sum();
        info!(
            target = "quire::health",
            status = self.status().as_str(),
            active_connections = pool.in_use,
            total_documents,
            tracked_queries = self.metrics.len(),
            unresolved_issues = self.ledger.unresolved(),
            "health report"
        );

        for (operation, metric) in self.metrics.slow_operations(self.settings.report_slow_query) {
            warn!(
                target = "quire::health",
                operation = %operation,
                average_ms = metric.average.as_millis() as u64,
                count = metric.count,
                "slow query"
            );
        }
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            status: self.status(),
            generated_at: OffsetDateTime::now_utc(),
            uptime_secs: self.started.elapsed().as_secs(),
            issues: self.ledger.snapshot(),
            checks: self.check_states(),
            pool: self.pool.status(),
            documents: self
                .documents
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
            metrics: self.metrics.snapshot().into_iter().collect(),
        }
    }

    /// Start one loop per check plus the collector and summarizer. All of
    /// them stop when `cancel` fires.
    pub fn spawn(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.checks.len() + 2);

        for check in &self.checks {
            let monitor = Arc::clone(self);
            let check = Arc::clone(check);
            handles.push(spawn_periodic(
                format!("health:{}", check.name()),
                check.interval(),
                cancel.clone(),
                move || {
                    let monitor = monitor.clone();
                    let check = check.clone();
                    async move {
                        monitor.run_check(check.as_ref()).await;
                    }
                },
            ));
        }

        let monitor = Arc::clone(self);
        handles.push(spawn_periodic(
            "health:collector".to_string(),
            self.settings.metrics_interval,
            cancel.clone(),
            move || {
                let monitor = monitor.clone();
                async move { monitor.collect().await }
            },
        ));

        let monitor = Arc::clone(self);
        handles.push(spawn_periodic(
            "health:summary".to_string(),
            self.settings.report_interval,
            cancel.clone(),
            move || {
                let monitor = monitor.clone();
                async move { monitor.summarize() }
            },
        ));

        info!(
            target = "quire::health",
            checks = self.checks.len(),
            "health monitor started"
        );
        handles
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::num::NonZeroU32;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::application::pool::PoolOptions;
    use crate::infra::docstore::{DocumentStore, MemoryConnector, MemoryDocumentStore};

    struct Scripted {
        interval: Duration,
        outcomes: Mutex<VecDeque<Option<HealthIssue>>>,
        runs: AtomicUsize,
    }

    impl Scripted {
        fn new(outcomes: Vec<Option<HealthIssue>>) -> Self {
            Self {
                interval: Duration::from_secs(10),
                outcomes: Mutex::new(outcomes.into()),
                runs: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HealthCheck for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn run(&self) -> Option<HealthIssue> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.outcomes.lock().unwrap().pop_front().flatten()
        }
    }

    fn settings() -> HealthSettings {
        HealthSettings {
            connectivity_interval: Duration::from_secs(30),
            pool_interval: Duration::from_secs(60),
            collections_interval: Duration::from_secs(300),
            slow_query_interval: Duration::from_secs(120),
            metrics_interval: Duration::from_secs(30),
            report_interval: Duration::from_secs(300),
            response_time_warning: Duration::from_secs(5),
            pool_usage_warning: 0.9,
            slow_query_warning: Duration::from_secs(10),
            report_slow_query: Duration::from_secs(5),
            max_issues: 100,
        }
    }

    async fn monitor_with(
        store: &MemoryDocumentStore,
        checks: Vec<Arc<dyn HealthCheck>>,
    ) -> HealthMonitor {
        let pool = ConnectionPool::connect(
            &MemoryConnector::new(store.clone()),
            PoolOptions {
                size: NonZeroU32::new(2).unwrap(),
                ping_timeout: Duration::from_secs(5),
                slow_ping: Duration::from_secs(1),
            },
        )
        .await
        .unwrap();
        HealthMonitor::new(
            settings(),
            vec!["posts".to_string(), "users".to_string()],
            pool,
            Arc::new(QueryMetricsTracker::new()),
            checks,
        )
    }

    #[tokio::test]
    async fn healthy_run_resolves_previous_issue() {
        let check = Arc::new(Scripted::new(vec![
            Some(HealthIssue::new("connectivity", Severity::Critical, "down")),
            None,
        ]));
        let monitor = monitor_with(&MemoryDocumentStore::new(), vec![check.clone()]).await;

        let issue = monitor.run_check(check.as_ref()).await.unwrap();
        assert_eq!(issue.check.as_deref(), Some("scripted"));
        assert_eq!(monitor.status(), HealthStatus::Critical);

        assert!(monitor.run_check(check.as_ref()).await.is_none());
        assert_eq!(monitor.status(), HealthStatus::Healthy);

        let states = monitor.check_states();
        assert_eq!(states[0].runs, 2);
        assert_eq!(states[0].phase, CheckPhase::Idle);
        assert_eq!(states[0].last_outcome, Some(CheckOutcome::Healthy));
        assert!(monitor.issues()[0].resolved);
    }

    #[tokio::test]
    async fn manual_resolve_flips_the_record() {
        let monitor = monitor_with(&MemoryDocumentStore::new(), Vec::new()).await;
        monitor.record(
            HealthIssue::new("configuration", Severity::Critical, "missing").scoped("users"),
        );
        assert!(!monitor.resolve("configuration", None));
        assert!(monitor.resolve("configuration", Some("users")));
        assert_eq!(monitor.status(), HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn checks_run_on_their_interval_until_cancelled() {
        let check = Arc::new(Scripted::new(Vec::new()));
        let monitor = Arc::new(monitor_with(&MemoryDocumentStore::new(), vec![check.clone()]).await);
        let cancel = CancellationToken::new();

        let handles = monitor.spawn(&cancel);
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(check.runs.load(Ordering::SeqCst), 2);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn collector_counts_documents() {
        let store = MemoryDocumentStore::new();
        store.create_database("posts").await.unwrap();
        store.put("posts", json!({"_id": "a"})).await.unwrap();
        store.put("posts", json!({"_id": "b"})).await.unwrap();
        let monitor = monitor_with(&store, Vec::new()).await;

        monitor.collect().await;
        let report = monitor.report();
        assert_eq!(report.documents.get("posts"), Some(&2));
        assert!(!report.documents.contains_key("users"));
    }

    #[tokio::test]
    async fn report_serializes_issue_type() {
        let monitor = monitor_with(&MemoryDocumentStore::new(), Vec::new()).await;
        monitor.record(HealthIssue::new("resource", Severity::Warning, "busy"));

        let value = serde_json::to_value(monitor.report()).unwrap();
        assert_eq!(value["status"], "warning");
        assert_eq!(value["issues"][0]["type"], "resource");
        assert_eq!(value["issues"][0]["severity"], "warning");
    }
}
