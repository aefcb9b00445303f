//! Versioned, idempotent change-sets against the document store.
//!
//! Applied versions are recorded as documents in the `migrations` database,
//! keyed by version, so a restart never re-applies completed work. Versions
//! apply in ascending order and the first failure stops the run.

mod builtin;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::infra::docstore::{DocStoreError, DocumentStore, document_rev};
use crate::infra::kv::{KeyValueStore, StoreError, keys};

pub use builtin::{IndexMigration, builtin};

pub const MIGRATIONS_DB: &str = "migrations";

const LOCK_KEY: &str = "migration_lock";
const LOCK_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to prepare the migrations database")]
    Setup(#[source] DocStoreError),
    #[error("failed to read applied migrations")]
    Read(#[source] DocStoreError),
    #[error("migration {version} failed")]
    Apply {
        version: String,
        #[source]
        source: DocStoreError,
    },
    #[error("failed to record migration {version}")]
    Record {
        version: String,
        #[source]
        source: DocStoreError,
    },
    #[error("rollback of migration {version} failed")]
    Rollback {
        version: String,
        #[source]
        source: DocStoreError,
    },
    #[error("migration definition not found for version {0}")]
    UnknownVersion(String),
    #[error("another runner holds the migration lock")]
    Locked,
    #[error("migration lock unavailable")]
    Lease(#[source] StoreError),
}

#[async_trait]
pub trait Migration: Send + Sync {
    /// Sort key; versions apply in ascending lexical order.
    fn version(&self) -> &str;

    fn description(&self) -> &str;

    async fn up(&self, store: &dyn DocumentStore) -> Result<(), DocStoreError>;

    async fn down(&self, store: &dyn DocumentStore) -> Result<(), DocStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub applied_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub version: String,
    pub description: String,
    pub applied: bool,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub applied_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationOutcome {
    pub applied: Vec<String>,
    pub skipped: usize,
}

struct StoredRecord {
    record: MigrationRecord,
    rev: String,
}

pub struct MigrationRunner {
    store: Arc<dyn DocumentStore>,
    migrations: Vec<Arc<dyn Migration>>,
    lease: Option<Arc<dyn KeyValueStore>>,
}

impl std::fmt::Debug for MigrationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("migrations", &self.migrations.len())
            .field("leased", &self.lease.is_some())
            .finish()
    }
}

impl MigrationRunner {
    pub fn new(store: Arc<dyn DocumentStore>, mut migrations: Vec<Arc<dyn Migration>>) -> Self {
        migrations.sort_by(|a, b| a.version().cmp(b.version()));
        Self {
            store,
            migrations,
            lease: None,
        }
    }

    /// Serialize `migrate` and `rollback` across processes through a lease
    /// key in the shared store.
    pub fn with_lease(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.lease = Some(store);
        self
    }

    pub async fn migrate(&self) -> Result<MigrationOutcome, MigrationError> {
        self.acquire_lease().await?;
        let result = self.migrate_locked().await;
        self.release_lease().await;
        result
    }

    /// `migrate` as run by `serve`. A lease held by another instance means
    /// that instance owns the run, so this one skips and returns `None`. An
    /// unreachable lease store only loses cross-process exclusion, so the
    /// run proceeds without it.
    pub async fn migrate_at_startup(&self) -> Result<Option<MigrationOutcome>, MigrationError> {
        match self.migrate().await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(MigrationError::Locked) => {
                warn!(
                    target = "quire::migrations",
                    "migration lock held by another instance; skipping startup migrations"
                );
                Ok(None)
            }
            Err(MigrationError::Lease(err)) => {
                warn!(
                    target = "quire::migrations",
                    error = %err,
                    "migration lock unavailable; migrating without it"
                );
                self.migrate_locked().await.map(Some)
            }
            Err(other) => Err(other),
        }
    }

    async fn migrate_locked(&self) -> Result<MigrationOutcome, MigrationError> {
        self.ensure_database().await?;
        let applied = self.applied().await?;

        let mut outcome = MigrationOutcome::default();
        for migration in &self.migrations {
            let version = migration.version();
            if applied.contains_key(version) {
                outcome.skipped += 1;
                continue;
            }

            info!(
                target = "quire::migrations",
                version,
                description = migration.description(),
                "applying migration"
            );
            let started = Instant::now();
            migration
                .up(self.store.as_ref())
                .await
                .map_err(|source| MigrationError::Apply {
                    version: version.to_string(),
                    source,
                })?;
            self.record(migration.as_ref()).await?;

            counter!("quire_migrations_applied_total").increment(1);
            info!(
                target = "quire::migrations",
                version,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "migration completed"
            );
            outcome.applied.push(version.to_string());
        }

        info!(
            target = "quire::migrations",
            applied = outcome.applied.len(),
            skipped = outcome.skipped,
            "migrations up to date"
        );
        Ok(outcome)
    }

    /// Undo the most recently applied migration, by recorded timestamp.
    /// Returns its version, or `None` when nothing is applied.
    pub async fn rollback(&self) -> Result<Option<String>, MigrationError> {
        self.acquire_lease().await?;
        let result = self.rollback_locked().await;
        self.release_lease().await;
        result
    }

    async fn rollback_locked(&self) -> Result<Option<String>, MigrationError> {
        if !self
            .store
            .database_exists(MIGRATIONS_DB)
            .await
            .map_err(MigrationError::Read)?
        {
            return Ok(None);
        }

        let applied = self.applied().await?;
        let Some(latest) = applied.values().max_by(|a, b| {
            (a.record.applied_at, &a.record.version).cmp(&(b.record.applied_at, &b.record.version))
        }) else {
            info!(target = "quire::migrations", "no migrations to roll back");
            return Ok(None);
        };

        let version = latest.record.version.clone();
        let migration = self
            .migrations
            .iter()
            .find(|migration| migration.version() == version)
            .ok_or_else(|| MigrationError::UnknownVersion(version.clone()))?;

        info!(
            target = "quire::migrations",
            version = %version,
            description = migration.description(),
            "rolling back migration"
        );
        migration
            .down(self.store.as_ref())
            .await
            .map_err(|source| MigrationError::Rollback {
                version: version.clone(),
                source,
            })?;
        self.store
            .delete(MIGRATIONS_DB, &version, &latest.rev)
            .await
            .map_err(|source| MigrationError::Record {
                version: version.clone(),
                source,
            })?;

        info!(target = "quire::migrations", version = %version, "migration rolled back");
        Ok(Some(version))
    }

    /// Every known migration in apply order, with its applied timestamp.
    pub async fn status(&self) -> Result<Vec<MigrationStatus>, MigrationError> {
        self.ensure_database().await?;
        let applied = self.applied().await?;

        Ok(self
            .migrations
            .iter()
            .map(|migration| {
                let record = applied.get(migration.version());
                MigrationStatus {
                    version: migration.version().to_string(),
                    description: migration.description().to_string(),
                    applied: record.is_some(),
                    applied_at: record.map(|stored| stored.record.applied_at),
                }
            })
            .collect())
    }

    async fn ensure_database(&self) -> Result<(), MigrationError> {
        let exists = self
            .store
            .database_exists(MIGRATIONS_DB)
            .await
            .map_err(MigrationError::Setup)?;
        if !exists {
            self.store
                .create_database(MIGRATIONS_DB)
                .await
                .map_err(MigrationError::Setup)?;
            info!(target = "quire::migrations", "created migrations database");
        }
        Ok(())
    }

    async fn applied(&self) -> Result<HashMap<String, StoredRecord>, MigrationError> {
        let docs = self
            .store
            .all_docs(MIGRATIONS_DB)
            .await
            .map_err(MigrationError::Read)?;

        let mut applied = HashMap::with_capacity(docs.len());
        for doc in docs {
            let rev = document_rev(&doc).unwrap_or_default().to_string();
            match serde_json::from_value::<MigrationRecord>(doc) {
                Ok(record) => {
                    applied.insert(record.version.clone(), StoredRecord { record, rev });
                }
                Err(err) => {
                    warn!(
                        target = "quire::migrations",
                        error = %err,
                        "skipping unreadable migration record"
                    );
                }
            }
        }
        Ok(applied)
    }

    async fn record(&self, migration: &dyn Migration) -> Result<(), MigrationError> {
        let record = MigrationRecord {
            version: migration.version().to_string(),
            description: migration.description().to_string(),
            applied_at: OffsetDateTime::now_utc(),
        };
        let mut doc = serde_json::to_value(&record).map_err(|err| MigrationError::Record {
            version: record.version.clone(),
            source: DocStoreError::Malformed(err.to_string()),
        })?;
        if let Value::Object(fields) = &mut doc {
            fields.insert("_id".to_string(), Value::String(record.version.clone()));
        }

        self.store
            .put(MIGRATIONS_DB, doc)
            .await
            .map(|_| ())
            .map_err(|source| MigrationError::Record {
                version: record.version,
                source,
            })
    }

    async fn acquire_lease(&self) -> Result<(), MigrationError> {
        let Some(store) = self.lease.as_ref() else {
            return Ok(());
        };
        let holders = store
            .increment_with_ttl(&keys::app_state(LOCK_KEY), LOCK_TTL)
            .await
            .map_err(MigrationError::Lease)?;
        if holders == 1 {
            Ok(())
        } else {
            Err(MigrationError::Locked)
        }
    }

    async fn release_lease(&self) {
        let Some(store) = self.lease.as_ref() else {
            return;
        };
        if let Err(err) = store.delete(&keys::app_state(LOCK_KEY)).await {
            warn!(
                target = "quire::migrations",
                error = %err,
                "failed to release migration lock; it expires on its own"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::infra::docstore::MemoryDocumentStore;
    use crate::infra::kv::MemoryStore;

    struct Step {
        version: &'static str,
        fail_up: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Migration for Step {
        fn version(&self) -> &str {
            self.version
        }

        fn description(&self) -> &str {
            "test step"
        }

        async fn up(&self, _store: &dyn DocumentStore) -> Result<(), DocStoreError> {
            if self.fail_up {
                return Err(DocStoreError::Unavailable("boom".to_string()));
            }
            self.log.lock().unwrap().push(format!("up {}", self.version));
            Ok(())
        }

        async fn down(&self, _store: &dyn DocumentStore) -> Result<(), DocStoreError> {
            self.log.lock().unwrap().push(format!("down {}", self.version));
            Ok(())
        }
    }

    fn steps(
        specs: &[(&'static str, bool)],
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Vec<Arc<dyn Migration>> {
        specs
            .iter()
            .map(|&(version, fail_up)| {
                Arc::new(Step {
                    version,
                    fail_up,
                    log: log.clone(),
                }) as Arc<dyn Migration>
            })
            .collect()
    }

    #[tokio::test]
    async fn applies_in_version_order_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::new(MemoryDocumentStore::new());
        let runner = MigrationRunner::new(store, steps(&[("002", false), ("001", false)], &log));

        let first = runner.migrate().await.unwrap();
        assert_eq!(first.applied, ["001", "002"]);
        let second = runner.migrate().await.unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.skipped, 2);

        assert_eq!(*log.lock().unwrap(), ["up 001", "up 002"]);
    }

    #[tokio::test]
    async fn failure_stops_later_versions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::new(MemoryDocumentStore::new());
        let runner = MigrationRunner::new(
            store,
            steps(&[("001", false), ("002", true), ("003", false)], &log),
        );

        let err = runner.migrate().await.unwrap_err();
        assert!(matches!(err, MigrationError::Apply { ref version, .. } if version == "002"));

        let status = runner.status().await.unwrap();
        let applied: Vec<_> = status.iter().map(|entry| entry.applied).collect();
        assert_eq!(applied, [true, false, false]);
        assert_eq!(*log.lock().unwrap(), ["up 001"]);
    }

    #[tokio::test]
    async fn rollback_undoes_latest_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::new(MemoryDocumentStore::new());
        let runner = MigrationRunner::new(store, steps(&[("001", false), ("002", false)], &log));

        assert_eq!(runner.rollback().await.unwrap(), None);
        runner.migrate().await.unwrap();
        assert_eq!(runner.rollback().await.unwrap().as_deref(), Some("002"));

        let status = runner.status().await.unwrap();
        assert!(status[0].applied);
        assert!(!status[1].applied);
        assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("down 002"));
    }

    #[tokio::test]
    async fn held_lease_refuses_to_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let kv = Arc::new(MemoryStore::new());
        kv.increment_with_ttl(&keys::app_state(LOCK_KEY), LOCK_TTL)
            .await
            .unwrap();

        let runner = MigrationRunner::new(
            Arc::new(MemoryDocumentStore::new()),
            steps(&[("001", false)], &log),
        )
        .with_lease(kv.clone());
        assert!(matches!(runner.migrate().await, Err(MigrationError::Locked)));
        assert!(log.lock().unwrap().is_empty());

        kv.delete(&keys::app_state(LOCK_KEY)).await.unwrap();
        runner.migrate().await.unwrap();
        assert!(!kv.exists(&keys::app_state(LOCK_KEY)).await.unwrap());
    }
}
