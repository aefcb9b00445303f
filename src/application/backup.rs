//! Snapshots of document collections to flat files.
//!
//! A run writes `backup_<stamp>/` under the configured directory with one
//! `<collection>.json` per collection and a `metadata.json` describing the
//! run. Restores are destructive: each collection is dropped, recreated and
//! bulk-loaded with fresh revisions.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::application::tasks::spawn_periodic;
use crate::config::BackupSettings;
use crate::infra::docstore::{BulkOutcome, DocStoreError, DocumentStore};
use crate::util::bytes::format_bytes;
use crate::util::time::{backup_stamp, duration_ms};

pub const METADATA_FILE: &str = "metadata.json";
const DIR_PREFIX: &str = "backup_";
const FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup i/o failed for {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid backup data in {}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode backup data")]
    Encode(#[source] serde_json::Error),
    #[error("failed to back up collection {collection}")]
    Snapshot {
        collection: String,
        #[source]
        source: DocStoreError,
    },
    #[error("failed to restore collection {collection}")]
    Restore {
        collection: String,
        #[source]
        source: DocStoreError,
    },
    #[error("backup not found: {}", .0.display())]
    NotFound(PathBuf),
}

impl BackupError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub collections: Vec<String>,
    pub size: u64,
    pub checksum: String,
    pub version: String,
    pub doc_counts: BTreeMap<String, u64>,
    pub duration_ms: u64,
    pub status: BackupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Directory holding the run; filled in when read back from disk.
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub collection: String,
    pub restored: u64,
    pub failed: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CollectionSnapshot {
    database: String,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    documents: Vec<Value>,
    count: u64,
}

pub struct BackupCoordinator {
    store: Arc<dyn DocumentStore>,
    directory: PathBuf,
    collections: Vec<String>,
    retention_days: u32,
    interval: Duration,
}

impl std::fmt::Debug for BackupCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupCoordinator")
            .field("directory", &self.directory)
            .field("collections", &self.collections)
            .field("retention_days", &self.retention_days)
            .finish()
    }
}

impl BackupCoordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        settings: &BackupSettings,
        collections: Vec<String>,
    ) -> Self {
        Self {
            store,
            directory: settings.directory.clone(),
            collections,
            retention_days: settings.retention_days,
            interval: settings.interval,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Snapshot every configured collection. A collection failure stops the
    /// run; files already written stay on disk and the metadata records the
    /// failure.
    pub async fn create_backup(&self) -> Result<BackupMetadata, BackupError> {
        let started = Instant::now();
        let timestamp = OffsetDateTime::now_utc();
        let path = self.allocate_directory(timestamp).await?;
        info!(
            target = "quire::backup",
            path = %path.display(),
            "starting backup"
        );

        let mut metadata = BackupMetadata {
            timestamp,
            collections: self.collections.clone(),
            size: 0,
            checksum: String::new(),
            version: FORMAT_VERSION.to_string(),
            doc_counts: BTreeMap::new(),
            duration_ms: 0,
            status: BackupStatus::Running,
            error: None,
            path: path.clone(),
        };

        let mut hasher = Sha256::new();
        let mut failure = None;
        for collection in &self.collections {
            match self.snapshot_collection(collection, &path).await {
                Ok(Some(written)) => {
                    hasher.update(&written.payload);
                    metadata.size += written.payload.len() as u64;
                    metadata.doc_counts.insert(collection.clone(), written.count);
                    info!(
                        target = "quire::backup",
                        collection = %collection,
                        documents = written.count,
                        size = %format_bytes(written.payload.len() as u64),
                        "collection backed up"
                    );
                }
                Ok(None) => {
                    warn!(
                        target = "quire::backup",
                        collection = %collection,
                        "collection does not exist, skipping"
                    );
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        metadata.checksum = hex::encode(hasher.finalize());
        metadata.duration_ms = duration_ms(started.elapsed());
        metadata.status = if failure.is_some() {
            BackupStatus::Failed
        } else {
            BackupStatus::Completed
        };
        metadata.error = failure.as_ref().map(error_chain);
        write_json(&path.join(METADATA_FILE), &metadata).await?;

        let outcome = if failure.is_some() { "failed" } else { "completed" };
        counter!("quire_backups_total", "status" => outcome).increment(1);

        if let Some(err) = failure {
            error!(
                target = "quire::backup",
                path = %path.display(),
                error = %metadata.error.as_deref().unwrap_or_default(),
                "backup failed"
            );
            return Err(err);
        }

        info!(
            target = "quire::backup",
            path = %path.display(),
            size = %format_bytes(metadata.size),
            documents = metadata.doc_counts.values().sum::<u64>(),
            duration_ms = metadata.duration_ms,
            "backup completed"
        );
        Ok(metadata)
    }

    async fn allocate_directory(&self, at: OffsetDateTime) -> Result<PathBuf, BackupError> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|err| BackupError::io(&self.directory, err))?;

        let stamp = backup_stamp(at);
        let mut attempt = 1;
        loop {
            let name = if attempt == 1 {
                format!("{DIR_PREFIX}{stamp}")
            } else {
                format!("{DIR_PREFIX}{stamp}_{attempt}")
            };
            let path = self.directory.join(name);
            match tokio::fs::create_dir(&path).await {
                Ok(()) => return Ok(path),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(err) => return Err(BackupError::io(&path, err)),
            }
        }
    }

    async fn snapshot_collection(
        &self,
        collection: &str,
        directory: &Path,
    ) -> Result<Option<WrittenSnapshot>, BackupError> {
        let snapshot_error = |source| BackupError::Snapshot {
            collection: collection.to_string(),
            source,
        };

        if !self
            .store
            .database_exists(collection)
            .await
            .map_err(snapshot_error)?
        {
            return Ok(None);
        }

        let documents = self
            .store
            .all_docs(collection)
            .await
            .map_err(snapshot_error)?;
        let count = documents.len() as u64;
        let snapshot = CollectionSnapshot {
            database: collection.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            documents,
            count,
        };

        let payload = write_json(&directory.join(format!("{collection}.json")), &snapshot).await?;
        Ok(Some(WrittenSnapshot { payload, count }))
    }

    /// Replace every collection listed in the backup's metadata with its
    /// snapshot. Per-document failures are counted, not fatal.
    pub async fn restore_backup(&self, path: &Path) -> Result<Vec<RestoreSummary>, BackupError> {
        let path = self.resolve(path);
        let metadata = read_metadata(&path).await?;
        info!(
            target = "quire::backup",
            path = %path.display(),
            collections = metadata.collections.len(),
            "starting restore"
        );

        let mut summaries = Vec::with_capacity(metadata.collections.len());
        for collection in &metadata.collections {
            let file = path.join(format!("{collection}.json"));
            let raw = match tokio::fs::read(&file).await {
                Ok(raw) => raw,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    info!(
                        target = "quire::backup",
                        collection = %collection,
                        "no snapshot file, skipping"
                    );
                    continue;
                }
                Err(err) => return Err(BackupError::io(&file, err)),
            };
            let snapshot: CollectionSnapshot =
                serde_json::from_slice(&raw).map_err(|source| BackupError::Decode {
                    path: file.clone(),
                    source,
                })?;

            let summary = self.restore_collection(collection, snapshot.documents).await?;
            if summary.failed > 0 {
                warn!(
                    target = "quire::backup",
                    collection = %collection,
                    failed = summary.failed,
                    restored = summary.restored,
                    "some documents failed to restore"
                );
            }
            summaries.push(summary);
        }

        info!(
            target = "quire::backup",
            path = %path.display(),
            restored = summaries.iter().map(|summary| summary.restored).sum::<u64>(),
            "restore completed"
        );
        Ok(summaries)
    }

    async fn restore_collection(
        &self,
        collection: &str,
        documents: Vec<Value>,
    ) -> Result<RestoreSummary, BackupError> {
        let restore_error = |source| BackupError::Restore {
            collection: collection.to_string(),
            source,
        };

        if self
            .store
            .database_exists(collection)
            .await
            .map_err(restore_error)?
        {
            self.store
                .destroy_database(collection)
                .await
                .map_err(restore_error)?;
        }
        self.store
            .create_database(collection)
            .await
            .map_err(restore_error)?;

        let mut summary = RestoreSummary {
            collection: collection.to_string(),
            restored: 0,
            failed: 0,
        };
        if documents.is_empty() {
            return Ok(summary);
        }

        let documents = documents
            .into_iter()
            .map(|mut doc| {
                if let Value::Object(fields) = &mut doc {
                    fields.remove("_rev");
                }
                doc
            })
            .collect();
        let outcomes = self
            .store
            .bulk_insert(collection, documents)
            .await
            .map_err(restore_error)?;

        for outcome in outcomes {
            match outcome {
                BulkOutcome::Stored(_) => summary.restored += 1,
                BulkOutcome::Failed { id, reason } => {
                    summary.failed += 1;
                    warn!(
                        target = "quire::backup",
                        collection = %collection,
                        doc_id = id.as_deref().unwrap_or("<none>"),
                        reason = %reason,
                        "document restore failed"
                    );
                }
            }
        }
        Ok(summary)
    }

    /// Remove runs whose metadata timestamp is older than `retention_days`.
    /// Runs with unreadable metadata are left alone.
    pub async fn cleanup_old_backups(&self, retention_days: u32) -> Result<usize, BackupError> {
        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(i64::from(retention_days));
        let mut removed = 0;

        for metadata in self.scan().await? {
            if metadata.timestamp >= cutoff {
                continue;
            }
            match tokio::fs::remove_dir_all(&metadata.path).await {
                Ok(()) => {
                    removed += 1;
                    info!(
                        target = "quire::backup",
                        path = %metadata.path.display(),
                        "removed old backup"
                    );
                }
                Err(err) => {
                    warn!(
                        target = "quire::backup",
                        path = %metadata.path.display(),
                        error = %err,
                        "failed to remove old backup"
                    );
                }
            }
        }

        info!(
            target = "quire::backup",
            retention_days,
            removed,
            "backup cleanup completed"
        );
        Ok(removed)
    }

    /// Every readable run, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupMetadata>, BackupError> {
        let mut backups = self.scan().await?;
        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(backups)
    }

    async fn scan(&self) -> Result<Vec<BackupMetadata>, BackupError> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(BackupError::io(&self.directory, err)),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| BackupError::io(&self.directory, err))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|kind| kind.is_dir())
                .unwrap_or(false);
            if !is_dir || !entry.file_name().to_string_lossy().starts_with(DIR_PREFIX) {
                continue;
            }

            match read_metadata(&entry.path()).await {
                Ok(metadata) => found.push(metadata),
                Err(err) => {
                    warn!(
                        target = "quire::backup",
                        path = %entry.path().display(),
                        error = %err,
                        "skipping backup with unreadable metadata"
                    );
                }
            }
        }
        Ok(found)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() || path.exists() {
            path.to_path_buf()
        } else {
            self.directory.join(path)
        }
    }

    /// Create a backup then prune old ones on every interval until cancelled.
    pub fn spawn(self: &Arc<Self>, cancel: &CancellationToken) -> JoinHandle<()> {
        info!(
            target = "quire::backup",
            interval_secs = self.interval.as_secs(),
            retention_days = self.retention_days,
            "scheduled backups started"
        );
        let coordinator = Arc::clone(self);
        spawn_periodic(
            "backup".to_string(),
            self.interval,
            cancel.clone(),
            move || {
                let coordinator = coordinator.clone();
                async move {
                    if let Err(err) = coordinator.create_backup().await {
                        error!(
                            target = "quire::backup",
                            error = %error_chain(&err),
                            "scheduled backup failed"
                        );
                    }
                    if let Err(err) = coordinator
                        .cleanup_old_backups(coordinator.retention_days)
                        .await
                    {
                        error!(
                            target = "quire::backup",
                            error = %error_chain(&err),
                            "backup cleanup failed"
                        );
                    }
                }
            },
        )
    }
}

struct WrittenSnapshot {
    payload: Vec<u8>,
    count: u64,
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<Vec<u8>, BackupError> {
    let payload = serde_json::to_vec_pretty(value).map_err(BackupError::Encode)?;
    tokio::fs::write(path, &payload)
        .await
        .map_err(|err| BackupError::io(path, err))?;
    Ok(payload)
}

async fn read_metadata(directory: &Path) -> Result<BackupMetadata, BackupError> {
    let file = directory.join(METADATA_FILE);
    let raw = match tokio::fs::read(&file).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(BackupError::NotFound(directory.to_path_buf()));
        }
        Err(err) => return Err(BackupError::io(&file, err)),
    };
    let mut metadata: BackupMetadata =
        serde_json::from_slice(&raw).map_err(|source| BackupError::Decode {
            path: file.clone(),
            source,
        })?;
    metadata.path = directory.to_path_buf();
    Ok(metadata)
}

fn error_chain(err: &BackupError) -> String {
    let mut message = err.to_string();
    let mut source = StdError::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
