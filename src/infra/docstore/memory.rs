use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::util::lock::{rw_read, rw_write};

use super::{
    BulkOutcome, Connector, DocStoreError, DocumentRevision, DocumentStore, FindQuery,
    IndexDefinition, document_id, document_rev,
};

const SOURCE: &str = "infra::docstore::memory";

#[derive(Debug, Default)]
struct Database {
    docs: BTreeMap<String, Value>,
    indexes: BTreeMap<String, IndexDefinition>,
}

#[derive(Debug, Default)]
struct Shared {
    databases: RwLock<HashMap<String, Database>>,
    outage: AtomicBool,
    ping_delay_ms: AtomicU64,
}

/// In-process document store with CouchDB-like revision semantics.
///
/// Clones share the same databases but have independent open/closed state,
/// which makes each clone behave like a separate connection handle.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new handle onto the same databases.
    pub fn handle(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every handle fail with `Unavailable` until cleared.
    pub fn simulate_outage(&self, down: bool) {
        self.shared.outage.store(down, Ordering::SeqCst);
    }

    /// Delay applied to `ping`, for exercising slow-store detection.
    pub fn set_ping_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.shared.ping_delay_ms.store(millis, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), DocStoreError> {
        if self.is_closed() {
            return Err(DocStoreError::Unavailable("handle closed".to_string()));
        }
        if self.shared.outage.load(Ordering::SeqCst) {
            return Err(DocStoreError::Unavailable(
                "simulated outage".to_string(),
            ));
        }
        Ok(())
    }

    fn with_db<T>(
        &self,
        db: &str,
        op: &'static str,
        f: impl FnOnce(&Database) -> Result<T, DocStoreError>,
    ) -> Result<T, DocStoreError> {
        self.check_available()?;
        let guard = rw_read(&self.shared.databases, SOURCE, op);
        let database = guard
            .get(db)
            .ok_or_else(|| DocStoreError::NotFound(db.to_string()))?;
        f(database)
    }

    fn with_db_mut<T>(
        &self,
        db: &str,
        op: &'static str,
        f: impl FnOnce(&mut Database) -> Result<T, DocStoreError>,
    ) -> Result<T, DocStoreError> {
        self.check_available()?;
        let mut guard = rw_write(&self.shared.databases, SOURCE, op);
        let database = guard
            .get_mut(db)
            .ok_or_else(|| DocStoreError::NotFound(db.to_string()))?;
        f(database)
    }
}

/// Insert or update one document, enforcing revision checks.
fn store_document(database: &mut Database, mut doc: Value) -> Result<DocumentRevision, DocStoreError> {
    let id = document_id(&doc)
        .ok_or_else(|| DocStoreError::Malformed("document is missing `_id`".to_string()))?
        .to_string();
    let supplied_rev = document_rev(&doc).map(str::to_string);

    let generation = match (database.docs.get(&id), supplied_rev.as_deref()) {
        (None, None) => 1,
        (None, Some(_)) => return Err(DocStoreError::Conflict(id)),
        (Some(_), None) => return Err(DocStoreError::Conflict(id)),
        (Some(existing), Some(rev)) => {
            let current = document_rev(existing).unwrap_or_default();
            if current != rev {
                return Err(DocStoreError::Conflict(id));
            }
            revision_generation(current) + 1
        }
    };

    let object = doc
        .as_object_mut()
        .ok_or_else(|| DocStoreError::Malformed("document must be a JSON object".to_string()))?;
    object.remove("_rev");
    let rev = next_revision(generation, object);
    object.insert("_rev".to_string(), Value::String(rev.clone()));

    database.docs.insert(id.clone(), doc);
    Ok(DocumentRevision { id, rev })
}

fn revision_generation(rev: &str) -> u64 {
    rev.split_once('-')
        .and_then(|(generation, _)| generation.parse().ok())
        .unwrap_or(0)
}

fn next_revision(generation: u64, body: &serde_json::Map<String, Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(generation.to_be_bytes());
    hasher.update(Value::Object(body.clone()).to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{generation}-{}", &digest[..32])
}

fn matches_selector(doc: &Value, selector: &serde_json::Map<String, Value>) -> bool {
    selector.iter().all(|(field, expected)| match expected {
        Value::Object(condition) if condition.contains_key("$exists") => {
            let wanted = condition
                .get("$exists")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            doc.get(field).is_some() == wanted
        }
        Value::Object(condition) if condition.contains_key("$eq") => {
            doc.get(field) == condition.get("$eq")
        }
        _ => doc.get(field) == Some(expected),
    })
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, db: &str, id: &str) -> Result<Option<Value>, DocStoreError> {
        self.with_db(db, "get", |database| Ok(database.docs.get(id).cloned()))
    }

    async fn put(&self, db: &str, doc: Value) -> Result<DocumentRevision, DocStoreError> {
        self.with_db_mut(db, "put", |database| store_document(database, doc))
    }

    async fn delete(&self, db: &str, id: &str, rev: &str) -> Result<(), DocStoreError> {
        self.with_db_mut(db, "delete", |database| {
            let current = database
                .docs
                .get(id)
                .ok_or_else(|| DocStoreError::NotFound(id.to_string()))?;
            if document_rev(current) != Some(rev) {
                return Err(DocStoreError::Conflict(id.to_string()));
            }
            database.docs.remove(id);
            Ok(())
        })
    }

    async fn find(&self, db: &str, query: &FindQuery) -> Result<Vec<Value>, DocStoreError> {
        self.with_db(db, "find", |database| {
            let limit = query.limit.unwrap_or(usize::MAX);
            Ok(database
                .docs
                .values()
                .filter(|doc| matches_selector(doc, &query.selector))
                .take(limit)
                .cloned()
                .collect())
        })
    }

    async fn bulk_insert(
        &self,
        db: &str,
        docs: Vec<Value>,
    ) -> Result<Vec<BulkOutcome>, DocStoreError> {
        self.with_db_mut(db, "bulk_insert", |database| {
            Ok(docs
                .into_iter()
                .map(|doc| {
                    let id = document_id(&doc).map(str::to_string);
                    match store_document(database, doc) {
                        Ok(revision) => BulkOutcome::Stored(revision),
                        Err(err) => BulkOutcome::Failed {
                            id,
                            reason: err.to_string(),
                        },
                    }
                })
                .collect())
        })
    }

    async fn all_docs(&self, db: &str) -> Result<Vec<Value>, DocStoreError> {
        self.with_db(db, "all_docs", |database| {
            Ok(database.docs.values().cloned().collect())
        })
    }

    async fn count_docs(&self, db: &str) -> Result<u64, DocStoreError> {
        self.with_db(db, "count_docs", |database| Ok(database.docs.len() as u64))
    }

    async fn database_exists(&self, db: &str) -> Result<bool, DocStoreError> {
        self.check_available()?;
        Ok(rw_read(&self.shared.databases, SOURCE, "database_exists").contains_key(db))
    }

    async fn create_database(&self, db: &str) -> Result<(), DocStoreError> {
        self.check_available()?;
        let mut guard = rw_write(&self.shared.databases, SOURCE, "create_database");
        if guard.contains_key(db) {
            return Err(DocStoreError::Conflict(db.to_string()));
        }
        guard.insert(db.to_string(), Database::default());
        Ok(())
    }

    async fn destroy_database(&self, db: &str) -> Result<(), DocStoreError> {
        self.check_available()?;
        rw_write(&self.shared.databases, SOURCE, "destroy_database")
            .remove(db)
            .map(|_| ())
            .ok_or_else(|| DocStoreError::NotFound(db.to_string()))
    }

    async fn create_index(&self, db: &str, index: &IndexDefinition) -> Result<(), DocStoreError> {
        self.with_db_mut(db, "create_index", |database| {
            database.indexes.insert(index.name.clone(), index.clone());
            Ok(())
        })
    }

    async fn list_indexes(&self, db: &str) -> Result<Vec<IndexDefinition>, DocStoreError> {
        self.with_db(db, "list_indexes", |database| {
            Ok(database.indexes.values().cloned().collect())
        })
    }

    async fn delete_index(&self, db: &str, name: &str) -> Result<(), DocStoreError> {
        self.with_db_mut(db, "delete_index", |database| {
            database
                .indexes
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| DocStoreError::NotFound(name.to_string()))
        })
    }

    async fn ping(&self) -> Result<(), DocStoreError> {
        let delay = self.shared.ping_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_available()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Hands out handles onto one shared [`MemoryDocumentStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    store: MemoryDocumentStore,
}

impl MemoryConnector {
    pub fn new(store: MemoryDocumentStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn DocumentStore>, DocStoreError> {
        self.store.check_available()?;
        Ok(Arc::new(self.store.handle()))
    }
}
