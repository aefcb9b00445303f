//! Document-store adapters.
//!
//! The CMS keeps posts, users, contacts, and migration records as JSON
//! documents in a CouchDB-compatible store. The coordination layer only needs
//! the narrow surface in [`DocumentStore`]; CRUD semantics for individual
//! collections live with their handlers.

mod couch;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use couch::{CouchConnector, CouchDbStore};
pub use memory::{MemoryConnector, MemoryDocumentStore};

#[derive(Debug, Error)]
pub enum DocStoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),
    #[error("document store request timed out")]
    Timeout,
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("revision conflict on `{0}`")]
    Conflict(String),
    #[error("malformed document data: {0}")]
    Malformed(String),
    #[error("document store rejected request ({status}): {reason}")]
    Request { status: u16, reason: String },
}

impl DocStoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DocStoreError::Unavailable(_) | DocStoreError::Timeout)
    }
}

/// Identity of a stored document revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRevision {
    pub id: String,
    pub rev: String,
}

/// Mango-style query: an equality selector plus an optional index hint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindQuery {
    pub selector: serde_json::Map<String, Value>,
    pub use_index: Option<String>,
    pub limit: Option<usize>,
}

impl FindQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.selector.insert(name.into(), value.into());
        self
    }

    pub fn use_index(mut self, index: impl Into<String>) -> Self {
        self.use_index = Some(index.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A named JSON index over one or more fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub fields: Vec<String>,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            fields: fields.iter().map(|field| (*field).to_string()).collect(),
        }
    }
}

/// Per-document outcome of a bulk insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkOutcome {
    Stored(DocumentRevision),
    Failed { id: Option<String>, reason: String },
}

impl BulkOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, BulkOutcome::Stored(_))
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, db: &str, id: &str) -> Result<Option<Value>, DocStoreError>;

    /// Create or update a document. The body must carry `_id`; updates must
    /// carry the current `_rev` or fail with [`DocStoreError::Conflict`].
    async fn put(&self, db: &str, doc: Value) -> Result<DocumentRevision, DocStoreError>;

    async fn delete(&self, db: &str, id: &str, rev: &str) -> Result<(), DocStoreError>;

    async fn find(&self, db: &str, query: &FindQuery) -> Result<Vec<Value>, DocStoreError>;

    async fn bulk_insert(
        &self,
        db: &str,
        docs: Vec<Value>,
    ) -> Result<Vec<BulkOutcome>, DocStoreError>;

    /// Every document in the database, including `_id`/`_rev` metadata.
    async fn all_docs(&self, db: &str) -> Result<Vec<Value>, DocStoreError>;

    /// Number of live documents, read from database metadata.
    async fn count_docs(&self, db: &str) -> Result<u64, DocStoreError>;

    async fn database_exists(&self, db: &str) -> Result<bool, DocStoreError>;

    async fn create_database(&self, db: &str) -> Result<(), DocStoreError>;

    async fn destroy_database(&self, db: &str) -> Result<(), DocStoreError>;

    async fn create_index(&self, db: &str, index: &IndexDefinition) -> Result<(), DocStoreError>;

    async fn list_indexes(&self, db: &str) -> Result<Vec<IndexDefinition>, DocStoreError>;

    async fn delete_index(&self, db: &str, name: &str) -> Result<(), DocStoreError>;

    async fn ping(&self) -> Result<(), DocStoreError>;

    /// Release resources held by this handle. Further calls may fail.
    async fn close(&self);

    fn backend(&self) -> &'static str;
}

/// Creates document-store handles for the connection pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn DocumentStore>, DocStoreError>;
}

/// Read `_id` from a document body.
pub(crate) fn document_id(doc: &Value) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}

/// Read `_rev` from a document body.
pub(crate) fn document_rev(doc: &Value) -> Option<&str> {
    doc.get("_rev").and_then(Value::as_str)
}
