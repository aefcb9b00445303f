use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{
    BulkOutcome, Connector, DocStoreError, DocumentRevision, DocumentStore, FindQuery,
    IndexDefinition, document_id,
};

const SOURCE: &str = "infra::docstore::couch";

/// CouchDB client over its HTTP API. Credentials may be embedded in the URL.
#[derive(Debug, Clone)]
pub struct CouchDbStore {
    client: Client,
    base: Url,
}

#[derive(Debug, Deserialize)]
struct WriteReply {
    id: String,
    rev: String,
}

#[derive(Debug, Deserialize)]
struct FindReply {
    docs: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct AllDocsReply {
    rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    doc: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct DatabaseInfo {
    doc_count: u64,
}

#[derive(Debug, Deserialize)]
struct BulkReply {
    id: Option<String>,
    rev: Option<String>,
    error: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IndexListReply {
    indexes: Vec<IndexReply>,
}

#[derive(Debug, Deserialize)]
struct IndexReply {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    def: IndexDef,
}

#[derive(Debug, Deserialize)]
struct IndexDef {
    fields: Vec<serde_json::Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    error: Option<String>,
    reason: Option<String>,
}

impl CouchDbStore {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, DocStoreError> {
        let base = Url::parse(url)
            .map_err(|err| DocStoreError::Malformed(format!("invalid url `{url}`: {err}")))?;
        if base.cannot_be_a_base() {
            return Err(DocStoreError::Malformed(format!(
                "`{url}` cannot be used as a base url"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| DocStoreError::Unavailable(err.to_string()))?;
        Ok(Self { client, base })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, DocStoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| DocStoreError::Malformed("base url has no path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, DocStoreError> {
        Ok(self.client.request(method, self.url(segments)?))
    }

    fn request_with_query(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<RequestBuilder, DocStoreError> {
        let mut url = self.url(segments)?;
        url.query_pairs_mut().extend_pairs(query);
        Ok(self.client.request(method, url))
    }

    async fn send(&self, builder: RequestBuilder, subject: &str) -> Result<Response, DocStoreError> {
        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(status_error(status, subject, response).await)
    }

    async fn json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, DocStoreError> {
        response
            .json::<T>()
            .await
            .map_err(|err| DocStoreError::Malformed(err.to_string()))
    }
}

async fn status_error(status: StatusCode, subject: &str, response: Response) -> DocStoreError {
    let reply = response.json::<ErrorReply>().await.ok();
    let reason = reply
        .and_then(|reply| reply.reason.or(reply.error))
        .unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::NOT_FOUND => DocStoreError::NotFound(subject.to_string()),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            DocStoreError::Conflict(subject.to_string())
        }
        status if status.is_server_error() => DocStoreError::Unavailable(reason),
        status => DocStoreError::Request {
            status: status.as_u16(),
            reason,
        },
    }
}

fn map_transport_error(err: reqwest::Error) -> DocStoreError {
    if err.is_timeout() {
        DocStoreError::Timeout
    } else if err.is_decode() {
        DocStoreError::Malformed(err.to_string())
    } else {
        DocStoreError::Unavailable(err.to_string())
    }
}

fn index_from_reply(reply: IndexReply) -> Option<IndexDefinition> {
    // The primary `_all_docs` index is special and never user-managed.
    if reply.kind != "json" {
        return None;
    }
    let fields = reply
        .def
        .fields
        .into_iter()
        .filter_map(|field| field.keys().next().cloned())
        .collect();
    Some(IndexDefinition {
        name: reply.name,
        fields,
    })
}

#[async_trait]
impl DocumentStore for CouchDbStore {
    async fn get(&self, db: &str, id: &str) -> Result<Option<Value>, DocStoreError> {
        let request = self.request(Method::GET, &[db, id])?;
        match self.send(request, id).await {
            Ok(response) => Self::json(response).await.map(Some),
            Err(DocStoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn put(&self, db: &str, doc: Value) -> Result<DocumentRevision, DocStoreError> {
        let id = document_id(&doc)
            .ok_or_else(|| DocStoreError::Malformed("document is missing `_id`".to_string()))?
            .to_string();
        let request = self.request(Method::PUT, &[db, &id])?.json(&doc);
        let reply: WriteReply = Self::json(self.send(request, &id).await?).await?;
        Ok(DocumentRevision {
            id: reply.id,
            rev: reply.rev,
        })
    }

    async fn delete(&self, db: &str, id: &str, rev: &str) -> Result<(), DocStoreError> {
        let request = self.request_with_query(Method::DELETE, &[db, id], &[("rev", rev)])?;
        self.send(request, id).await.map(|_| ())
    }

    async fn find(&self, db: &str, query: &FindQuery) -> Result<Vec<Value>, DocStoreError> {
        let mut body = json!({ "selector": Value::Object(query.selector.clone()) });
        if let Some(index) = query.use_index.as_ref() {
            body["use_index"] = Value::String(index.clone());
        }
        if let Some(limit) = query.limit {
            body["limit"] = json!(limit);
        }
        let request = self.request(Method::POST, &[db, "_find"])?.json(&body);
        let reply: FindReply = Self::json(self.send(request, db).await?).await?;
        Ok(reply.docs)
    }

    async fn bulk_insert(
        &self,
        db: &str,
        docs: Vec<Value>,
    ) -> Result<Vec<BulkOutcome>, DocStoreError> {
        let request = self
            .request(Method::POST, &[db, "_bulk_docs"])?
            .json(&json!({ "docs": docs }));
        let replies: Vec<BulkReply> = Self::json(self.send(request, db).await?).await?;
        Ok(replies
            .into_iter()
            .map(|reply| match (reply.id, reply.rev, reply.error) {
                (Some(id), Some(rev), None) => BulkOutcome::Stored(DocumentRevision { id, rev }),
                (id, _, error) => BulkOutcome::Failed {
                    id,
                    reason: reply
                        .reason
                        .or(error)
                        .unwrap_or_else(|| "unknown bulk failure".to_string()),
                },
            })
            .collect())
    }

    async fn all_docs(&self, db: &str) -> Result<Vec<Value>, DocStoreError> {
        let request = self.request_with_query(
            Method::GET,
            &[db, "_all_docs"],
            &[("include_docs", "true")],
        )?;
        let reply: AllDocsReply = Self::json(self.send(request, db).await?).await?;
        Ok(reply.rows.into_iter().filter_map(|row| row.doc).collect())
    }

    async fn count_docs(&self, db: &str) -> Result<u64, DocStoreError> {
        let request = self.request(Method::GET, &[db])?;
        let info: DatabaseInfo = Self::json(self.send(request, db).await?).await?;
        Ok(info.doc_count)
    }

    async fn database_exists(&self, db: &str) -> Result<bool, DocStoreError> {
        let request = self.request(Method::HEAD, &[db])?;
        let response = request.send().await.map_err(map_transport_error)?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(status_error(status, db, response).await),
        }
    }

    async fn create_database(&self, db: &str) -> Result<(), DocStoreError> {
        let request = self.request(Method::PUT, &[db])?;
        self.send(request, db).await.map(|_| ())
    }

    async fn destroy_database(&self, db: &str) -> Result<(), DocStoreError> {
        let request = self.request(Method::DELETE, &[db])?;
        self.send(request, db).await.map(|_| ())
    }

    async fn create_index(&self, db: &str, index: &IndexDefinition) -> Result<(), DocStoreError> {
        let body = json!({
            "index": { "fields": index.fields },
            "name": index.name,
            "ddoc": index.name,
            "type": "json",
        });
        let request = self.request(Method::POST, &[db, "_index"])?.json(&body);
        self.send(request, &index.name).await?;
        debug!(
            target = "quire::docstore",
            source = SOURCE,
            db,
            index = %index.name,
            "index ensured"
        );
        Ok(())
    }

    async fn list_indexes(&self, db: &str) -> Result<Vec<IndexDefinition>, DocStoreError> {
        let request = self.request(Method::GET, &[db, "_index"])?;
        let reply: IndexListReply = Self::json(self.send(request, db).await?).await?;
        Ok(reply.indexes.into_iter().filter_map(index_from_reply).collect())
    }

    async fn delete_index(&self, db: &str, name: &str) -> Result<(), DocStoreError> {
        let request = self.request(Method::DELETE, &[db, "_index", name, "json", name])?;
        self.send(request, name).await.map(|_| ())
    }

    async fn ping(&self) -> Result<(), DocStoreError> {
        let request = self.request(Method::GET, &["_up"])?;
        self.send(request, "_up").await.map(|_| ())
    }

    async fn close(&self) {
        // reqwest releases idle sockets when the last client clone drops.
        debug!(target = "quire::docstore", source = SOURCE, "handle closed");
    }

    fn backend(&self) -> &'static str {
        "couchdb"
    }
}

/// Builds one HTTP client per pooled handle.
#[derive(Debug, Clone)]
pub struct CouchConnector {
    url: String,
    timeout: Duration,
}

impl CouchConnector {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Connector for CouchConnector {
    async fn connect(&self) -> Result<Arc<dyn DocumentStore>, DocStoreError> {
        let store = CouchDbStore::new(&self.url, self.timeout)?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_segments_are_percent_encoded() {
        let store = CouchDbStore::new("http://localhost:5984/", Duration::from_secs(1)).unwrap();
        let url = store.url(&["posts", "a/b c"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:5984/posts/a%2Fb%20c");
    }

    #[test]
    fn url_keeps_base_path_prefix() {
        let store =
            CouchDbStore::new("http://localhost:5984/couch", Duration::from_secs(1)).unwrap();
        let url = store.url(&["_up"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:5984/couch/_up");
    }

    #[test]
    fn rejects_non_base_urls() {
        assert!(CouchDbStore::new("mailto:admin@example.com", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn database_info_reads_doc_count() {
        let info: DatabaseInfo = serde_json::from_value(json!({
            "db_name": "posts",
            "doc_count": 42,
            "doc_del_count": 3,
            "update_seq": "57-g1AAAA",
            "sizes": {"file": 1024, "external": 512, "active": 800}
        }))
        .unwrap();
        assert_eq!(info.doc_count, 42);
    }

    #[test]
    fn special_indexes_are_skipped() {
        let reply: IndexListReply = serde_json::from_value(json!({
            "indexes": [
                {"ddoc": null, "name": "_all_docs", "type": "special", "def": {"fields": [{"_id": "asc"}]}},
                {"ddoc": "_design/posts-status", "name": "posts-status", "type": "json",
                 "def": {"fields": [{"status": "asc"}, {"created_at": "asc"}]}}
            ]
        }))
        .unwrap();

        let indexes: Vec<_> = reply.indexes.into_iter().filter_map(index_from_reply).collect();
        assert_eq!(
            indexes,
            vec![IndexDefinition::new("posts-status", &["status", "created_at"])]
        );
    }
}
