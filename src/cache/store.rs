//! Page cache over the shared key-value store.

use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use bytes::Bytes;
use metrics::counter;
use tracing::{debug, warn};

use crate::infra::kv::{KeyValueStore, StoreError, keys};

use super::config::CacheConfig;
use super::entry::CachedPage;
use super::keys::{CacheKey, RequestShape, path_pattern};
use super::writer::{CacheWriter, CacheWriterStats};

/// Why a request bypasses the cache entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bypass {
    Disabled,
    Method,
    SkippedPath,
    NoCache,
    Authenticated,
}

impl Bypass {
    pub fn as_str(self) -> &'static str {
        match self {
            Bypass::Disabled => "disabled",
            Bypass::Method => "method",
            Bypass::SkippedPath => "skipped_path",
            Bypass::NoCache => "no_cache",
            Bypass::Authenticated => "authenticated",
        }
    }
}

#[derive(Clone)]
pub struct PageCache {
    store: Arc<dyn KeyValueStore>,
    config: CacheConfig,
    writer: CacheWriter,
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("backend", &self.store.backend())
            .field("config", &self.config)
            .field("writer", &self.writer)
            .finish()
    }
}

impl PageCache {
    pub fn new(store: Arc<dyn KeyValueStore>, config: CacheConfig, writer: CacheWriter) -> Self {
        Self {
            store,
            config,
            writer,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn writer_stats(&self) -> CacheWriterStats {
        self.writer.stats()
    }

    /// Wait for queued writes to be attempted.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    /// Decide whether a request may be served from or stored in the cache.
    /// `no_cache` reflects an explicit client opt-out header.
    pub fn bypass(&self, shape: &RequestShape, no_cache: bool) -> Option<Bypass> {
        if !self.config.enabled {
            return Some(Bypass::Disabled);
        }
        if shape.method != Method::GET && shape.method != Method::HEAD {
            return Some(Bypass::Method);
        }
        if self.config.is_skipped_path(&shape.path) {
            return Some(Bypass::SkippedPath);
        }
        if no_cache || shape.param("nocache").is_some_and(|value| !value.is_empty()) {
            return Some(Bypass::NoCache);
        }
        if !self.config.cache_private && shape.identity.is_some() {
            return Some(Bypass::Authenticated);
        }
        None
    }

    pub fn key_for(&self, shape: &RequestShape) -> CacheKey {
        CacheKey::derive(shape, &self.config)
    }

    /// Fetch a live entry. Store failures and undecodable entries are
    /// misses; an undecodable entry is also deleted.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CachedPage> {
        let storage_key = key.storage_key();
        let raw = match self.store.get(&storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                counter!("quire_page_cache_miss_total").increment(1);
                return None;
            }
            Err(err) => {
                counter!("quire_page_cache_miss_total").increment(1);
                debug!(
                    target = "quire::page_cache",
                    error = %err,
                    "cache read failed, treating as miss"
                );
                return None;
            }
        };

        match CachedPage::decode(&raw) {
            Ok(page) => {
                counter!("quire_page_cache_hit_total").increment(1);
                Some(page)
            }
            Err(err) => {
                counter!("quire_page_cache_miss_total").increment(1);
                warn!(
                    target = "quire::page_cache",
                    key = %storage_key,
                    error = %err,
                    "discarding undecodable cache entry"
                );
                if let Err(err) = self.store.delete(&storage_key).await {
                    debug!(target = "quire::page_cache", error = %err, "failed to delete entry");
                }
                None
            }
        }
    }

    /// Write an entry and wait for the store.
    pub async fn store(
        &self,
        key: &CacheKey,
        body: Bytes,
        content_type: Option<&str>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let page = CachedPage::new(body, content_type, ttl);
        self.store
            .set_with_ttl(&key.storage_key(), page.encode()?, ttl)
            .await
    }

    /// Queue an entry for the background writers with the configured TTL.
    /// Never fails the caller; returns whether the write was queued.
    pub fn store_detached(&self, key: &CacheKey, body: Bytes, content_type: Option<&str>) -> bool {
        let ttl = self.config.ttl;
        let page = CachedPage::new(body, content_type, ttl);
        match page.encode() {
            Ok(payload) => self.writer.enqueue(key.storage_key(), payload, ttl),
            Err(err) => {
                warn!(target = "quire::page_cache", error = %err, "failed to encode page");
                false
            }
        }
    }

    /// Delete entries whose key (after `page_cache:`) matches `pattern`.
    pub async fn invalidate(&self, pattern: &str) -> Result<u64, StoreError> {
        let pattern = keys::page_cache(pattern);
        self.delete_matching(&pattern).await
    }

    /// Delete entries for requests whose path matches `path_glob` exactly,
    /// e.g. `/api/posts/*`.
    pub async fn invalidate_path(&self, path_glob: &str) -> Result<u64, StoreError> {
        self.delete_matching(&path_pattern(path_glob)).await
    }

    pub async fn invalidate_all(&self) -> Result<u64, StoreError> {
        self.invalidate("*").await
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError> {
        let deleted = self.store.delete_by_pattern(pattern).await?;
        debug!(
            target = "quire::page_cache",
            pattern = %pattern,
            deleted,
            "page cache invalidated"
        );
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::infra::kv::MemoryStore;

    fn cache_with(store: Arc<MemoryStore>, config: CacheConfig) -> PageCache {
        let writer = CacheWriter::spawn(store.clone(), 16, 1, CancellationToken::new());
        PageCache::new(store, config, writer)
    }

    fn get(path: &str) -> RequestShape {
        RequestShape::new(Method::GET, path)
    }

    #[tokio::test]
    async fn stored_page_is_returned_verbatim() {
        let cache = cache_with(Arc::new(MemoryStore::new()), CacheConfig::default());
        let key = cache.key_for(&get("/api/posts").with_query("tag", "rust"));

        cache
            .store(&key, Bytes::from_static(b"<h1>hi</h1>"), Some("text/html"), Duration::from_secs(60))
            .await
            .unwrap();

        let page = cache.lookup(&key).await.unwrap();
        assert_eq!(page.body, Bytes::from_static(b"<h1>hi</h1>"));
        assert_eq!(page.content_type, "text/html");

        let other = cache.key_for(&get("/api/posts").with_query("tag", "go"));
        assert!(cache.lookup(&other).await.is_none());
    }

    #[tokio::test]
    async fn undecodable_entries_are_misses_and_removed() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone(), CacheConfig::default());
        let key = cache.key_for(&get("/api/posts"));
        store
            .set_with_ttl(&key.storage_key(), Bytes::from_static(b"garbage"), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(cache.lookup(&key).await.is_none());
        assert!(!store.exists(&key.storage_key()).await.unwrap());
    }

    #[tokio::test]
    async fn bypass_rules() {
        let cache = cache_with(Arc::new(MemoryStore::new()), CacheConfig::default());

        assert_eq!(cache.bypass(&get("/api/posts"), false), None);
        assert_eq!(
            cache.bypass(&RequestShape::new(Method::POST, "/api/posts"), false),
            Some(Bypass::Method)
        );
        assert_eq!(
            cache.bypass(&get("/api/auth/login"), false),
            Some(Bypass::SkippedPath)
        );
        assert_eq!(cache.bypass(&get("/api/posts"), true), Some(Bypass::NoCache));
        assert_eq!(
            cache.bypass(&get("/api/posts").with_query("nocache", "1"), false),
            Some(Bypass::NoCache)
        );
        assert_eq!(
            cache.bypass(&get("/api/posts").with_identity("alice"), false),
            Some(Bypass::Authenticated)
        );
    }

    #[tokio::test]
    async fn invalidation_is_scoped_by_path() {
        let cache = cache_with(Arc::new(MemoryStore::new()), CacheConfig::default());
        for path in ["/api/posts/1", "/api/posts/2", "/api/contacts/1"] {
            let key = cache.key_for(&get(path));
            cache
                .store(&key, Bytes::from_static(b"{}"), None, Duration::from_secs(60))
                .await
                .unwrap();
        }

        assert_eq!(cache.invalidate_path("/api/posts/*").await.unwrap(), 2);
        assert!(cache.lookup(&cache.key_for(&get("/api/contacts/1"))).await.is_some());
        assert_eq!(cache.invalidate_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn detached_store_uses_configured_ttl() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(
            store.clone(),
            CacheConfig {
                ttl: Duration::from_secs(42),
                ..CacheConfig::default()
            },
        );
        let key = cache.key_for(&get("/api/posts"));

        assert!(cache.store_detached(&key, Bytes::from_static(b"[]"), Some("application/json")));
        cache.flush().await;

        let ttl = store.ttl_remaining(&key.storage_key()).await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(42));
        assert_eq!(cache.lookup(&key).await.unwrap().ttl_secs, 42);
    }
}
