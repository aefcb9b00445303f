//! Typed access to the content families of the shared key-value store.
//!
//! Values are stored as JSON with an explicit TTL. Handlers use this for
//! post and post-list caching, sessions, named counters, and small pieces
//! of application or per-user state that must be visible to every instance.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::infra::kv::{KeyValueStore, StoreError, keys, parse_counter};

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub backend: &'static str,
    pub connected: bool,
    /// Live keys across every prefix; absent when the store is unreachable.
    pub keys: Option<u64>,
}

#[derive(Clone)]
pub struct SharedState {
    store: Arc<dyn KeyValueStore>,
}

impl SharedState {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    async fn put_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(value)
            .map_err(|err| StoreError::malformed(format!("cannot encode `{key}`: {err}")))?;
        self.store.set_with_ttl(key, Bytes::from(payload), ttl).await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(key).await? {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|err| StoreError::malformed(format!("cannot decode `{key}`: {err}"))),
            None => Ok(None),
        }
    }

    pub async fn cache_post<T: Serialize + ?Sized>(
        &self,
        id: &str,
        post: &T,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.put_json(&keys::post(id), post, ttl).await
    }

    pub async fn cached_post<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>, StoreError> {
        self.get_json(&keys::post(id)).await
    }

    /// Drop a cached post together with every cached listing, since any
    /// listing may contain it.
    pub async fn invalidate_post(&self, id: &str) -> Result<u64, StoreError> {
        let post = u64::from(self.store.delete(&keys::post(id)).await?);
        let lists = self.invalidate_posts_lists().await?;
        debug!(target = "quire::shared_state", post = id, lists, "post cache invalidated");
        Ok(post + lists)
    }

    pub async fn cache_posts_list<T: Serialize + ?Sized>(
        &self,
        query_hash: &str,
        posts: &T,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.put_json(&keys::posts_list(query_hash), posts, ttl)
            .await
    }

    pub async fn cached_posts_list<T: DeserializeOwned>(
        &self,
        query_hash: &str,
    ) -> Result<Option<T>, StoreError> {
        self.get_json(&keys::posts_list(query_hash)).await
    }

    pub async fn invalidate_posts_lists(&self) -> Result<u64, StoreError> {
        self.store
            .delete_by_pattern(&keys::posts_list_pattern())
            .await
    }

    pub async fn set_session<T: Serialize + ?Sized>(
        &self,
        session_id: &str,
        data: &T,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.put_json(&keys::session(session_id), data, ttl).await
    }

    pub async fn session<T: DeserializeOwned>(
        &self,
        session_id: &str,
    ) -> Result<Option<T>, StoreError> {
        self.get_json(&keys::session(session_id)).await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        self.store.delete(&keys::session(session_id)).await
    }

    /// Add `by` to a named counter. The TTL applies when the counter is created.
    pub async fn increment_counter(
        &self,
        name: &str,
        by: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        self.store
            .increment_by_with_ttl(&keys::counter(name), by, ttl)
            .await
    }

    pub async fn set_counter(&self, name: &str, value: u64, ttl: Duration) -> Result<(), StoreError> {
        self.store
            .set_with_ttl(&keys::counter(name), Bytes::from(value.to_string()), ttl)
            .await
    }

    /// A missing counter reads as zero.
    pub async fn counter(&self, name: &str) -> Result<u64, StoreError> {
        let key = keys::counter(name);
        match self.store.get(&key).await? {
            Some(raw) => parse_counter(&key, &raw),
            None => Ok(0),
        }
    }

    pub async fn set_app_state<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.put_json(&keys::app_state(key), value, ttl).await
    }

    pub async fn app_state<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.get_json(&keys::app_state(key)).await
    }

    pub async fn set_user_state<T: Serialize + ?Sized>(
        &self,
        user_id: &str,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.put_json(&keys::user_state(user_id, key), value, ttl)
            .await
    }

    pub async fn user_state<T: DeserializeOwned>(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        self.get_json(&keys::user_state(user_id, key)).await
    }

    pub async fn stats(&self) -> StoreStats {
        let backend = self.store.backend();
        if self.store.ping().await.is_err() {
            return StoreStats {
                backend,
                connected: false,
                keys: None,
            };
        }
        StoreStats {
            backend,
            connected: true,
            keys: self.store.key_count().await.ok(),
        }
    }
}
