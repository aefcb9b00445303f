use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{KeyValueStore, StoreError, glob_match, parse_counter};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// A message delivered through [`MemoryStore::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub channel: String,
    pub payload: Bytes,
}

/// In-process store with the same expiry semantics as the Redis backend.
///
/// Expiry uses `tokio::time::Instant`, so tests running on a paused clock
/// observe TTLs deterministically. Expired entries are invisible to readers
/// and removed lazily.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    events: broadcast::Sender<Published>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.events.subscribe()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.value().is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_value(&self, key: &str) -> Option<StoredValue> {
        let now = Instant::now();
        let stored = self.entries.get(key)?.clone();
        if stored.is_live(now) {
            Some(stored)
        } else {
            self.entries.remove_if(key, |_, value| !value.is_live(now));
            None
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_with_ttl(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let expires_at = Instant::now() + ttl;
        self.entries.insert(
            key.to_owned(),
            StoredValue {
                value,
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.live_value(key).map(|stored| stored.value))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, stored)| stored.is_live(now)))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.live_value(key).is_some())
    }

    async fn increment_by_with_ttl(
        &self,
        key: &str,
        delta: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut created = false;
        // The entry guard holds the shard lock, so read-modify-write is atomic per key.
        let mut slot = self.entries.entry(key.to_owned()).or_insert_with(|| {
            created = true;
            StoredValue {
                value: Bytes::from_static(b"0"),
                expires_at: None,
            }
        });

        if !slot.is_live(now) {
            created = true;
            slot.value = Bytes::from_static(b"0");
            slot.expires_at = None;
        }

        let next = parse_counter(key, &slot.value)?.saturating_add(delta);
        slot.value = Bytes::from(next.to_string());
        if created {
            slot.expires_at = Some(now + ttl);
        }
        Ok(next)
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in matching {
            if let Some((_, stored)) = self.entries.remove(&key)
                && stored.is_live(now)
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut stored) if stored.is_live(now) => {
                stored.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        Ok(self
            .live_value(key)
            .and_then(|stored| stored.expires_at)
            .map(|deadline| deadline.saturating_duration_since(now)))
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<u64, StoreError> {
        let message = Published {
            channel: channel.to_owned(),
            payload,
        };
        // A send with no receivers is not an error for pub/sub semantics.
        Ok(self.events.send(message).map(|n| n as u64).unwrap_or(0))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn key_count(&self) -> Result<u64, StoreError> {
        Ok(self.len() as u64)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn values_expire_after_ttl() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("page_cache:a", Bytes::from_static(b"body"), Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(
            store.get("page_cache:a").await.unwrap(),
            Some(Bytes::from_static(b"body"))
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("page_cache:a").await.unwrap(), None);
        assert!(!store.exists("page_cache:a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn increment_sets_ttl_only_on_creation() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);

        assert_eq!(store.increment_with_ttl("c", window).await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.increment_with_ttl("c", window).await.unwrap(), 2);

        let remaining = store.ttl_remaining("c").await.unwrap().unwrap();
        assert_eq!(remaining, Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.increment_with_ttl("c", window).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn increment_by_adds_the_delta_and_keeps_the_window() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(20);

        assert_eq!(store.increment_by_with_ttl("n", 5, ttl).await.unwrap(), 5);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.increment_by_with_ttl("n", 3, ttl).await.unwrap(), 8);
        assert_eq!(
            store.ttl_remaining("n").await.unwrap(),
            Some(Duration::from_secs(15))
        );
        assert_eq!(store.key_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    store
                        .increment_with_ttl("shared", Duration::from_secs(60))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let raw = store.get("shared").await.unwrap().unwrap();
        assert_eq!(parse_counter("shared", &raw).unwrap(), 320);
    }

    #[tokio::test]
    async fn increment_rejects_non_counter_values() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", Bytes::from_static(b"html"), Duration::from_secs(5))
            .await
            .unwrap();

        let err = store
            .increment_with_ttl("k", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));
    }

    #[tokio::test]
    async fn delete_by_pattern_counts_only_matches() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        for key in ["rate_limit:api:1", "rate_limit:api:2", "rate_limit:auth:1"] {
            store.increment_with_ttl(key, ttl).await.unwrap();
        }

        assert_eq!(store.delete_by_pattern("rate_limit:api:*").await.unwrap(), 2);
        assert!(store.exists("rate_limit:auth:1").await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expire_only_touches_live_keys() {
        let store = MemoryStore::new();
        assert!(!store.expire("missing", Duration::from_secs(1)).await.unwrap());

        store.increment_with_ttl("k", Duration::from_secs(5)).await.unwrap();
        assert!(store.expire("k", Duration::from_secs(50)).await.unwrap());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let store = MemoryStore::new();
        assert_eq!(
            store.publish("events", Bytes::from_static(b"x")).await.unwrap(),
            0
        );

        let mut rx = store.subscribe();
        assert_eq!(
            store
                .publish("events", Bytes::from_static(b"cache_invalidated"))
                .await
                .unwrap(),
            1
        );
        let message = rx.recv().await.unwrap();
        assert_eq!(message.channel, "events");
        assert_eq!(message.payload, Bytes::from_static(b"cache_invalidated"));
    }
}
