//! Shared key-value store used for counters, cached pages, and coordination state.
//!
//! Every server instance talks to the same store, so anything that must hold
//! across instances (rate-limit windows, cached responses, the migration
//! lease) goes through [`KeyValueStore`]. Two backends are provided: Redis
//! for deployments and an in-process store for single-node runs and tests.

mod glob;
pub mod keys;
mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use glob::glob_match;
pub use memory::{MemoryStore, Published};
pub use redis_store::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),
    #[error("key-value operation `{op}` timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
    #[error("malformed key-value data: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout { .. })
    }
}

/// Operations the coordination layer needs from the shared store.
///
/// Implementations must make [`increment_by_with_ttl`](Self::increment_by_with_ttl)
/// a single atomic step: the counter is created with the TTL on first use and
/// later increments leave the expiry untouched.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration)
    -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn increment_by_with_ttl(
        &self,
        key: &str,
        delta: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError>;

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        self.increment_by_with_ttl(key, 1, ttl).await
    }

    /// Delete every key matching a glob pattern and return how many were removed.
    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError>;

    /// Returns whether the key existed and now carries the new expiry.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// `None` when the key is missing or has no expiry.
    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Number of live keys across every prefix.
    async fn key_count(&self) -> Result<u64, StoreError>;

    fn backend(&self) -> &'static str;
}

/// Parse a counter stored as ASCII decimal, as both backends write them.
pub(crate) fn parse_counter(key: &str, raw: &[u8]) -> Result<u64, StoreError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.trim().parse::<u64>().ok())
        .ok_or_else(|| StoreError::malformed(format!("`{key}` does not hold a counter")))
}
