use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::{RedisError, RedisResult, Script, aio::ConnectionManager};
use tracing::{debug, info};

use super::{KeyValueStore, StoreError};

const SOURCE: &str = "infra::kv::redis_store";
const SCAN_BATCH: usize = 200;

// INCRBY and PEXPIRE run inside one script so a counter can never exist without its window.
const INCREMENT_WITH_TTL: &str = r#"
local created = redis.call('EXISTS', KEYS[1]) == 0
local count = redis.call('INCRBY', KEYS[1], ARGV[2])
if created then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Redis-backed store shared by every server instance.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    timeout: Duration,
    increment: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect and verify the server answers within `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(map_redis_error)?;
        let manager = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout {
                op: "connect",
                timeout,
            })?
            .map_err(map_redis_error)?;

        let store = Self {
            manager,
            timeout,
            increment: Script::new(INCREMENT_WITH_TTL),
        };
        store.ping().await?;
        info!(target = "quire::kv", source = SOURCE, "connected to redis");
        Ok(store)
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = RedisResult<T>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(map_redis_error),
            Err(_) => Err(StoreError::Timeout {
                op,
                timeout: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set_with_ttl(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value.as_ref())
            .arg("PX")
            .arg(ttl_millis(ttl));
        self.bounded("set", async move { cmd.query_async::<()>(&mut conn).await })
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let value: Option<Vec<u8>> = self
            .bounded("get", async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(value.map(Bytes::from))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let removed: i64 = self
            .bounded("delete", async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        let found: i64 = self
            .bounded("exists", async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(found > 0)
    }

    async fn increment_by_with_ttl(
        &self,
        key: &str,
        delta: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let mut conn = self.manager.clone();
        let mut invocation = self.increment.key(key);
        invocation.arg(ttl_millis(ttl)).arg(delta);
        let count: i64 = self
            .bounded("increment_by_with_ttl", async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        u64::try_from(count)
            .map_err(|_| StoreError::malformed(format!("`{key}` holds a negative counter")))
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let mut scan = redis::cmd("SCAN");
            scan.arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH);
            let mut scan_conn = self.manager.clone();
            let (next, keys): (u64, Vec<String>) = self
                .bounded("scan", async move { scan.query_async(&mut scan_conn).await })
                .await?;

            if !keys.is_empty() {
                let mut del = redis::cmd("DEL");
                del.arg(&keys);
                let mut del_conn = self.manager.clone();
                let count: i64 = self
                    .bounded("delete_by_pattern", async move {
                        del.query_async(&mut del_conn).await
                    })
                    .await?;
                removed += u64::try_from(count).unwrap_or(0);
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        debug!(
            target = "quire::kv",
            source = SOURCE,
            pattern,
            removed,
            "deleted keys by pattern"
        );
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(ttl_millis(ttl));
        let applied: i64 = self
            .bounded("expire", async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(applied == 1)
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(key);
        let millis: i64 = self
            .bounded("ttl_remaining", async move { cmd.query_async(&mut conn).await })
            .await?;
        // -2: missing key, -1: no expiry.
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<u64, StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(channel).arg(payload.as_ref());
        let receivers: i64 = self
            .bounded("publish", async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(u64::try_from(receivers).unwrap_or(0))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let cmd = redis::cmd("PING");
        let reply: String = self
            .bounded("ping", async move { cmd.query_async(&mut conn).await })
            .await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::malformed(format!("unexpected PING reply `{reply}`")))
        }
    }

    async fn key_count(&self) -> Result<u64, StoreError> {
        let mut conn = self.manager.clone();
        let cmd = redis::cmd("DBSIZE");
        let size: i64 = self
            .bounded("key_count", async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(u64::try_from(size).unwrap_or(0))
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn map_redis_error(err: RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        StoreError::unavailable(err.to_string())
    } else if matches!(err.kind(), redis::ErrorKind::TypeError) {
        StoreError::malformed(err.to_string())
    } else {
        StoreError::unavailable(err.to_string())
    }
}
