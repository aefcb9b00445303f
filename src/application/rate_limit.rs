//! Fixed-window rate limiting over the shared key-value store.
//!
//! Each `(scope, identifier)` pair owns one counter. The first increment in a
//! window creates it with `ttl = window`; later increments leave the TTL
//! alone, so the window is anchored at the first request and bursts across a
//! boundary can reach twice the limit.

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::config::{RateBudget, RateLimitSettings};
use crate::infra::kv::{KeyValueStore, StoreError, keys, parse_counter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateScope {
    /// General API traffic, keyed by client IP.
    Api,
    /// Authentication attempts, keyed by client IP.
    Auth,
    /// Authenticated traffic, keyed by user id.
    User,
}

impl RateScope {
    pub const ALL: [RateScope; 3] = [RateScope::Api, RateScope::Auth, RateScope::User];

    pub fn as_str(self) -> &'static str {
        match self {
            RateScope::Api => "api",
            RateScope::Auth => "auth",
            RateScope::User => "user",
        }
    }
}

impl fmt::Display for RateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownScope(pub String);

impl fmt::Display for UnknownScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown rate limit scope `{}`", self.0)
    }
}

impl std::error::Error for UnknownScope {}

impl FromStr for RateScope {
    type Err = UnknownScope;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "api" => Ok(RateScope::Api),
            "auth" => Ok(RateScope::Auth),
            "user" => Ok(RateScope::User),
            other => Err(UnknownScope(other.to_string())),
        }
    }
}

/// A scope bound to its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub scope: RateScope,
    pub limit: NonZeroU32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(scope: RateScope, budget: RateBudget) -> Self {
        Self {
            scope,
            limit: budget.limit,
            window: budget.window,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Count after this request; `0` when the store could not be reached.
    pub count: u64,
    pub limit: u32,
    pub remaining: u32,
    #[serde(with = "crate::util::time::serde_millis")]
    pub retry_after: Duration,
    /// The store was unreachable and the request was let through.
    pub degraded: bool,
}

impl RateLimitDecision {
    fn from_count(count: u64, policy: &RateLimitPolicy, retry_after: Duration) -> Self {
        let limit = policy.limit.get();
        Self {
            allowed: count <= u64::from(limit),
            count,
            limit,
            remaining: remaining(limit, count),
            retry_after,
            degraded: false,
        }
    }

    fn fail_open(policy: &RateLimitPolicy) -> Self {
        let limit = policy.limit.get();
        Self {
            allowed: true,
            count: 0,
            limit,
            remaining: limit,
            retry_after: Duration::ZERO,
            degraded: true,
        }
    }

    /// Seconds for a `Retry-After` header, never less than one.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.as_secs().max(1)
    }
}

/// Read-only view of one counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub scope: RateScope,
    pub identifier: String,
    pub count: u64,
    pub limit: u32,
    pub remaining: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resets_at: Option<OffsetDateTime>,
}

fn remaining(limit: u32, count: u64) -> u32 {
    u32::try_from(u64::from(limit).saturating_sub(count)).unwrap_or(0)
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    api: RateLimitPolicy,
    auth: RateLimitPolicy,
    user: RateLimitPolicy,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("backend", &self.store.backend())
            .field("api", &self.api)
            .field("auth", &self.auth)
            .field("user", &self.user)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, settings: &RateLimitSettings) -> Self {
        Self {
            store,
            api: RateLimitPolicy::new(RateScope::Api, settings.api),
            auth: RateLimitPolicy::new(RateScope::Auth, settings.auth),
            user: RateLimitPolicy::new(RateScope::User, settings.user),
        }
    }

    pub fn policy(&self, scope: RateScope) -> RateLimitPolicy {
        match scope {
            RateScope::Api => self.api,
            RateScope::Auth => self.auth,
            RateScope::User => self.user,
        }
    }

    /// Count one request against the scope's configured budget.
    pub async fn check(&self, scope: RateScope, identifier: &str) -> RateLimitDecision {
        self.check_with(&self.policy(scope), identifier).await
    }

    /// Count one request against an explicit policy. Store failures admit the
    /// request.
    pub async fn check_with(&self, policy: &RateLimitPolicy, identifier: &str) -> RateLimitDecision {
        let key = keys::rate_limit(policy.scope.as_str(), identifier);
        let scope = policy.scope.as_str();

        let count = match self.store.increment_with_ttl(&key, policy.window).await {
            Ok(count) => count,
            Err(err) => {
                warn!(
                    target = "quire::rate_limit",
                    scope,
                    error = %err,
                    "rate limit check failed, admitting request"
                );
                counter!("quire_rate_limit_fail_open_total", "scope" => scope).increment(1);
                return RateLimitDecision::fail_open(policy);
            }
        };

        let decision = if count <= u64::from(policy.limit.get()) {
            RateLimitDecision::from_count(count, policy, policy.window)
        } else {
            let retry_after = match self.store.ttl_remaining(&key).await {
                Ok(Some(ttl)) => ttl,
                _ => policy.window,
            };
            RateLimitDecision::from_count(count, policy, retry_after)
        };

        if decision.allowed {
            counter!("quire_rate_limit_allowed_total", "scope" => scope).increment(1);
        } else {
            counter!("quire_rate_limit_rejected_total", "scope" => scope).increment(1);
            debug!(
                target = "quire::rate_limit",
                scope,
                count,
                limit = policy.limit.get(),
                "rate limit exceeded"
            );
        }
        decision
    }

    /// Current state of a counter without counting a request.
    pub async fn status(
        &self,
        scope: RateScope,
        identifier: &str,
    ) -> Result<RateLimitStatus, StoreError> {
        let policy = self.policy(scope);
        let key = keys::rate_limit(scope.as_str(), identifier);

        let count = match self.store.get(&key).await? {
            Some(raw) => parse_counter(&key, &raw)?,
            None => 0,
        };
        let resets_at = self
            .store
            .ttl_remaining(&key)
            .await?
            .map(|ttl| OffsetDateTime::now_utc() + ttl);

        Ok(RateLimitStatus {
            scope,
            identifier: identifier.to_string(),
            count,
            limit: policy.limit.get(),
            remaining: remaining(policy.limit.get(), count),
            resets_at,
        })
    }

    /// Delete one counter. Returns whether it existed.
    pub async fn reset(&self, scope: RateScope, identifier: &str) -> Result<bool, StoreError> {
        self.store
            .delete(&keys::rate_limit(scope.as_str(), identifier))
            .await
    }

    /// Clear the IP-keyed scopes for one address.
    pub async fn reset_ip(&self, ip: &str) -> Result<u64, StoreError> {
        let mut cleared = 0;
        for scope in [RateScope::Api, RateScope::Auth] {
            if self.reset(scope, ip).await? {
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    pub async fn reset_scope(&self, scope: RateScope) -> Result<u64, StoreError> {
        self.reset_by_pattern(&keys::rate_limit_scope_pattern(scope.as_str()))
            .await
    }

    pub async fn reset_all(&self) -> Result<u64, StoreError> {
        self.reset_by_pattern(&keys::rate_limit_all_pattern()).await
    }

    /// Delete every counter whose key matches `pattern`. The pattern is
    /// confined to the rate-limit key space.
    pub async fn reset_by_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        let prefix = format!("{}:", keys::RATE_LIMIT_PREFIX);
        let pattern = if pattern.starts_with(&prefix) {
            pattern.to_string()
        } else {
            format!("{prefix}{pattern}")
        };
        let deleted = self.store.delete_by_pattern(&pattern).await?;
        debug!(
            target = "quire::rate_limit",
            pattern = %pattern,
            deleted,
            "rate limit counters reset"
        );
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::infra::kv::MemoryStore;

    fn budget(limit: u32, window_secs: u64) -> RateBudget {
        RateBudget {
            limit: NonZeroU32::new(limit).unwrap(),
            window: Duration::from_secs(window_secs),
        }
    }

    fn limiter(store: Arc<dyn KeyValueStore>) -> RateLimiter {
        RateLimiter::new(
            store,
            &RateLimitSettings {
                api: budget(5, 60),
                auth: budget(2, 3600),
                user: budget(3, 60),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_reports_remaining_window() {
        let limiter = limiter(Arc::new(MemoryStore::new()));

        for _ in 0..5 {
            assert!(limiter.check(RateScope::Api, "10.0.0.1").await.allowed);
        }
        tokio::time::advance(Duration::from_secs(20)).await;

        let decision = limiter.check(RateScope::Api, "10.0.0.1").await;
        assert!(!decision.allowed);
        assert_eq!(decision.count, 6);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after, Duration::from_secs(40));
        assert_eq!(decision.retry_after_secs(), 40);
    }

    #[tokio::test]
    async fn scopes_count_independently() {
        let limiter = limiter(Arc::new(MemoryStore::new()));

        for _ in 0..2 {
            assert!(limiter.check(RateScope::Auth, "10.0.0.2").await.allowed);
        }
        assert!(!limiter.check(RateScope::Auth, "10.0.0.2").await.allowed);

        let api = limiter.check(RateScope::Api, "10.0.0.2").await;
        assert!(api.allowed);
        assert_eq!(api.count, 1);
        assert_eq!(api.remaining, 4);
    }

    #[tokio::test]
    async fn status_does_not_count() {
        let limiter = limiter(Arc::new(MemoryStore::new()));
        limiter.check(RateScope::User, "u-1").await;
        limiter.check(RateScope::User, "u-1").await;

        let status = limiter.status(RateScope::User, "u-1").await.unwrap();
        assert_eq!(status.count, 2);
        assert_eq!(status.remaining, 1);
        assert!(status.resets_at.is_some());

        let again = limiter.status(RateScope::User, "u-1").await.unwrap();
        assert_eq!(again.count, 2);

        let fresh = limiter.status(RateScope::User, "u-2").await.unwrap();
        assert_eq!(fresh.count, 0);
        assert_eq!(fresh.resets_at, None);
    }

    #[tokio::test]
    async fn resets_clear_the_right_counters() {
        let limiter = limiter(Arc::new(MemoryStore::new()));
        limiter.check(RateScope::Api, "10.0.0.3").await;
        limiter.check(RateScope::Auth, "10.0.0.3").await;
        limiter.check(RateScope::User, "u-3").await;

        assert!(limiter.reset(RateScope::User, "u-3").await.unwrap());
        assert!(!limiter.reset(RateScope::User, "u-3").await.unwrap());
        assert_eq!(limiter.reset_ip("10.0.0.3").await.unwrap(), 2);

        limiter.check(RateScope::Api, "a").await;
        limiter.check(RateScope::Api, "b").await;
        limiter.check(RateScope::Auth, "a").await;
        assert_eq!(limiter.reset_scope(RateScope::Api).await.unwrap(), 2);
        assert_eq!(limiter.reset_all().await.unwrap(), 1);
    }

    #[test]
    fn scope_round_trips_through_str() {
        for scope in RateScope::ALL {
            assert_eq!(scope.as_str().parse::<RateScope>().unwrap(), scope);
        }
        assert!("global".parse::<RateScope>().is_err());
    }

    struct DownStore;

    #[async_trait]
    impl KeyValueStore for DownStore {
        async fn set_with_ttl(&self, _: &str, _: Bytes, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::unavailable("down"))
        }
        async fn get(&self, _: &str) -> Result<Option<Bytes>, StoreError> {
            Err(StoreError::unavailable("down"))
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::unavailable("down"))
        }
        async fn exists(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::unavailable("down"))
        }
        async fn increment_by_with_ttl(
            &self,
            _: &str,
            _: u64,
            _: Duration,
        ) -> Result<u64, StoreError> {
            Err(StoreError::unavailable("down"))
        }
        async fn delete_by_pattern(&self, _: &str) -> Result<u64, StoreError> {
            Err(StoreError::unavailable("down"))
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::unavailable("down"))
        }
        async fn ttl_remaining(&self, _: &str) -> Result<Option<Duration>, StoreError> {
            Err(StoreError::unavailable("down"))
        }
        async fn publish(&self, _: &str, _: Bytes) -> Result<u64, StoreError> {
            Err(StoreError::unavailable("down"))
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::unavailable("down"))
        }
        async fn key_count(&self) -> Result<u64, StoreError> {
            Err(StoreError::unavailable("down"))
        }
        fn backend(&self) -> &'static str {
            "down"
        }
    }

    #[tokio::test]
    async fn unreachable_store_fails_open() {
        let limiter = limiter(Arc::new(DownStore));
        for _ in 0..10 {
            let decision = limiter.check(RateScope::Auth, "10.0.0.4").await;
            assert!(decision.allowed);
            assert!(decision.degraded);
        }
        assert!(limiter.reset_all().await.is_err());
    }
}
