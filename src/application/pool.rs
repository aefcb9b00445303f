//! Bounded pool of document-store handles.
//!
//! The pool opens a fixed number of handles at startup and never grows.
//! Checkout never waits: when every pooled handle is busy the caller gets the
//! shared fallback handle instead, so a burst of traffic degrades into shared
//! use of one client rather than a queue of blocked requests.

use std::fmt;
use std::num::NonZeroU32;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DatabaseSettings;
use crate::infra::docstore::{Connector, DocStoreError, DocumentStore};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "application::pool";

#[derive(Debug, Error)]
pub enum PoolError {
    /// Index `capacity` denotes the fallback handle.
    #[error("failed to open document store handle #{index}")]
    Init {
        index: usize,
        #[source]
        source: DocStoreError,
    },
    #[error("document store unavailable")]
    Unavailable(#[source] DocStoreError),
    #[error("document store did not answer within {0:?}")]
    Timeout(Duration),
}

impl PoolError {
    /// Transient failures worth retrying. A handle that could not be opened
    /// at startup points at configuration and is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Unavailable(_) | PoolError::Timeout(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub size: NonZeroU32,
    pub ping_timeout: Duration,
    pub slow_ping: Duration,
}

impl From<&DatabaseSettings> for PoolOptions {
    fn from(settings: &DatabaseSettings) -> Self {
        Self {
            size: settings.pool_size,
            ping_timeout: settings.ping_timeout,
            slow_ping: settings.slow_ping,
        }
    }
}

/// Point-in-time counters for the admin endpoint and the pool-usage check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub capacity: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: usize,
    pub checkouts: u64,
    pub fallbacks: u64,
    pub discarded: u64,
}

impl PoolStatus {
    /// Fraction of pooled handles currently checked out.
    pub fn usage(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.in_use as f64 / self.capacity as f64
    }
}

/// Result of a successful round-trip. `slow` is a warning-level signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    #[serde(with = "crate::util::time::serde_millis")]
    pub latency: Duration,
    pub slow: bool,
}

struct PoolInner {
    free: Mutex<Vec<Arc<dyn DocumentStore>>>,
    fallback: Arc<dyn DocumentStore>,
    options: PoolOptions,
    capacity: usize,
    created: usize,
    in_use: AtomicUsize,
    checkouts: AtomicU64,
    fallbacks: AtomicU64,
    discarded: AtomicU64,
}

impl PoolInner {
    fn give_back(&self, handle: Arc<dyn DocumentStore>) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        gauge!("quire_pool_in_use").set(self.in_use.load(Ordering::Acquire) as f64);

        let mut free = mutex_lock(&self.free, SOURCE, "release");
        if free.len() < self.capacity {
            free.push(handle);
            return;
        }
        drop(free);

        self.discarded.fetch_add(1, Ordering::Relaxed);
        counter!("quire_pool_discard_total").increment(1);
        debug!(target = "quire::pool", "free list full, closing surplus handle");
        close_detached(handle);
    }
}

/// Close a discarded handle without blocking the releasing caller.
fn close_detached(handle: Arc<dyn DocumentStore>) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                handle.close().await;
            });
        }
        Err(_) => warn!(
            target = "quire::pool",
            "no async runtime available, dropping surplus handle without close"
        ),
    }
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionPool {
    /// Open the fallback handle and exactly `options.size` pooled handles.
    /// Any failure aborts with [`PoolError::Init`].
    pub async fn connect(
        connector: &dyn Connector,
        options: PoolOptions,
    ) -> Result<Self, PoolError> {
        let capacity = options.size.get() as usize;

        let mut handles = Vec::with_capacity(capacity);
        for index in 0..capacity {
            let handle = connector
                .connect()
                .await
                .map_err(|source| PoolError::Init { index, source })?;
            handles.push(handle);
        }
        let fallback = connector.connect().await.map_err(|source| PoolError::Init {
            index: capacity,
            source,
        })?;

        info!(
            target = "quire::pool",
            capacity,
            backend = fallback.backend(),
            "document store pool ready"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(handles),
                fallback,
                options,
                capacity,
                created: capacity,
                in_use: AtomicUsize::new(0),
                checkouts: AtomicU64::new(0),
                fallbacks: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        })
    }

    /// Check out a handle. Never waits; an empty free list yields the shared
    /// fallback handle.
    pub fn acquire(&self) -> PooledHandle {
        let popped = mutex_lock(&self.inner.free, SOURCE, "acquire").pop();
        match popped {
            Some(handle) => {
                self.inner.checkouts.fetch_add(1, Ordering::Relaxed);
                let in_use = self.inner.in_use.fetch_add(1, Ordering::AcqRel) + 1;
                counter!("quire_pool_checkout_total").increment(1);
                gauge!("quire_pool_in_use").set(in_use as f64);
                PooledHandle {
                    handle,
                    pool: Some(self.inner.clone()),
                }
            }
            None => {
                self.inner.fallbacks.fetch_add(1, Ordering::Relaxed);
                counter!("quire_pool_fallback_total").increment(1);
                debug!(target = "quire::pool", "pool exhausted, using fallback handle");
                PooledHandle {
                    handle: self.inner.fallback.clone(),
                    pool: None,
                }
            }
        }
    }

    /// Return a handle explicitly. Equivalent to dropping it.
    pub fn release(&self, handle: PooledHandle) {
        drop(handle);
    }

    pub fn status(&self) -> PoolStatus {
        let idle = mutex_lock(&self.inner.free, SOURCE, "status").len();
        PoolStatus {
            capacity: self.inner.capacity,
            idle,
            in_use: self.inner.in_use.load(Ordering::Acquire),
            created: self.inner.created,
            checkouts: self.inner.checkouts.load(Ordering::Relaxed),
            fallbacks: self.inner.fallbacks.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }

    /// Round-trip against the store through the fallback handle, bounded by
    /// the configured ping timeout.
    pub async fn health(&self) -> Result<PoolHealth, PoolError> {
        let options = self.inner.options;
        let started = Instant::now();
        let outcome = tokio::time::timeout(options.ping_timeout, self.inner.fallback.ping()).await;
        let latency = started.elapsed();
        histogram!("quire_pool_ping_ms").record(latency.as_secs_f64() * 1000.0);

        match outcome {
            Err(_) => Err(PoolError::Timeout(options.ping_timeout)),
            Ok(Err(err)) => Err(PoolError::Unavailable(err)),
            Ok(Ok(())) => Ok(PoolHealth {
                latency,
                slow: latency > options.slow_ping,
            }),
        }
    }

    /// The handle used for administrative work that should not consume a
    /// pooled slot, such as migrations and backups.
    pub fn shared(&self) -> Arc<dyn DocumentStore> {
        self.inner.fallback.clone()
    }

    /// Close every idle handle and the fallback. Handles still checked out are
    /// closed when they come back.
    pub async fn close(&self) {
        let drained: Vec<_> = mutex_lock(&self.inner.free, SOURCE, "close")
            .drain(..)
            .collect();
        let count = drained.len();
        for handle in drained {
            handle.close().await;
        }
        self.inner.fallback.close().await;
        info!(target = "quire::pool", closed = count, "document store pool closed");
    }
}

/// A checked-out handle. Dropping it returns the handle to the pool.
pub struct PooledHandle {
    handle: Arc<dyn DocumentStore>,
    /// `None` for the fallback handle, which is never pushed to the free list.
    pool: Option<Arc<PoolInner>>,
}

impl PooledHandle {
    pub fn is_fallback(&self) -> bool {
        self.pool.is_none()
    }
}

impl fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledHandle")
            .field("fallback", &self.is_fallback())
            .finish()
    }
}

impl Deref for PooledHandle {
    type Target = dyn DocumentStore;

    fn deref(&self) -> &Self::Target {
        self.handle.as_ref()
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.give_back(self.handle.clone());
        }
    }
}
