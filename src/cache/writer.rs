//! Detached cache population.
//!
//! Responses are handed to a bounded queue and written by a small worker
//! pool, so the request path never waits on the store. A full queue drops
//! the write; every outcome is counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::infra::kv::KeyValueStore;

#[derive(Debug)]
struct WriteJob {
    key: String,
    payload: Bytes,
    ttl: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheWriterStats {
    pub enqueued: u64,
    pub written: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    pending: AtomicU64,
}

impl Counters {
    fn settle(&self, idle: &Notify) {
        let left = self.pending.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        gauge!("quire_page_cache_write_queue_len").set(left as f64);
        if left == 0 {
            idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct CacheWriter {
    sender: mpsc::Sender<WriteJob>,
    counters: Arc<Counters>,
    idle: Arc<Notify>,
}

impl std::fmt::Debug for CacheWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWriter")
            .field("stats", &self.stats())
            .finish()
    }
}

impl CacheWriter {
    /// Start `workers` tasks draining a queue of `capacity` pending writes.
    /// Workers exit when `cancel` fires or every writer handle is dropped.
    pub fn spawn(
        store: Arc<dyn KeyValueStore>,
        capacity: usize,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(Counters::default());
        let idle = Arc::new(Notify::new());

        for worker in 0..workers.max(1) {
            tokio::spawn(run_worker(
                worker,
                store.clone(),
                receiver.clone(),
                counters.clone(),
                idle.clone(),
                cancel.clone(),
            ));
        }

        Self {
            sender,
            counters,
            idle,
        }
    }

    /// Queue a write. Returns `false` when the write was dropped.
    pub fn enqueue(&self, key: String, payload: Bytes, ttl: Duration) -> bool {
        self.counters.pending.fetch_add(1, Ordering::AcqRel);
        match self.sender.try_send(WriteJob { key, payload, ttl }) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                gauge!("quire_page_cache_write_queue_len")
                    .set(self.counters.pending.load(Ordering::Acquire) as f64);
                true
            }
            Err(err) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("quire_page_cache_write_total", "outcome" => "dropped").increment(1);
                let reason = match err {
                    mpsc::error::TrySendError::Full(_) => "queue_full",
                    mpsc::error::TrySendError::Closed(_) => "closed",
                };
                debug!(target = "quire::page_cache", reason, "cache write dropped");
                self.counters.settle(&self.idle);
                false
            }
        }
    }

    pub fn stats(&self) -> CacheWriterStats {
        CacheWriterStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Wait until every queued write has been attempted.
    pub async fn flush(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.counters.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn run_worker(
    worker: usize,
    store: Arc<dyn KeyValueStore>,
    receiver: Arc<Mutex<mpsc::Receiver<WriteJob>>>,
    counters: Arc<Counters>,
    idle: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = async { receiver.lock().await.recv().await } => job,
        };
        let Some(job) = job else {
            break;
        };

        match store.set_with_ttl(&job.key, job.payload, job.ttl).await {
            Ok(()) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
                counter!("quire_page_cache_write_total", "outcome" => "written").increment(1);
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                counter!("quire_page_cache_write_total", "outcome" => "failed").increment(1);
                warn!(
                    target = "quire::page_cache",
                    worker,
                    key = %job.key,
                    error = %err,
                    "cache write failed"
                );
            }
        }
        counters.settle(&idle);
    }
    debug!(target = "quire::page_cache", worker, "cache writer stopped");
}
