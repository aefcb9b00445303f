//! Per-operation latency accounting for document-store calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use metrics::histogram;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::util::lock::mutex_lock;

const SOURCE: &str = "application::query_metrics";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryMetric {
    pub count: u64,
    #[serde(rename = "total_ms", with = "crate::util::time::serde_millis")]
    pub total: Duration,
    #[serde(rename = "average_ms", with = "crate::util::time::serde_millis")]
    pub average: Duration,
    #[serde(with = "time::serde::rfc3339")]
    pub last_used: OffsetDateTime,
}

impl QueryMetric {
    fn first(duration: Duration, at: OffsetDateTime) -> Self {
        Self {
            count: 1,
            total: duration,
            average: duration,
            last_used: at,
        }
    }

    fn accumulate(&mut self, duration: Duration, at: OffsetDateTime) {
        self.count += 1;
        self.total += duration;
        self.average = average(self.total, self.count);
        self.last_used = at;
    }
}

fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(count);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// One map behind one lock. Recording is a short critical section and
/// snapshots copy out, so readers never see a metric mid-update.
#[derive(Debug, Default)]
pub struct QueryMetricsTracker {
    metrics: Mutex<HashMap<String, QueryMetric>>,
}

impl QueryMetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, operation: &str, duration: Duration) {
        let now = OffsetDateTime::now_utc();
        histogram!("quire_query_duration_ms", "operation" => operation.to_string())
            .record(duration.as_secs_f64() * 1000.0);

        let mut metrics = mutex_lock(&self.metrics, SOURCE, "record");
        match metrics.get_mut(operation) {
            Some(metric) => metric.accumulate(duration, now),
            None => {
                metrics.insert(operation.to_string(), QueryMetric::first(duration, now));
            }
        }
    }

    /// Time `future` and record it under `operation`, whatever it returns.
    pub async fn track<F, T>(&self, operation: &str, future: F) -> T
    where
        F: Future<Output = T>,
    {
        let started = Instant::now();
        let output = future.await;
        self.record(operation, started.elapsed());
        output
    }

    pub fn snapshot(&self) -> HashMap<String, QueryMetric> {
        mutex_lock(&self.metrics, SOURCE, "snapshot").clone()
    }

    pub fn get(&self, operation: &str) -> Option<QueryMetric> {
        mutex_lock(&self.metrics, SOURCE, "get")
            .get(operation)
            .cloned()
    }

    /// Operations whose average exceeds `threshold`, slowest first.
    pub fn slow_operations(&self, threshold: Duration) -> Vec<(String, QueryMetric)> {
        let mut slow: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|(_, metric)| metric.average > threshold)
            .collect();
        slow.sort_by(|a, b| b.1.average.cmp(&a.1.average).then_with(|| a.0.cmp(&b.0)));
        slow
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.metrics, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
