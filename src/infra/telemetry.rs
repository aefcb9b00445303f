use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub(crate) fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "quire_rate_limit_allowed_total",
            Unit::Count,
            "Requests admitted by the rate limiter, labelled by scope."
        );
        describe_counter!(
            "quire_rate_limit_rejected_total",
            Unit::Count,
            "Requests rejected by the rate limiter, labelled by scope."
        );
        describe_counter!(
            "quire_rate_limit_fail_open_total",
            Unit::Count,
            "Requests admitted because the key-value store was unreachable."
        );
        describe_counter!(
            "quire_page_cache_hit_total",
            Unit::Count,
            "Page cache hits."
        );
        describe_counter!(
            "quire_page_cache_miss_total",
            Unit::Count,
            "Page cache misses, including undecodable entries."
        );
        describe_counter!(
            "quire_page_cache_write_total",
            Unit::Count,
            "Page cache writes by outcome (written, failed, dropped)."
        );
        describe_gauge!(
            "quire_page_cache_write_queue_len",
            Unit::Count,
            "Pending page cache writes waiting for a worker."
        );
        describe_counter!(
            "quire_pool_checkout_total",
            Unit::Count,
            "Pool handle checkouts served from the free list."
        );
        describe_counter!(
            "quire_pool_fallback_total",
            Unit::Count,
            "Pool checkouts served by the shared fallback handle."
        );
        describe_counter!(
            "quire_pool_discard_total",
            Unit::Count,
            "Handles closed on release because the free list was full."
        );
        describe_gauge!(
            "quire_pool_in_use",
            Unit::Count,
            "Pooled handles currently checked out."
        );
        describe_histogram!(
            "quire_pool_ping_ms",
            Unit::Milliseconds,
            "Document store ping latency in milliseconds."
        );
        describe_histogram!(
            "quire_query_duration_ms",
            Unit::Milliseconds,
            "Document store operation latency in milliseconds, labelled by operation."
        );
        describe_gauge!(
            "quire_pool_idle",
            Unit::Count,
            "Pooled handles waiting on the free list."
        );
        describe_counter!(
            "quire_health_issue_total",
            Unit::Count,
            "Health issues recorded, labelled by type and severity."
        );
        describe_gauge!(
            "quire_documents",
            Unit::Count,
            "Documents per collection at the last collector sample."
        );
        describe_counter!(
            "quire_migrations_applied_total",
            Unit::Count,
            "Migrations applied by this process."
        );
        describe_counter!(
            "quire_backups_total",
            Unit::Count,
            "Backup runs by status (completed, failed)."
        );
    });
}
