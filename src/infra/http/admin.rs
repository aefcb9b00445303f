//! Operator endpoints: health and metrics introspection, cache and rate
//! limit resets, migration status, backups.

use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware::from_fn,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::application::backup::BackupMetadata;
use crate::application::context::AppContext;
use crate::application::error::AppError;
use crate::application::health::HealthReport;
use crate::application::migrations::MigrationStatus;
use crate::application::pool::PoolStatus;
use crate::application::query_metrics::QueryMetric;
use crate::application::rate_limit::{RateLimitStatus, RateScope, UnknownScope};
use crate::application::shared_state::StoreStats;

use super::error::ApiError;
use super::middleware::{log_responses, set_request_context};

pub fn build_admin_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(health_report))
        .route("/health/issues/resolve", post(resolve_issue))
        .route("/metrics/queries", get(query_metrics))
        .route("/pool", get(pool_status))
        .route("/cache/invalidate", post(invalidate_cache))
        .route("/rate-limits", delete(reset_all_rate_limits))
        .route("/rate-limits/{scope}", delete(reset_rate_limit_scope))
        .route(
            "/rate-limits/{scope}/{id}",
            get(rate_limit_status).delete(reset_rate_limit),
        )
        .route("/store", get(store_stats))
        .route("/store/posts", delete(invalidate_posts_lists))
        .route("/store/posts/{id}", delete(invalidate_post))
        .route("/migrations", get(migration_status))
        .route("/backups", get(list_backups).post(create_backup))
        .layer(from_fn(log_responses))
        .layer(from_fn(set_request_context))
        .with_state(ctx)
}

#[derive(Debug, Serialize)]
struct Deleted {
    deleted: u64,
}

fn parse_scope(raw: &str) -> Result<RateScope, ApiError> {
    raw.parse().map_err(|err: UnknownScope| {
        ApiError::bad_request("Unknown rate limit scope", Some(err.to_string()))
    })
}

async fn health_report(State(ctx): State<AppContext>) -> Json<HealthReport> {
    Json(ctx.health.report())
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    #[serde(rename = "type")]
    issue_type: String,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Serialize)]
struct Resolved {
    resolved: bool,
}

async fn resolve_issue(
    State(ctx): State<AppContext>,
    Json(request): Json<ResolveRequest>,
) -> Json<Resolved> {
    let resolved = ctx
        .health
        .resolve(&request.issue_type, request.scope.as_deref());
    if resolved {
        info!(
            target = "quire::http::admin",
            issue_type = %request.issue_type,
            scope = request.scope.as_deref().unwrap_or(""),
            "health issue resolved by operator"
        );
    }
    Json(Resolved { resolved })
}

async fn query_metrics(State(ctx): State<AppContext>) -> Json<BTreeMap<String, QueryMetric>> {
    Json(ctx.query_metrics.snapshot().into_iter().collect())
}

async fn pool_status(State(ctx): State<AppContext>) -> Json<PoolStatus> {
    Json(ctx.pool.status())
}

/// Body `{ "pattern": "..." }` or `{ "path": "/api/posts/*" }`; an empty
/// body clears the whole page cache.
#[derive(Debug, Default, Deserialize)]
struct InvalidateRequest {
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    path: Option<String>,
}

async fn invalidate_cache(
    State(ctx): State<AppContext>,
    body: Option<Json<InvalidateRequest>>,
) -> Result<Json<Deleted>, ApiError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let cache = &ctx.page_cache;
    let deleted = match (request.pattern, request.path) {
        (Some(_), Some(_)) => {
            return Err(ApiError::bad_request("Provide either pattern or path", None));
        }
        (Some(pattern), None) => cache.invalidate(&pattern).await,
        (None, Some(path)) => cache.invalidate_path(&path).await,
        (None, None) => cache.invalidate_all().await,
    }
    .map_err(AppError::from)?;

    info!(target = "quire::http::admin", deleted, "page cache invalidated");
    Ok(Json(Deleted { deleted }))
}

async fn store_stats(State(ctx): State<AppContext>) -> Json<StoreStats> {
    Json(ctx.shared_state.stats().await)
}

async fn invalidate_posts_lists(State(ctx): State<AppContext>) -> Result<Json<Deleted>, ApiError> {
    let deleted = ctx
        .shared_state
        .invalidate_posts_lists()
        .await
        .map_err(AppError::from)?;
    Ok(Json(Deleted { deleted }))
}

async fn invalidate_post(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<Deleted>, ApiError> {
    let deleted = ctx
        .shared_state
        .invalidate_post(&id)
        .await
        .map_err(AppError::from)?;
    info!(target = "quire::http::admin", post = %id, deleted, "post cache invalidated");
    Ok(Json(Deleted { deleted }))
}

async fn reset_all_rate_limits(State(ctx): State<AppContext>) -> Result<Json<Deleted>, ApiError> {
    let deleted = ctx.rate_limiter.reset_all().await.map_err(AppError::from)?;
    Ok(Json(Deleted { deleted }))
}

async fn reset_rate_limit_scope(
    State(ctx): State<AppContext>,
    Path(scope): Path<String>,
) -> Result<Json<Deleted>, ApiError> {
    let scope = parse_scope(&scope)?;
    let deleted = ctx
        .rate_limiter
        .reset_scope(scope)
        .await
        .map_err(AppError::from)?;
    Ok(Json(Deleted { deleted }))
}

async fn reset_rate_limit(
    State(ctx): State<AppContext>,
    Path((scope, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let scope = parse_scope(&scope)?;
    let existed = ctx
        .rate_limiter
        .reset(scope, &id)
        .await
        .map_err(AppError::from)?;
    Ok(if existed {
        StatusCode::NO_CONTENT.into_response()
    } else {
        ApiError::not_found("No counter for this identifier").into_response()
    })
}

async fn rate_limit_status(
    State(ctx): State<AppContext>,
    Path((scope, id)): Path<(String, String)>,
) -> Result<Json<RateLimitStatus>, ApiError> {
    let scope = parse_scope(&scope)?;
    let status = ctx
        .rate_limiter
        .status(scope, &id)
        .await
        .map_err(AppError::from)?;
    Ok(Json(status))
}

async fn migration_status(
    State(ctx): State<AppContext>,
) -> Result<Json<Vec<MigrationStatus>>, ApiError> {
    let status = ctx.migrations.status().await.map_err(AppError::from)?;
    Ok(Json(status))
}

async fn list_backups(
    State(ctx): State<AppContext>,
) -> Result<Json<Vec<BackupMetadata>>, ApiError> {
    let backups = ctx.backups.list_backups().await.map_err(AppError::from)?;
    Ok(Json(backups))
}

async fn create_backup(State(ctx): State<AppContext>) -> Result<Response, ApiError> {
    let metadata = ctx.backups.create_backup().await.map_err(AppError::from)?;
    Ok((StatusCode::CREATED, Json(metadata)).into_response())
}
