use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::application::context::AppContext;
use crate::application::error::AppError;
use crate::application::health::HealthStatus;
use crate::application::migrations::MIGRATIONS_DB;
use crate::application::rate_limit::RateScope;
use crate::cache::{cache_control, page_cache_layer};
use crate::infra::docstore::FindQuery;

use super::error::ApiError;
use super::middleware::{log_responses, set_request_context};
use super::rate_limit::{ScopedLimiter, enforce_rate_limit};

const DEFAULT_FIND_LIMIT: usize = 25;
const MAX_FIND_LIMIT: usize = 200;

/// Public surface: document reads behind the page cache, a login-attempt
/// hook for the auth budget, and an aggregate health endpoint.
pub fn build_public_router(ctx: AppContext) -> Router {
    let cache = ctx.page_cache.clone();
    let limiter = ctx.rate_limiter.clone();

    let reads = Router::new()
        .route("/api/{collection}", get(find_documents))
        .route("/api/{collection}/{id}", get(get_document))
        .layer(from_fn_with_state(cache.clone(), page_cache_layer))
        .layer(from_fn_with_state(cache, cache_control));

    let auth = Router::new()
        .route("/api/auth/login-attempt", post(login_attempt))
        .layer(from_fn_with_state(
            ScopedLimiter::new(limiter.clone(), RateScope::Auth),
            enforce_rate_limit,
        ));

    let api = reads.merge(auth).layer(from_fn_with_state(
        ScopedLimiter::new(limiter.clone(), RateScope::User),
        enforce_rate_limit,
    ));

    // Every public route also counts against the per-IP api budget,
    // whoever the caller is.
    Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(from_fn_with_state(
            ScopedLimiter::new(limiter, RateScope::Api),
            enforce_rate_limit,
        ))
        .layer(from_fn(log_responses))
        .layer(from_fn(set_request_context))
        .with_state(ctx)
}

/// Configured collections other than the migration ledger.
fn ensure_readable(ctx: &AppContext, collection: &str) -> Result<(), ApiError> {
    let known = ctx
        .settings
        .database
        .collections
        .iter()
        .any(|name| name == collection);
    if known && collection != MIGRATIONS_DB {
        Ok(())
    } else {
        Err(ApiError::not_found("Unknown collection"))
    }
}

async fn get_document(
    State(ctx): State<AppContext>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    ensure_readable(&ctx, &collection)?;

    let handle = ctx.pool.acquire();
    let document = ctx
        .query_metrics
        .track(&format!("get:{collection}"), handle.get(&collection, &id))
        .await
        .map_err(AppError::from)?;

    document
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Document not found"))
}

#[derive(Debug, Serialize)]
struct FindResponse {
    docs: Vec<Value>,
    count: usize,
}

/// Equality filter built from the query string. `limit` bounds the result;
/// cache-busting parameters are ignored.
async fn find_documents(
    State(ctx): State<AppContext>,
    Path(collection): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<FindResponse>, ApiError> {
    ensure_readable(&ctx, &collection)?;

    let mut query = FindQuery::new().limit(DEFAULT_FIND_LIMIT);
    for (name, raw) in &params {
        if name == "limit" {
            let limit = raw.parse::<usize>().map_err(|_| {
                ApiError::bad_request(
                    "Invalid limit",
                    Some(format!("`{raw}` is not a positive integer")),
                )
            })?;
            query = query.limit(limit.clamp(1, MAX_FIND_LIMIT));
            continue;
        }
        if ctx.page_cache.config().is_skipped_param(name) {
            continue;
        }
        query = query.field(name.clone(), selector_value(raw));
    }

    let handle = ctx.pool.acquire();
    let docs = ctx
        .query_metrics
        .track(&format!("find:{collection}"), handle.find(&collection, &query))
        .await
        .map_err(AppError::from)?;

    Ok(Json(FindResponse {
        count: docs.len(),
        docs,
    }))
}

/// Booleans and numbers match typed fields; everything else is a string.
fn selector_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Bool(_) | Value::Number(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}

async fn login_attempt() -> Response {
    (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))).into_response()
}

#[derive(Debug, Serialize)]
struct HealthSummary {
    status: HealthStatus,
    open_issues: usize,
    #[serde(with = "time::serde::rfc3339")]
    checked_at: OffsetDateTime,
}

async fn health(State(ctx): State<AppContext>) -> Response {
    let status = ctx.health.status();
    let summary = HealthSummary {
        status,
        open_issues: ctx
            .health
            .issues()
            .iter()
            .filter(|issue| !issue.resolved)
            .count(),
        checked_at: OffsetDateTime::now_utc(),
    };
    let code = match status {
        HealthStatus::Critical => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Warning => StatusCode::OK,
    };
    (code, Json(summary)).into_response()
}
