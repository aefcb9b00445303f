//! Per-scope rate limiting middleware.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::Response,
};

use crate::application::identity::CallerIdentity;
use crate::application::rate_limit::{RateLimitDecision, RateLimiter, RateScope};

use super::error::ApiError;

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

const UNKNOWN_CLIENT: &str = "unknown";

/// Middleware state binding the shared limiter to one scope.
#[derive(Debug, Clone)]
pub struct ScopedLimiter {
    limiter: Arc<RateLimiter>,
    scope: RateScope,
}

impl ScopedLimiter {
    pub fn new(limiter: Arc<RateLimiter>, scope: RateScope) -> Self {
        Self { limiter, scope }
    }
}

/// Count the request against the bound scope and reject it with 429 once
/// the budget is spent.
///
/// `api` and `auth` key by client IP. `user` keys by the caller identity and
/// lets anonymous callers through untouched; the router-wide `api` layer
/// already counts them by IP.
pub async fn enforce_rate_limit(
    State(state): State<ScopedLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let decision = match state.scope {
        RateScope::User => match CallerIdentity::from_request(&request) {
            Some(identity) => state.limiter.check(RateScope::User, &identity.user_id).await,
            None => return next.run(request).await,
        },
        scope => state.limiter.check(scope, &client_ip(&request)).await,
    };

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        ApiError::rate_limited(decision.retry_after_secs())
    };
    annotate(response.headers_mut(), &decision);
    response
}

/// Inner layers run first, so the most specific scope's headers win.
fn annotate(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    if headers.contains_key(LIMIT_HEADER) {
        return;
    }
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
}

/// First `X-Forwarded-For` entry, else `X-Real-IP`, else the socket peer.
pub fn client_ip<B>(request: &Request<B>) -> String {
    forwarded_ip(request.headers())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        })
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let from_forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok());
    from_forwarded.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    })
}
