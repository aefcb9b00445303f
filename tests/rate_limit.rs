use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use clap::Parser;
use http_body_util::BodyExt;
use quire::application::context::AppContext;
use quire::application::identity::CallerIdentity;
use quire::application::rate_limit::{RateLimiter, RateScope};
use quire::config::{self, CliArgs, RateBudget, Settings};
use quire::infra::docstore::{DocumentStore, MemoryConnector, MemoryDocumentStore};
use quire::infra::http::{LIMIT_HEADER, REMAINING_HEADER, build_public_router};
use quire::infra::kv::MemoryStore;
use serde_json::{Value, json};
use tower::ServiceExt;

const CLIENT: &str = "198.51.100.7";

fn settings() -> Settings {
    config::load(&CliArgs::parse_from(["quire"])).expect("default settings")
}

fn budget(limit: u32, window_secs: u64) -> RateBudget {
    RateBudget {
        limit: NonZeroU32::new(limit).expect("non-zero limit"),
        window: Duration::from_secs(window_secs),
    }
}

async fn router(settings: Settings) -> Router {
    let store = MemoryDocumentStore::new();
    store.create_database("posts").await.unwrap();
    store
        .put("posts", json!({"_id": "p1", "title": "Hello"}))
        .await
        .unwrap();

    let ctx = AppContext::assemble(
        settings,
        Arc::new(MemoryStore::new()),
        &MemoryConnector::new(store),
    )
    .await
    .expect("context assembles");
    build_public_router(ctx)
}

fn get_post(ip: &str) -> Request<Body> {
    Request::builder()
        .uri("/api/posts/p1")
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

fn header_value(response: &axum::response::Response, name: &str) -> String {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test(start_paused = true)]
async fn window_admits_exactly_the_limit_then_resets() {
    let mut settings = settings();
    settings.rate_limit.api = budget(5, 60);
    let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), &settings.rate_limit);

    for expected in 1..=5 {
        let decision = limiter.check(RateScope::Api, CLIENT).await;
        assert!(decision.allowed, "request {expected} should be allowed");
        assert_eq!(decision.count, expected);
    }

    let rejected = limiter.check(RateScope::Api, CLIENT).await;
    assert!(!rejected.allowed);
    assert_eq!(rejected.remaining, 0);
    assert!(rejected.retry_after <= Duration::from_secs(60));
    assert!(rejected.retry_after_secs() >= 1);

    tokio::time::advance(Duration::from_secs(61)).await;

    let fresh = limiter.check(RateScope::Api, CLIENT).await;
    assert!(fresh.allowed);
    assert_eq!(fresh.count, 1);
}

#[tokio::test]
async fn scope_reset_makes_every_identifier_eligible_again() {
    let mut settings = settings();
    settings.rate_limit.auth = budget(1, 3_600);
    let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), &settings.rate_limit);

    for ip in ["192.0.2.1", "192.0.2.2"] {
        assert!(limiter.check(RateScope::Auth, ip).await.allowed);
        assert!(!limiter.check(RateScope::Auth, ip).await.allowed);
    }
    assert!(limiter.check(RateScope::Api, "192.0.2.1").await.allowed);

    assert_eq!(limiter.reset_scope(RateScope::Auth).await.unwrap(), 2);

    for ip in ["192.0.2.1", "192.0.2.2"] {
        assert!(limiter.check(RateScope::Auth, ip).await.allowed);
    }
    let api = limiter.status(RateScope::Api, "192.0.2.1").await.unwrap();
    assert_eq!(api.count, 1);
}

#[tokio::test]
async fn http_requests_over_budget_get_429_with_retry_after() {
    let mut settings = settings();
    settings.rate_limit.api = budget(5, 60);
    let app = router(settings).await;

    for expected_remaining in (0..5).rev() {
        let response = app.clone().oneshot(get_post(CLIENT)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_value(&response, LIMIT_HEADER), "5");
        assert_eq!(
            header_value(&response, REMAINING_HEADER),
            expected_remaining.to_string()
        );
    }

    let response = app.clone().oneshot(get_post(CLIENT)).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_value(&response, REMAINING_HEADER), "0");
    let retry_after: u64 = header_value(&response, header::RETRY_AFTER.as_str())
        .parse()
        .expect("numeric Retry-After");
    assert!((1..=60).contains(&retry_after));

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "rate_limited");

    let other = app.oneshot(get_post("203.0.113.9")).await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn login_attempts_use_the_auth_budget() {
    let mut settings = settings();
    settings.rate_limit.auth = budget(2, 3_600);
    let app = router(settings).await;

    let attempt = || {
        Request::builder()
            .method(Method::POST)
            .uri("/api/auth/login-attempt")
            .header("x-real-ip", CLIENT)
            .body(Body::empty())
            .unwrap()
    };

    for _ in 0..2 {
        let response = app.clone().oneshot(attempt()).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(header_value(&response, LIMIT_HEADER), "2");
    }

    let response = app.clone().oneshot(attempt()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_value(&response, LIMIT_HEADER), "2");

    // Reads from the same address are still within the api budget.
    let read = app.oneshot(get_post(CLIENT)).await.unwrap();
    assert_eq!(read.status(), StatusCode::OK);
}

#[tokio::test]
async fn authenticated_callers_are_limited_per_user() {
    let mut settings = settings();
    settings.rate_limit.user = budget(1, 60);
    let app = router(settings).await;

    let as_user = |user: &str| {
        let mut request = get_post(CLIENT);
        request.extensions_mut().insert(CallerIdentity::new(user));
        request
    };

    let first = app.clone().oneshot(as_user("u-1")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header_value(&first, LIMIT_HEADER), "1");

    let second = app.clone().oneshot(as_user("u-1")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

    let other_user = app.clone().oneshot(as_user("u-2")).await.unwrap();
    assert_eq!(other_user.status(), StatusCode::OK);

    let anonymous = app.oneshot(get_post(CLIENT)).await.unwrap();
    assert_eq!(anonymous.status(), StatusCode::OK);
    assert_eq!(header_value(&anonymous, LIMIT_HEADER), "100");
}

#[tokio::test]
async fn authenticated_callers_still_share_the_per_ip_budget() {
    let mut settings = settings();
    settings.rate_limit.api = budget(2, 60);
    settings.rate_limit.user = budget(100, 60);
    let app = router(settings).await;

    // Rotating identities from one address does not escape the address budget.
    for user in ["u-1", "u-2"] {
        let mut request = get_post(CLIENT);
        request.extensions_mut().insert(CallerIdentity::new(user));
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_value(&response, LIMIT_HEADER), "100");
    }

    let mut request = get_post(CLIENT);
    request.extensions_mut().insert(CallerIdentity::new("u-3"));
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_value(&response, LIMIT_HEADER), "2");

    let health = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-forwarded-for", CLIENT)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::TOO_MANY_REQUESTS);

    let elsewhere = app.oneshot(get_post("203.0.113.9")).await.unwrap();
    assert_eq!(elsewhere.status(), StatusCode::OK);
}
