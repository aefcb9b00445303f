use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use clap::Parser;
use http_body_util::BodyExt;
use quire::application::context::AppContext;
use quire::cache::{
    CACHE_KEY_HEADER, CACHE_STATUS_HEADER, CacheConfig, CacheWriter, PageCache, RequestShape,
};
use quire::config::{self, CliArgs, Settings};
use quire::infra::docstore::{DocumentStore, MemoryConnector, MemoryDocumentStore};
use quire::infra::http::{build_admin_router, build_public_router};
use quire::infra::kv::MemoryStore;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn settings() -> Settings {
    config::load(&CliArgs::parse_from(["quire"])).expect("default settings")
}

struct Harness {
    ctx: AppContext,
    store: MemoryDocumentStore,
    public: Router,
    admin: Router,
}

async fn harness() -> Harness {
    let store = MemoryDocumentStore::new();
    store.create_database("posts").await.unwrap();
    store.create_database("contacts").await.unwrap();
    for (id, status) in [("p1", "published"), ("p2", "draft")] {
        store
            .put("posts", json!({"_id": id, "title": id, "status": status}))
            .await
            .unwrap();
    }
    store
        .put("contacts", json!({"_id": "c1", "email": "a@example.com"}))
        .await
        .unwrap();

    let ctx = AppContext::assemble(
        settings(),
        Arc::new(MemoryStore::new()),
        &MemoryConnector::new(store.handle()),
    )
    .await
    .expect("context assembles");
    Harness {
        public: build_public_router(ctx.clone()),
        admin: build_admin_router(ctx.clone()),
        ctx,
        store,
    }
}

async fn get(app: &Router, uri: &str) -> Response {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

fn header(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn body(response: Response) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

#[tokio::test(start_paused = true)]
async fn entries_live_exactly_as_long_as_their_ttl() {
    let store = Arc::new(MemoryStore::new());
    let writer = CacheWriter::spawn(store.clone(), 8, 1, CancellationToken::new());
    let cache = PageCache::new(store, CacheConfig::default(), writer);
    let key = cache.key_for(&RequestShape::new(Method::GET, "/api/posts/p1"));

    cache
        .store(
            &key,
            Bytes::from_static(b"{\"ok\":true}"),
            Some("application/json"),
            Duration::from_secs(600),
        )
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(599)).await;
    let page = cache.lookup(&key).await.expect("live at 599s");
    assert_eq!(page.body, Bytes::from_static(b"{\"ok\":true}"));
    assert_eq!(page.content_type, "application/json");

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(cache.lookup(&key).await.is_none(), "expired at 601s");
}

#[tokio::test]
async fn second_read_is_a_byte_identical_hit() {
    let h = harness().await;

    let first = get(&h.public, "/api/posts/p1").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header(&first, CACHE_STATUS_HEADER).as_deref(), Some("MISS"));
    let key = header(&first, CACHE_KEY_HEADER).expect("fingerprint header");
    let content_type = header(&first, header::CONTENT_TYPE.as_str());
    let original = body(first).await;
    h.ctx.page_cache.flush().await;

    // A changed document does not show through a live entry.
    let current = h.store.get("posts", "p1").await.unwrap().unwrap();
    let mut updated = current.clone();
    updated["title"] = json!("changed");
    h.store.put("posts", updated).await.unwrap();

    let second = get(&h.public, "/api/posts/p1").await;
    assert_eq!(header(&second, CACHE_STATUS_HEADER).as_deref(), Some("HIT"));
    assert_eq!(header(&second, CACHE_KEY_HEADER), Some(key));
    assert_eq!(header(&second, header::CONTENT_TYPE.as_str()), content_type);
    assert!(
        header(&second, header::CACHE_CONTROL.as_str())
            .is_some_and(|value| value.starts_with("public, max-age="))
    );
    assert_eq!(body(second).await, original);
}

#[tokio::test]
async fn query_parameters_shape_the_key_except_cache_busters() {
    let h = harness().await;

    let published = get(&h.public, "/api/posts?status=published").await;
    let published_key = header(&published, CACHE_KEY_HEADER).unwrap();
    let listing: Value = serde_json::from_slice(&body(published).await).unwrap();
    assert_eq!(listing["count"], 1);
    h.ctx.page_cache.flush().await;

    let busted = get(&h.public, "/api/posts?status=published&_=1700000000").await;
    assert_eq!(header(&busted, CACHE_STATUS_HEADER).as_deref(), Some("HIT"));
    assert_eq!(header(&busted, CACHE_KEY_HEADER).unwrap(), published_key);

    let drafts = get(&h.public, "/api/posts?status=draft").await;
    assert_eq!(header(&drafts, CACHE_STATUS_HEADER).as_deref(), Some("MISS"));
    assert_ne!(header(&drafts, CACHE_KEY_HEADER).unwrap(), published_key);
}

#[tokio::test]
async fn failures_and_mutations_are_never_stored() {
    let h = harness().await;

    for _ in 0..2 {
        let missing = get(&h.public, "/api/posts/nope").await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(header(&missing, CACHE_STATUS_HEADER).as_deref(), Some("MISS"));
        assert_eq!(
            header(&missing, header::CACHE_CONTROL.as_str()).as_deref(),
            Some("no-store")
        );
        h.ctx.page_cache.flush().await;
    }

    let login = h
        .public
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/auth/login-attempt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(login.status(), StatusCode::ACCEPTED);
    assert!(header(&login, CACHE_STATUS_HEADER).is_none());

    h.ctx.page_cache.flush().await;
    assert_eq!(h.ctx.page_cache.writer_stats().enqueued, 0);
}

#[tokio::test]
async fn client_opt_out_bypasses_the_cache() {
    let h = harness().await;
    let response = h
        .public
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/posts/p1")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(header(&response, CACHE_STATUS_HEADER).is_none());
}

#[tokio::test]
async fn admin_invalidation_by_path_leaves_other_entries() {
    let h = harness().await;
    for uri in ["/api/posts/p1", "/api/posts/p2", "/api/contacts/c1"] {
        assert_eq!(get(&h.public, uri).await.status(), StatusCode::OK);
    }
    h.ctx.page_cache.flush().await;

    let response = h
        .admin
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/cache/invalidate")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"path":"/api/posts/*"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json: Value = serde_json::from_slice(&body(response).await).unwrap();
    assert_eq!(json["deleted"], 2);

    let post = get(&h.public, "/api/posts/p1").await;
    assert_eq!(header(&post, CACHE_STATUS_HEADER).as_deref(), Some("MISS"));
    let contact = get(&h.public, "/api/contacts/c1").await;
    assert_eq!(header(&contact, CACHE_STATUS_HEADER).as_deref(), Some("HIT"));
}
