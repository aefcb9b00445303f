//! Page cache middleware.
//!
//! Serves cacheable reads from the shared store and hands fresh 2xx bodies to
//! the background writers. Every response that went through the cache carries
//! `X-Cache: HIT|MISS` and `X-Cache-Key`.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http_body_util::BodyExt;
use tracing::{debug, instrument, warn};

use crate::application::identity::{CallerIdentity, presented_credentials};

use super::entry::CachedPage;
use super::keys::RequestShape;
use super::store::PageCache;

pub const CACHE_STATUS_HEADER: &str = "x-cache";
pub const CACHE_KEY_HEADER: &str = "x-cache-key";

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(cache): State<PageCache>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let shape = request_shape(&request);
    if let Some(reason) = cache.bypass(&shape, client_opted_out(request.headers())) {
        debug!(cache = "page", outcome = "bypass", reason = reason.as_str());
        return next.run(request).await;
    }

    let key = cache.key_for(&shape);
    if let Some(page) = cache.lookup(&key).await {
        debug!(cache = "page", outcome = "hit", "serving cached page");
        return build_response(page, key.fingerprint());
    }

    debug!(cache = "page", outcome = "miss", "cache miss, executing handler");
    let response = next.run(request).await;

    let mut response = if should_store_response(&response) {
        match buffer_response(response).await {
            Ok((response, body)) => {
                let content_type = response
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok());
                cache.store_detached(&key, body, content_type);
                response
            }
            Err((response, error)) => {
                warn!(
                    target = "quire::page_cache",
                    error = %error,
                    "failed to buffer response for caching"
                );
                response
            }
        }
    } else {
        response
    };

    mark(response.headers_mut(), "MISS", key.fingerprint());
    response
}

/// Sets `Cache-Control` on responses that do not set it themselves:
/// `public, max-age=<ttl>` for cacheable successful reads, `no-store`
/// otherwise.
pub async fn cache_control(
    State(cache): State<PageCache>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let shape = request_shape(&request);
    let cacheable = request.method() == Method::GET
        && cache
            .bypass(&shape, client_opted_out(request.headers()))
            .is_none();

    let mut response = next.run(request).await;
    if response.headers().contains_key(header::CACHE_CONTROL) {
        return response;
    }

    let value = if cacheable && response.status().is_success() {
        HeaderValue::from_str(&format!("public, max-age={}", cache.config().ttl.as_secs()))
            .unwrap_or_else(|_| HeaderValue::from_static("no-store"))
    } else {
        HeaderValue::from_static("no-store")
    };
    response.headers_mut().insert(header::CACHE_CONTROL, value);
    response
}

fn request_shape(request: &Request<Body>) -> RequestShape {
    let mut shape = RequestShape::from_parts(request.method(), request.uri());
    shape.identity = CallerIdentity::from_request(request)
        .map(|identity| identity.user_id.clone())
        .or_else(|| presented_credentials(request.headers()).map(str::to_string));
    shape
}

fn client_opted_out(headers: &HeaderMap) -> bool {
    [header::CACHE_CONTROL, header::PRAGMA].iter().any(|name| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| {
                let value = value.to_ascii_lowercase();
                value.contains("no-cache") || value.contains("no-store")
            })
    })
}

fn mark(headers: &mut HeaderMap, status: &'static str, fingerprint: &str) {
    headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static(status));
    if let Ok(value) = HeaderValue::from_str(fingerprint) {
        headers.insert(CACHE_KEY_HEADER, value);
    }
}

fn build_response(page: CachedPage, fingerprint: &str) -> Response {
    let mut response = (StatusCode::OK, Body::from(page.body)).into_response();
    match HeaderValue::from_str(&page.content_type) {
        Ok(value) => {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
        Err(_) => {
            warn!(
                target = "quire::page_cache",
                content_type = %page.content_type,
                "cached content type is not a valid header value"
            );
        }
    }
    mark(response.headers_mut(), "HIT", fingerprint);
    response
}

/// Only successful, cookie-free, non-streaming responses are cacheable.
pub fn should_store_response(response: &Response) -> bool {
    if !response.status().is_success() {
        return false;
    }

    if response.headers().contains_key(header::SET_COOKIE) {
        return false;
    }

    if response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
    {
        return false;
    }

    true
}

/// Collect a response body so it can be both sent and cached.
pub async fn buffer_response(response: Response) -> Result<(Response, Bytes), (Response, String)> {
    let (parts, body) = response.into_parts();
    match BodyExt::collect(body).await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            let rebuilt = Response::from_parts(parts, Body::from(bytes.clone()));
            Ok((rebuilt, bytes))
        }
        Err(error) => {
            let rebuilt = Response::from_parts(parts, Body::empty());
            Err((rebuilt, error.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_plain_success_is_stored() {
        assert!(should_store_response(&StatusCode::OK.into_response()));
        assert!(should_store_response(&StatusCode::NO_CONTENT.into_response()));
        assert!(!should_store_response(&StatusCode::NOT_FOUND.into_response()));
        assert!(!should_store_response(
            &StatusCode::INTERNAL_SERVER_ERROR.into_response()
        ));

        let mut with_cookie = StatusCode::OK.into_response();
        with_cookie
            .headers_mut()
            .insert(header::SET_COOKIE, HeaderValue::from_static("session=1"));
        assert!(!should_store_response(&with_cookie));

        let mut stream = StatusCode::OK.into_response();
        stream.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        assert!(!should_store_response(&stream));
    }

    #[test]
    fn opt_out_headers_are_recognised() {
        let mut headers = HeaderMap::new();
        assert!(!client_opted_out(&headers));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("No-Cache"));
        assert!(client_opted_out(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        assert!(client_opted_out(&headers));
    }

    #[tokio::test]
    async fn buffering_preserves_the_body() {
        let response = (StatusCode::OK, "hello").into_response();
        let (rebuilt, bytes) = buffer_response(response).await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"hello"));

        let body = rebuilt.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, bytes);
    }
}
