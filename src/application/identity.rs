//! Caller identity as seen by the coordination layer.
//!
//! Token validation happens upstream; whichever layer authenticates a request
//! inserts a [`CallerIdentity`] into its extensions. The rate limiter keys the
//! user scope by it and the page cache treats its presence as "private".

use axum::http::{HeaderMap, Request, header};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: String,
}

impl CallerIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn from_request<B>(request: &Request<B>) -> Option<&CallerIdentity> {
        request.extensions().get::<CallerIdentity>()
    }
}

/// Credential material presented by an otherwise unidentified caller.
pub fn presented_credentials(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;

    use super::*;

    #[test]
    fn identity_comes_from_extensions() {
        let mut request = Request::new(Body::empty());
        assert!(CallerIdentity::from_request(&request).is_none());

        request.extensions_mut().insert(CallerIdentity::new("u-42"));
        assert_eq!(
            CallerIdentity::from_request(&request).map(|id| id.user_id.as_str()),
            Some("u-42")
        );
    }

    #[test]
    fn blank_authorization_is_not_a_credential() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, " ".parse().unwrap());
        assert_eq!(presented_credentials(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(presented_credentials(&headers), Some("Bearer abc"));
    }
}
