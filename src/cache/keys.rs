//! Page cache key derivation.
//!
//! A key is `page_cache:<path>|<fingerprint>`. The fingerprint is a SHA-256
//! over method, path, the filtered and sorted query, and (for private
//! caching) the caller identity. Each field is length-prefixed and the query
//! is percent-encoded, so no choice of parameter values can make two
//! distinct requests hash the same material. Keeping the path in clear text
//! lets invalidation target request paths with a glob.

use axum::extract::Query;
use axum::http::{Method, Uri};
use sha2::{Digest, Sha256};
use url::form_urlencoded;

use crate::infra::kv::keys;

use super::config::CacheConfig;

/// The parts of a request that decide which cache entry it maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestShape {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub identity: Option<String>,
}

impl RequestShape {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            identity: None,
        }
    }

    /// Build from a request line. An unparsable query string is treated as
    /// empty.
    pub fn from_parts(method: &Method, uri: &Uri) -> Self {
        let query = Query::<Vec<(String, String)>>::try_from_uri(uri)
            .map(|Query(pairs)| pairs)
            .unwrap_or_default();
        Self {
            method: method.clone(),
            path: uri.path().to_string(),
            query,
            identity: None,
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    path: String,
    fingerprint: String,
}

impl CacheKey {
    pub fn derive(shape: &RequestShape, config: &CacheConfig) -> Self {
        let mut query: Vec<_> = shape
            .query
            .iter()
            .filter(|(name, _)| !config.is_skipped_param(name))
            .collect();
        query.sort();
        let encoded = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(query.iter().map(|(name, value)| (name.as_str(), value.as_str())))
            .finish();

        let mut hasher = Sha256::new();
        hash_field(&mut hasher, shape.method.as_str());
        hash_field(&mut hasher, &shape.path);
        hash_field(&mut hasher, &encoded);
        match shape.identity.as_deref().filter(|_| config.cache_private) {
            Some(identity) => {
                hasher.update([1]);
                hash_field(&mut hasher, identity);
            }
            None => hasher.update([0]),
        }

        Self {
            path: shape.path.clone(),
            fingerprint: hex::encode(hasher.finalize()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn storage_key(&self) -> String {
        keys::page_cache(&format!("{}|{}", self.path, self.fingerprint))
    }
}

fn hash_field(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_be_bytes());
    hasher.update(field.as_bytes());
}

/// Pattern over every entry for requests whose path matches `path_pattern`.
pub(crate) fn path_pattern(path_pattern: &str) -> String {
    keys::page_cache(&format!("{path_pattern}|*"))
}
