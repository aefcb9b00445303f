//! Stored page representation.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

use crate::infra::kv::StoreError;

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// A cached response body and its content type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedPage {
    #[serde(serialize_with = "encode_body", deserialize_with = "decode_body")]
    pub body: Bytes,
    pub content_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub cached_at: OffsetDateTime,
    pub ttl_secs: u64,
}

impl CachedPage {
    pub fn new(body: Bytes, content_type: Option<&str>, ttl: Duration) -> Self {
        let content_type = content_type
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        Self {
            body,
            content_type,
            cached_at: OffsetDateTime::now_utc(),
            ttl_secs: ttl.as_secs(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, StoreError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| StoreError::malformed(format!("encode cached page: {err}")))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(raw)
            .map_err(|err| StoreError::malformed(format!("decode cached page: {err}")))
    }
}

fn encode_body<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(body))
}

fn decode_body<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
    let text = String::deserialize(deserializer)?;
    STANDARD
        .decode(text.as_bytes())
        .map(Bytes::from)
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_bodies_survive_storage() {
        let page = CachedPage::new(
            Bytes::from_static(&[0, 159, 146, 150, b'{']),
            Some("application/octet-stream"),
            Duration::from_secs(600),
        );
        let decoded = CachedPage::decode(&page.encode().unwrap()).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn missing_content_type_defaults_to_json() {
        let page = CachedPage::new(Bytes::from_static(b"{}"), None, Duration::from_secs(1));
        assert_eq!(page.content_type, DEFAULT_CONTENT_TYPE);
        let blank = CachedPage::new(Bytes::from_static(b"{}"), Some(" "), Duration::from_secs(1));
        assert_eq!(blank.content_type, DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            CachedPage::decode(b"not json"),
            Err(StoreError::Malformed(_))
        ));
        assert!(matches!(
            CachedPage::decode(br#"{"body":"%%%","content_type":"text/html","cached_at":"2026-10-16T00:00:00Z","ttl_secs":1}"#),
            Err(StoreError::Malformed(_))
        ));
    }
}
