//! Shared page cache.
//!
//! Rendered responses for anonymous reads are stored in the key-value store
//! under `page_cache:<path>|<fingerprint>` with a fixed TTL, so every server
//! instance sees the same entries and invalidation by path glob reaches all
//! of them.
//!
//! - [`CacheKey`] derives the key from a [`RequestShape`].
//! - [`PageCache`] looks entries up, stores them and invalidates them.
//! - [`CacheWriter`] performs stores off the request path.
//! - [`page_cache_layer`] and [`cache_control`] wire it into axum.

mod config;
mod entry;
mod keys;
mod middleware;
mod store;
mod writer;

pub use config::CacheConfig;
pub use entry::{CachedPage, DEFAULT_CONTENT_TYPE};
pub use keys::{CacheKey, RequestShape};
pub use middleware::{
    CACHE_KEY_HEADER, CACHE_STATUS_HEADER, buffer_response, cache_control, page_cache_layer,
    should_store_response,
};
pub use store::{Bypass, PageCache};
pub use writer::{CacheWriter, CacheWriterStats};
