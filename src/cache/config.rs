//! Page cache configuration.

use std::time::Duration;

use crate::config::PageCacheSettings;

const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 256;
const DEFAULT_WRITE_WORKERS: usize = 2;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    /// Path prefixes that are never cached.
    pub skip_paths: Vec<String>,
    /// Query parameters ignored when fingerprinting (cache busters).
    pub skip_query_params: Vec<String>,
    /// Cache responses for authenticated callers, keyed by identity.
    pub cache_private: bool,
    pub write_queue_capacity: usize,
    pub write_workers: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: DEFAULT_TTL,
            skip_paths: vec![
                "/api/auth/".to_string(),
                "/api/users/".to_string(),
                "/admin/".to_string(),
            ],
            skip_query_params: vec![
                "_".to_string(),
                "timestamp".to_string(),
                "nocache".to_string(),
            ],
            cache_private: false,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            write_workers: DEFAULT_WRITE_WORKERS,
        }
    }
}

impl From<&PageCacheSettings> for CacheConfig {
    fn from(settings: &PageCacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            ttl: settings.ttl,
            skip_paths: settings.skip_paths.clone(),
            skip_query_params: settings.skip_query_params.clone(),
            cache_private: settings.cache_private,
            write_queue_capacity: settings.write_queue_capacity.max(1),
            write_workers: settings.write_workers.max(1),
        }
    }
}

impl CacheConfig {
    pub fn is_skipped_path(&self, path: &str) -> bool {
        self.skip_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub fn is_skipped_param(&self, name: &str) -> bool {
        self.skip_query_params.iter().any(|param| param == name)
    }
}
