//! Key-space conventions. Prefixes partition concerns so pattern deletes in
//! one area can never touch keys owned by another.

pub const RATE_LIMIT_PREFIX: &str = "rate_limit";
pub const PAGE_CACHE_PREFIX: &str = "page_cache";
pub const APP_STATE_PREFIX: &str = "app_state";
pub const POSTS_LIST_PREFIX: &str = "posts_list";
pub const POST_PREFIX: &str = "post";
pub const SESSION_PREFIX: &str = "session";
pub const COUNTER_PREFIX: &str = "counter";
pub const USER_STATE_PREFIX: &str = "user_state";

/// `rate_limit:<scope>:<identifier>`
pub fn rate_limit(scope: &str, identifier: &str) -> String {
    format!("{RATE_LIMIT_PREFIX}:{scope}:{identifier}")
}

/// Every counter in one scope.
pub fn rate_limit_scope_pattern(scope: &str) -> String {
    format!("{RATE_LIMIT_PREFIX}:{scope}:*")
}

pub fn rate_limit_all_pattern() -> String {
    format!("{RATE_LIMIT_PREFIX}:*")
}

/// `page_cache:<suffix>`; the page cache decides what the suffix encodes.
pub fn page_cache(suffix: &str) -> String {
    format!("{PAGE_CACHE_PREFIX}:{suffix}")
}

/// `app_state:<key>`
pub fn app_state(key: &str) -> String {
    format!("{APP_STATE_PREFIX}:{key}")
}

/// `posts_list:<query hash>`
pub fn posts_list(query_hash: &str) -> String {
    format!("{POSTS_LIST_PREFIX}:{query_hash}")
}

pub fn posts_list_pattern() -> String {
    format!("{POSTS_LIST_PREFIX}:*")
}

/// `post:<id>`
pub fn post(id: &str) -> String {
    format!("{POST_PREFIX}:{id}")
}

/// `session:<id>`
pub fn session(id: &str) -> String {
    format!("{SESSION_PREFIX}:{id}")
}

/// `counter:<name>`
pub fn counter(name: &str) -> String {
    format!("{COUNTER_PREFIX}:{name}")
}

/// `user_state:<user id>:<key>`
pub fn user_state(user_id: &str, key: &str) -> String {
    format!("{USER_STATE_PREFIX}:{user_id}:{key}")
}
