//! HTTP surfaces: the public read API and the operator admin API.

mod admin;
mod error;
mod middleware;
mod public;
mod rate_limit;

pub use admin::build_admin_router;
pub use error::{ApiError, ApiErrorBody, ApiErrorMessage, codes};
pub use middleware::{REQUEST_ID_HEADER, RequestContext};
pub use public::build_public_router;
pub use rate_limit::{
    LIMIT_HEADER, REMAINING_HEADER, ScopedLimiter, client_ip, enforce_rate_limit,
};
