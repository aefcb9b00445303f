//! Quire: the coordination layer of a document-backed content-management backend.
//!
//! Request handling flows through the rate limiter and page cache before
//! reaching handlers that borrow document-store handles from the connection
//! pool. Background loops (health checks, metric collection, scheduled
//! backups) observe the same components through a shared [`AppContext`].
//!
//! [`AppContext`]: application::context::AppContext

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
pub mod util;
