//! Coordination services shared by request handlers and background tasks.

pub mod backup;
pub mod context;
pub mod error;
pub mod health;
pub mod identity;
pub mod migrations;
pub mod pool;
pub mod query_metrics;
pub mod rate_limit;
pub mod shared_state;
mod tasks;
