use thiserror::Error;

use super::docstore::DocStoreError;
use super::kv::StoreError;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key-value store error: {0}")]
    Store(#[from] StoreError),
    #[error("document store error: {0}")]
    Database(#[from] DocStoreError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl InfraError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    /// Whether retrying the failed operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            InfraError::Store(err) => err.is_retryable(),
            InfraError::Database(err) => err.is_retryable(),
            InfraError::Io(_) | InfraError::Telemetry(_) | InfraError::Configuration { .. } => {
                false
            }
        }
    }
}
