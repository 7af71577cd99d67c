//! Common error kinds shared by every layer of the orchestrator.

use thiserror::Error;

/// Top-level error kinds surfaced to API clients and logged by every layer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("cluster error: {0}")]
    Cluster(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("job not found: {0}")]
    NotFound(String),
}

impl Error {
    #[must_use]
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        Error::InvalidParameters(format!("{field}: {}", message.into()))
    }
}
