//! Closed error taxonomy (spec §7). Conversion from provider-SDK errors
//! happens at the provider-surface boundary and nowhere else.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Input,
    NotFound,
    Auth,
    Transient,
    NetworkDown,
    Conflict,
    Storage,
    Fatal,
}

impl ErrorCategory {
    /// Retryable iff transient (including the network-down subclass) or a
    /// store reporting a transient storage condition.
    pub fn retryable(self) -> bool {
        matches!(self, ErrorCategory::Transient | ErrorCategory::NetworkDown)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed request: {0}")]
    Input(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("auth failed: {0}")]
    Auth(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("network down: {0}")]
    NetworkDown(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CoreError::Input(_) => ErrorCategory::Input,
            CoreError::NotFound(_) => ErrorCategory::NotFound,
            CoreError::Auth(_) => ErrorCategory::Auth,
            CoreError::Transient(_) => ErrorCategory::Transient,
            CoreError::NetworkDown(_) => ErrorCategory::NetworkDown,
            CoreError::Conflict(_) => ErrorCategory::Conflict,
            CoreError::Storage(_) => ErrorCategory::Storage,
            CoreError::Fatal(_) | CoreError::Cancelled => ErrorCategory::Fatal,
            CoreError::Database(_) => ErrorCategory::Storage,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().retryable()
    }
}
