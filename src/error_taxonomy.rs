//! Shared error taxonomy across the store, the provider client, the run
//! coordinator and the HTTP surface.

use crate::llm_client::ProviderError;
use crate::thread_store::StoreError;

/// Broad category for typed error handling and status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NotFound,
    InvalidInput,
    Conflict,
    Network,
    Authentication,
    RateLimit,
    Upstream,
    Parse,
    Persistence,
    Internal,
}

/// Severity hint for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Unified envelope used when crossing subsystem boundaries.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    pub code: String,
    pub message: String,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        recoverable: bool,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            recoverable,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Errors surfaced by thread and run operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("Thread {thread_id} already has an active run")]
    RunConflict { thread_id: String },
    #[error("Upstream provider error: {0}")]
    UpstreamProvider(#[from] ProviderError),
    #[error("Persistence error: {0}")]
    Persistence(StoreError),
}

impl RuntimeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.envelope().category
    }

    #[must_use]
    pub fn envelope(&self) -> ErrorEnvelope {
        match self {
            RuntimeError::ThreadNotFound(thread_id) => ErrorEnvelope::new(
                ErrorCategory::NotFound,
                ErrorSeverity::Info,
                false,
                "thread_not_found",
                format!("Thread not found: {thread_id}"),
            ),
            RuntimeError::Validation(message) => ErrorEnvelope::new(
                ErrorCategory::InvalidInput,
                ErrorSeverity::Info,
                false,
                "invalid_request",
                message.clone(),
            ),
            RuntimeError::RunConflict { thread_id } => ErrorEnvelope::new(
                ErrorCategory::Conflict,
                ErrorSeverity::Warning,
                true,
                "run_conflict",
                format!("Thread {thread_id} already has an active run"),
            ),
            RuntimeError::UpstreamProvider(err) => ErrorEnvelope::from(err),
            RuntimeError::Persistence(err) => ErrorEnvelope::from(err),
        }
    }
}

impl From<StoreError> for RuntimeError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::ThreadNotFound(thread_id) => RuntimeError::ThreadNotFound(thread_id),
            StoreError::DuplicateMessage { message_id, .. } => {
                RuntimeError::Validation(format!("Duplicate message id: {message_id}"))
            }
            other => RuntimeError::Persistence(other),
        }
    }
}

impl From<&ProviderError> for ErrorEnvelope {
    fn from(value: &ProviderError) -> Self {
        match value {
            ProviderError::RateLimited { message, .. } => Self::new(
                ErrorCategory::RateLimit,
                ErrorSeverity::Warning,
                true,
                "llm_rate_limited",
                message.clone(),
            ),
            ProviderError::ServerError { status, message } => Self::new(
                ErrorCategory::Upstream,
                ErrorSeverity::Error,
                true,
                format!("llm_server_{status}"),
                message.clone(),
            ),
            ProviderError::NetworkError(message) => Self::new(
                ErrorCategory::Network,
                ErrorSeverity::Error,
                true,
                "llm_network_error",
                message.clone(),
            ),
            ProviderError::AuthenticationError(message) => Self::new(
                ErrorCategory::Authentication,
                ErrorSeverity::Critical,
                false,
                "llm_auth_error",
                message.clone(),
            ),
            ProviderError::InvalidRequest { message, .. } => Self::new(
                ErrorCategory::Upstream,
                ErrorSeverity::Error,
                false,
                "llm_invalid_request",
                message.clone(),
            ),
            ProviderError::ParseError(message) => Self::new(
                ErrorCategory::Parse,
                ErrorSeverity::Error,
                false,
                "llm_parse_error",
                message.clone(),
            ),
            ProviderError::Other(message) => Self::new(
                ErrorCategory::Upstream,
                ErrorSeverity::Error,
                true,
                "llm_other",
                message.clone(),
            ),
        }
    }
}

impl From<&StoreError> for ErrorEnvelope {
    fn from(value: &StoreError) -> Self {
        match value {
            StoreError::ThreadNotFound(thread_id) => Self::new(
                ErrorCategory::NotFound,
                ErrorSeverity::Info,
                false,
                "thread_not_found",
                format!("Thread not found: {thread_id}"),
            ),
            StoreError::DuplicateMessage { .. } => Self::new(
                ErrorCategory::InvalidInput,
                ErrorSeverity::Warning,
                false,
                "duplicate_message",
                value.to_string(),
            ),
            StoreError::Sqlite(_) | StoreError::Io(_) => Self::new(
                ErrorCategory::Persistence,
                ErrorSeverity::Critical,
                true,
                "store_unavailable",
                value.to_string(),
            ),
            StoreError::Corrupt(_) => Self::new(
                ErrorCategory::Persistence,
                ErrorSeverity::Error,
                false,
                "store_corrupt",
                value.to_string(),
            ),
            StoreError::Task(_) => Self::new(
                ErrorCategory::Internal,
                ErrorSeverity::Error,
                true,
                "store_task_failed",
                value.to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_thread_not_found() {
        let err = RuntimeError::from(StoreError::ThreadNotFound("t1".to_string()));
        assert!(matches!(err, RuntimeError::ThreadNotFound(ref id) if id == "t1"));
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }

    #[test]
    fn io_failures_are_persistence_errors() {
        let io = std::io::Error::other("disk full");
        let err = RuntimeError::from(StoreError::Io(io));
        assert_eq!(err.category(), ErrorCategory::Persistence);
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn provider_errors_keep_their_category() {
        let err = RuntimeError::from(ProviderError::RateLimited {
            message: "slow down".to_string(),
            retry_after: None,
        });
        let envelope = err.envelope();
        assert_eq!(envelope.category, ErrorCategory::RateLimit);
        assert!(envelope.recoverable);
        assert_eq!(envelope.code, "llm_rate_limited");
    }

    #[test]
    fn conflict_is_recoverable() {
        let err = RuntimeError::RunConflict {
            thread_id: "t1".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Conflict);
        assert!(err.envelope().recoverable);
    }
}
