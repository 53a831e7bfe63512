//! Narrow interface to the language-model capability.
//!
//! A run hands the provider its conversation and receives a stream of text
//! deltas. Everything provider-specific lives behind [`LlmClient`].

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;

use crate::models::{Message, Role};

/// Ordered text deltas produced by one completion.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

pub type SharedLlmClient = Arc<dyn LlmClient>;

/// Provider failures, classified so retry and logging policy can key off them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<u64>,
    },
    #[error("provider returned HTTP {status}: {message}")]
    ServerError { status: u16, message: String },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("authentication failed: {0}")]
    AuthenticationError(String),
    #[error("provider rejected request (HTTP {status}): {message}")]
    InvalidRequest { status: u16, message: String },
    #[error("malformed provider stream: {0}")]
    ParseError(String),
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Classify a non-success HTTP response.
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = if body.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            body.trim().to_string()
        };
        match status {
            401 | 403 => ProviderError::AuthenticationError(message),
            429 => ProviderError::RateLimited {
                message,
                retry_after: None,
            },
            500..=599 => ProviderError::ServerError { status, message },
            _ => ProviderError::InvalidRequest { status, message },
        }
    }

    /// Attach the server's `Retry-After` hint to a rate-limit error.
    #[must_use]
    pub fn with_retry_after(self, seconds: Option<u64>) -> Self {
        match self {
            ProviderError::RateLimited { message, .. } => ProviderError::RateLimited {
                message,
                retry_after: seconds,
            },
            other => other,
        }
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::ServerError { .. }
                | ProviderError::NetworkError(_)
        )
    }
}

/// A streaming chat-completion provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn provider_name(&self) -> &'static str;

    fn model(&self) -> &str;

    /// Start a completion over `messages`, oldest first.
    ///
    /// Errors returned here happen before any delta was produced.
    async fn stream_completion(&self, messages: &[Message]) -> Result<DeltaStream, ProviderError>;
}

// === Mock provider ===

/// Offline provider that echoes the last human message back word by word.
#[derive(Debug, Clone)]
pub struct MockClient {
    model: String,
    delay: Duration,
}

impl MockClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            delay: Duration::from_millis(20),
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn reply_for(messages: &[Message]) -> String {
        let last_human = messages
            .iter()
            .rev()
            .find(|message| message.role == Role::Human)
            .map(|message| message.content.to_text())
            .unwrap_or_default();
        let lowered = last_human.to_lowercase();
        if lowered.contains("hello") || lowered.contains("你好") {
            "Hello! I'm running in mock mode. Configure a real provider for model replies."
                .to_string()
        } else {
            format!("I received your message: {last_human}")
        }
    }
}

#[async_trait]
impl LlmClient for MockClient {
    fn provider_name(&self) -> &'static str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream_completion(&self, messages: &[Message]) -> Result<DeltaStream, ProviderError> {
        let reply = Self::reply_for(messages);
        let delay = self.delay;
        let stream = async_stream::stream! {
            for word in reply.split_inclusive(' ') {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(word.to_string());
            }
        };
        Ok(Box::pin(stream))
    }
}
