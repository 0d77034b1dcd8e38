use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use super::types::CompletionRequest;

/// Failure talking to an embedding or completion endpoint.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("{0}")]
    Stream(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

impl ProviderError {
    /// Connection failures and 429/5xx answers are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Connection(_) => true,
            ProviderError::Status { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Stream(_) | ProviderError::Timeout(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            ProviderError::Connection(err.to_string())
        } else {
            ProviderError::Stream(err.to_string())
        }
    }
}

/// Increments of one completion. `Ok(None)` is an increment without content.
pub type CompletionStream = BoxStream<'static, Result<Option<String>, ProviderError>>;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Short provider label for logs.
    fn name(&self) -> &str;

    /// Opens a streaming completion. Dropping the stream releases the connection.
    async fn open_stream(&self, request: &CompletionRequest)
        -> Result<CompletionStream, ProviderError>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// One vector per input, in input order.
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        let status = |status| ProviderError::Status {
            status,
            body: String::new(),
        };
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(ProviderError::Connection("refused".into()).is_retryable());
        assert!(!ProviderError::Timeout("slow".into()).is_retryable());
    }
}
