use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::core::errors::RagError;
use crate::llm::ProviderError;

pub const NO_CONTEXT_MESSAGE: &str =
    "Sorry, I couldn't find relevant information in the indexed documents.";

/// One unit of caller-visible output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationToken {
    Text { text: String },
    /// Advisory only; the answer continues after it.
    Retrying {
        attempt: u32,
        max_retries: u32,
        #[serde(with = "millis")]
        delay: Duration,
    },
    NoContext { message: String },
    Error { kind: String, message: String },
    Stopped,
}

impl GenerationToken {
    pub fn text(text: impl Into<String>) -> Self {
        GenerationToken::Text { text: text.into() }
    }

    pub fn no_context() -> Self {
        GenerationToken::NoContext {
            message: NO_CONTEXT_MESSAGE.to_string(),
        }
    }

    pub fn from_rag_error(err: &RagError) -> Self {
        let message = match err {
            RagError::RetrievalUnavailable(_) => {
                format!("couldn't search the indexed documents ({})", err)
            }
            _ => err.to_string(),
        };
        GenerationToken::Error {
            kind: err.kind().to_string(),
            message,
        }
    }

    pub fn from_provider_error(err: &ProviderError) -> Self {
        let kind = match err {
            ProviderError::Connection(_) => "connection",
            ProviderError::Status { .. } => "provider",
            ProviderError::Stream(_) => "stream",
            ProviderError::Timeout(_) => "timeout",
        };
        GenerationToken::Error {
            kind: kind.to_string(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for GenerationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationToken::Text { text } => f.write_str(text),
            GenerationToken::Retrying {
                attempt,
                max_retries,
                ..
            } => write!(f, "[Retrying connection... attempt {}/{}]", attempt, max_retries),
            GenerationToken::NoContext { message } => f.write_str(message),
            GenerationToken::Error { kind, message } => write!(f, "Error ({}): {}", kind, message),
            GenerationToken::Stopped => f.write_str("[Generation stopped by user]"),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(delay.as_millis() as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Idle,
    ContextRetrieved,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

/// Requests cancellation of one generation. Clones share the same flag.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_texts() {
        let retry = GenerationToken::Retrying {
            attempt: 1,
            max_retries: 5,
            delay: Duration::from_secs(1),
        };
        assert_eq!(retry.to_string(), "[Retrying connection... attempt 1/5]");
        assert_eq!(GenerationToken::no_context().to_string(), NO_CONTEXT_MESSAGE);
        assert_eq!(
            GenerationToken::from_rag_error(&RagError::GenerationTimeout(Duration::from_secs(60)))
                .to_string(),
            "Error (timeout): no progress from completion provider within 60s"
        );
        assert_eq!(GenerationToken::Stopped.to_string(), "[Generation stopped by user]");
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_value(GenerationToken::text("hi")).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "text", "text": "hi" }));
    }

    #[tokio::test]
    async fn cancel_wakes_waiters_on_other_clones() {
        let handle = CancelHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        assert!(!handle.is_cancelled());
        handle.cancel();

        task.await.unwrap();
        assert!(handle.is_cancelled());
    }
}
