use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

/// Failure kinds of the ingestion and query pipeline.
///
/// Cancellation is not an error: a cancelled generation ends in
/// [`GenerationState::Cancelled`](crate::generation::GenerationState), not in an error.
#[derive(Debug, Error)]
pub enum RagError {
    /// An existing collection was created with another vector dimension.
    #[error("collection '{collection}' has dimension {existing}, requested {requested}")]
    SchemaConflict {
        collection: String,
        existing: usize,
        requested: usize,
    },
    #[error("collection '{0}' not found")]
    NotFound(String),
    #[error("vector store unavailable: {0}")]
    RetrievalUnavailable(String),
    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),
    #[error("indexing '{source_name}' failed: {cause}")]
    IndexingFailed {
        source_name: String,
        #[source]
        cause: Box<RagError>,
    },
    #[error("completion provider connection failed: {0}")]
    GenerationConnection(String),
    #[error("no progress from completion provider within {0:?}")]
    GenerationTimeout(Duration),
    #[error("document conversion failed: {0}")]
    ConversionFailed(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl RagError {
    pub fn indexing_failed(source_name: impl Into<String>, cause: RagError) -> Self {
        RagError::IndexingFailed {
            source_name: source_name.into(),
            cause: Box::new(cause),
        }
    }

    /// Short machine-readable label, used in error tokens and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::SchemaConflict { .. } => "schema_conflict",
            RagError::NotFound(_) => "not_found",
            RagError::RetrievalUnavailable(_) => "retrieval_unavailable",
            RagError::EmbeddingUnavailable(_) => "embedding_unavailable",
            RagError::IndexingFailed { .. } => "indexing_failed",
            RagError::GenerationConnection(_) => "connection",
            RagError::GenerationTimeout(_) => "timeout",
            RagError::ConversionFailed(_) => "conversion_failed",
            RagError::InvalidInput(_) => "invalid_input",
        }
    }
}

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        match err {
            RagError::SchemaConflict { .. } => ApiError::Conflict(err.to_string()),
            RagError::NotFound(_) => ApiError::NotFound(err.to_string()),
            RagError::InvalidInput(_) => ApiError::BadRequest(err.to_string()),
            RagError::RetrievalUnavailable(_)
            | RagError::EmbeddingUnavailable(_)
            | RagError::GenerationConnection(_)
            | RagError::GenerationTimeout(_) => ApiError::ServiceUnavailable(err.to_string()),
            RagError::IndexingFailed { .. } | RagError::ConversionFailed(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}
