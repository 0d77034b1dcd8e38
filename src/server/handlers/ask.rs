use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::core::errors::ApiError;
use crate::generation::GenerationToken;
use crate::rag::ConversationTurn;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub query: String,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

/// Streams the answer as plain text. When the client goes away the body,
/// and with it the generation, is dropped.
pub async fn ask(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AskRequest>,
) -> Result<Response, ApiError> {
    let query = request.query.trim().to_string();
    if query.is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".to_string()));
    }

    let request_id = Uuid::new_v4();
    tracing::info!(
        "Ask {} (history: {} turns, stream: {})",
        request_id,
        request.history.len(),
        request.stream
    );

    if !request.stream {
        let response = state.pipeline.answer(query, request.history).await;
        return Ok(Json(json!({ "response": response })).into_response());
    }

    let mut emitted = false;
    let chunks = state
        .pipeline
        .ask(query, request.history)
        .map(move |token| {
            let chunk = render_chunk(&token, emitted);
            emitted = true;
            Ok::<_, Infallible>(chunk)
        });

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(chunks),
    )
        .into_response())
}

fn render_chunk(token: &GenerationToken, after_output: bool) -> String {
    match token {
        GenerationToken::Text { text } => text.clone(),
        GenerationToken::Retrying { .. } => format!("{}\n", token),
        _ if after_output => format!("\n\n{}", token),
        _ => token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_tokens_are_separated_from_prior_text() {
        assert_eq!(render_chunk(&GenerationToken::text("hi"), true), "hi");
        assert_eq!(
            render_chunk(&GenerationToken::Stopped, true),
            "\n\n[Generation stopped by user]"
        );
        assert_eq!(
            render_chunk(&GenerationToken::no_context(), false),
            crate::generation::NO_CONTEXT_MESSAGE
        );
    }
}
