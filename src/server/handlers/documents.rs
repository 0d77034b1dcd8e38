use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::conversion::ConversionSource;
use crate::core::errors::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UrlBatch {
    #[serde(default)]
    urls: Vec<String>,
}

/// Accepts either `{"urls": [...]}` as JSON or a raw file body named by `?name=`.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let sources = if is_json(&headers) {
        let batch: UrlBatch = serde_json::from_slice(&body)
            .map_err(|err| ApiError::BadRequest(format!("invalid JSON body: {err}")))?;
        let urls: Vec<String> = batch
            .urls
            .into_iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        if urls.is_empty() {
            return Err(ApiError::BadRequest("no document URLs given".to_string()));
        }
        urls.into_iter().map(ConversionSource::Url).collect()
    } else {
        let name = query
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| ApiError::BadRequest("missing ?name= for file upload".to_string()))?;
        if body.is_empty() {
            return Err(ApiError::BadRequest(format!("'{}' is empty", name)));
        }
        vec![ConversionSource::file(name, body.to_vec())?]
    };

    let report = state.pipeline.ingest(sources).await;
    Ok(Json(report))
}

pub async fn reset_index(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    state.pipeline.reset_index().await?;
    Ok(Json(json!({
        "status": "cleared",
        "collection": state.config().vector_store.collection,
    })))
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false)
}
