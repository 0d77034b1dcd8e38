//! Qdrant REST backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use super::{
    check_dimension, check_top_k, CollectionSchema, DistanceMetric, IndexedPoint, PointPayload,
    ScoredPoint, VectorIndex,
};
use crate::core::errors::RagError;

pub struct QdrantIndex {
    base_url: String,
    client: Client,
    batch_size: usize,
    known: RwLock<HashMap<String, CollectionSchema>>,
}

impl QdrantIndex {
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        timeout: Duration,
        batch_size: usize,
    ) -> Result<Self, RagError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key.map(str::trim).filter(|k| !k.is_empty()) {
            let value = HeaderValue::from_str(key)
                .map_err(|_| RagError::InvalidInput("invalid Qdrant API key".to_string()))?;
            headers.insert("api-key", value);
        }
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| RagError::RetrievalUnavailable(err.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            batch_size: batch_size.max(1),
            known: RwLock::new(HashMap::new()),
        })
    }

    fn collection_url(&self, name: &str) -> String {
        format!("{}/collections/{}", self.base_url, urlencoding::encode(name))
    }

    async fn schema_for_write(&self, name: &str) -> Result<CollectionSchema, RagError> {
        if let Some(schema) = self.known.read().await.get(name) {
            return Ok(*schema);
        }
        self.collection_info(name)
            .await?
            .ok_or_else(|| RagError::NotFound(name.to_string()))
    }

    async fn create_collection(&self, name: &str, schema: CollectionSchema) -> Result<(), RagError> {
        let body = json!({
            "vectors": {
                "size": schema.dimension,
                "distance": schema.metric.wire_name(),
            }
        });
        let res = self
            .client
            .put(self.collection_url(name))
            .json(&body)
            .send()
            .await
            .map_err(store_unavailable)?;
        check_status(res, name).await?;
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<(), RagError> {
        let res = self
            .client
            .delete(self.collection_url(name))
            .send()
            .await
            .map_err(store_unavailable)?;
        match check_status(res, name).await {
            Ok(_) | Err(RagError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn write_batch(&self, name: &str, batch: &[IndexedPoint]) -> Result<(), RagError> {
        let body = UpsertBody {
            points: batch.iter().map(WirePoint::from).collect(),
        };
        let res = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url(name)))
            .json(&body)
            .send()
            .await
            .map_err(store_unavailable)?;
        check_status(res, name).await?;
        Ok(())
    }

}

async fn delete_points(client: &Client, collection_url: &str, ids: &[u64]) -> Result<(), RagError> {
    let res = client
        .post(format!("{}/points/delete?wait=true", collection_url))
        .json(&json!({ "points": ids }))
        .send()
        .await
        .map_err(store_unavailable)?;
    check_status(res, collection_url).await?;
    Ok(())
}

/// Ids sent to the store by an upsert that has not finished yet.
///
/// If the upsert future is dropped before `commit`, the ids are deleted from a
/// background task so an abandoned call cannot leave part of a document behind.
struct PendingWrite {
    client: Client,
    collection_url: String,
    ids: Vec<u64>,
    committed: bool,
}

impl PendingWrite {
    fn new(client: Client, collection_url: String, capacity: usize) -> Self {
        Self {
            client,
            collection_url,
            ids: Vec::with_capacity(capacity),
            committed: false,
        }
    }

    fn commit(mut self) -> usize {
        self.committed = true;
        self.ids.len()
    }

    async fn roll_back(mut self) {
        self.committed = true;
        let ids = std::mem::take(&mut self.ids);
        if let Err(err) = delete_points(&self.client, &self.collection_url, &ids).await {
            tracing::warn!("Rollback of {} points failed: {}", ids.len(), err);
        }
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if self.committed || self.ids.is_empty() {
            return;
        }
        let ids = std::mem::take(&mut self.ids);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Upsert abandoned with {} points written, no runtime to roll back", ids.len());
            return;
        };
        tracing::warn!("Upsert abandoned after {} points, rolling back", ids.len());
        let client = self.client.clone();
        let collection_url = std::mem::take(&mut self.collection_url);
        runtime.spawn(async move {
            if let Err(err) = delete_points(&client, &collection_url, &ids).await {
                tracing::warn!("Rollback of {} points failed: {}", ids.len(), err);
            }
        });
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_collection(
        &self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<(), RagError> {
        if dimension == 0 {
            return Err(RagError::InvalidInput("dimension must be positive".to_string()));
        }
        let requested = CollectionSchema { dimension, metric };

        let existing = match self.collection_info(name).await? {
            Some(existing) => existing,
            None => match self.create_collection(name, requested).await {
                Ok(()) => {
                    tracing::info!("Created Qdrant collection '{}' (dim {})", name, dimension);
                    requested
                }
                // Lost a creation race; whoever won decides the schema.
                Err(err) => self.collection_info(name).await?.ok_or(err)?,
            },
        };

        if existing.dimension != dimension {
            return Err(RagError::SchemaConflict {
                collection: name.to_string(),
                existing: existing.dimension,
                requested: dimension,
            });
        }
        if existing.metric != metric {
            tracing::warn!(
                "Collection '{}' uses {:?}, keeping it instead of requested {:?}",
                name,
                existing.metric,
                metric
            );
        }

        self.known.write().await.insert(name.to_string(), existing);
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<(), RagError> {
        let schema = match self.collection_info(name).await? {
            Some(schema) => schema,
            None => match self.known.read().await.get(name) {
                Some(schema) => *schema,
                None => {
                    tracing::debug!("Nothing to clear for unknown collection '{}'", name);
                    return Ok(());
                }
            },
        };

        self.delete_collection(name).await?;
        self.create_collection(name, schema).await?;
        self.known.write().await.insert(name.to_string(), schema);
        tracing::info!("Cleared Qdrant collection '{}'", name);
        Ok(())
    }

    async fn upsert(&self, name: &str, points: Vec<IndexedPoint>) -> Result<usize, RagError> {
        let schema = self.schema_for_write(name).await?;
        for point in &points {
            check_dimension(point.vector.len(), schema.dimension)?;
        }

        let mut pending =
            PendingWrite::new(self.client.clone(), self.collection_url(name), points.len());
        for batch in points.chunks(self.batch_size) {
            // A batch counts as written once sent; the store may apply it even if the reply is lost.
            pending.ids.extend(batch.iter().map(|p| p.id));
            if let Err(err) = self.write_batch(name, batch).await {
                tracing::warn!(
                    "Upsert into '{}' failed after sending {} points, rolling back",
                    name,
                    pending.ids.len()
                );
                pending.roll_back().await;
                return Err(err);
            }
        }

        Ok(pending.commit())
    }

    async fn query(
        &self,
        name: &str,
        vector: &[f32],
        top_k: usize,
        with_payload: bool,
    ) -> Result<Vec<ScoredPoint>, RagError> {
        check_top_k(top_k)?;
        if let Some(schema) = self.known.read().await.get(name) {
            check_dimension(vector.len(), schema.dimension)?;
        }

        let body = json!({
            "vector": vector,
            "limit": top_k,
            "with_payload": with_payload,
        });
        let res = self
            .client
            .post(format!("{}/points/search", self.collection_url(name)))
            .json(&body)
            .send()
            .await
            .map_err(store_unavailable)?;
        let res = check_status(res, name).await?;
        let parsed: QdrantResponse<Vec<WireHit>> = res.json().await.map_err(store_unavailable)?;

        Ok(parsed
            .result
            .into_iter()
            .filter_map(|hit| scored_point(name, hit))
            .collect())
    }

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionSchema>, RagError> {
        let res = self
            .client
            .get(self.collection_url(name))
            .send()
            .await
            .map_err(store_unavailable)?;
        let res = match check_status(res, name).await {
            Ok(res) => res,
            Err(RagError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };

        let parsed: QdrantResponse<Value> = res.json().await.map_err(store_unavailable)?;
        let vectors = &parsed.result["config"]["params"]["vectors"];
        let dimension = vectors["size"].as_u64().ok_or_else(|| {
            RagError::RetrievalUnavailable(format!(
                "collection '{}' uses named vectors, which are not supported",
                name
            ))
        })?;
        let metric = vectors["distance"]
            .as_str()
            .and_then(DistanceMetric::from_wire_name)
            .unwrap_or_default();

        Ok(Some(CollectionSchema {
            dimension: dimension as usize,
            metric,
        }))
    }

    async fn count(&self, name: &str) -> Result<usize, RagError> {
        let res = self
            .client
            .post(format!("{}/points/count", self.collection_url(name)))
            .json(&json!({ "exact": true }))
            .send()
            .await
            .map_err(store_unavailable)?;
        let res = check_status(res, name).await?;
        let parsed: QdrantResponse<Value> = res.json().await.map_err(store_unavailable)?;
        Ok(parsed.result["count"].as_u64().unwrap_or(0) as usize)
    }
}

#[derive(Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

#[derive(Deserialize)]
struct WireHit {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Serialize)]
struct UpsertBody<'a> {
    points: Vec<WirePoint<'a>>,
}

#[derive(Serialize)]
struct WirePoint<'a> {
    id: u64,
    vector: &'a [f32],
    payload: &'a PointPayload,
}

impl<'a> From<&'a IndexedPoint> for WirePoint<'a> {
    fn from(point: &'a IndexedPoint) -> Self {
        Self {
            id: point.id,
            vector: &point.vector,
            payload: &point.payload,
        }
    }
}

/// Hits with ids this index never writes are skipped. A payload that does not
/// parse is kept as a hit without payload.
fn scored_point(collection: &str, hit: WireHit) -> Option<ScoredPoint> {
    let Some(id) = hit.id.as_u64() else {
        tracing::warn!("Skipping hit with foreign id {} in '{}'", hit.id, collection);
        return None;
    };
    let payload = match hit.payload {
        Some(raw) => match serde_json::from_value::<PointPayload>(raw) {
            Ok(payload) => Some(payload),
            Err(err) => {
                tracing::warn!("Unreadable payload on point {} in '{}': {}", id, collection, err);
                None
            }
        },
        None => None,
    };
    Some(ScoredPoint {
        id,
        score: hit.score,
        payload,
    })
}

fn store_unavailable(err: reqwest::Error) -> RagError {
    RagError::RetrievalUnavailable(err.to_string())
}

async fn check_status(res: Response, collection: &str) -> Result<Response, RagError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND => Err(RagError::NotFound(collection.to_string())),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            Err(RagError::InvalidInput(format!("Qdrant rejected request: {}", body)))
        }
        _ => Err(RagError::RetrievalUnavailable(format!(
            "Qdrant returned {}: {}",
            status, body
        ))),
    }
}
