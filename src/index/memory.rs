use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    check_dimension, check_top_k, CollectionSchema, DistanceMetric, IndexedPoint, PointPayload,
    ScoredPoint, VectorIndex,
};
use crate::core::errors::RagError;

struct Collection {
    schema: CollectionSchema,
    points: BTreeMap<u64, (Vec<f32>, PointPayload)>,
}

#[derive(Default)]
struct State {
    collections: HashMap<String, Collection>,
    known: HashMap<String, CollectionSchema>,
}

/// Exact brute-force index held in process memory.
#[derive(Default)]
pub struct InMemoryIndex {
    state: RwLock<State>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes a collection without forgetting its schema, as if it had been
    /// deleted behind the process's back.
    #[cfg(test)]
    pub async fn drop_collection(&self, name: &str) {
        self.state.write().await.collections.remove(name);
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn ensure_collection(
        &self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<(), RagError> {
        if dimension == 0 {
            return Err(RagError::InvalidInput("dimension must be positive".to_string()));
        }
        let mut state = self.state.write().await;
        if let Some(existing) = state.collections.get(name) {
            if existing.schema.dimension != dimension {
                return Err(RagError::SchemaConflict {
                    collection: name.to_string(),
                    existing: existing.schema.dimension,
                    requested: dimension,
                });
            }
            return Ok(());
        }

        let schema = CollectionSchema { dimension, metric };
        state.collections.insert(
            name.to_string(),
            Collection {
                schema,
                points: BTreeMap::new(),
            },
        );
        state.known.insert(name.to_string(), schema);
        tracing::info!("Created in-memory collection '{}' (dim {})", name, dimension);
        Ok(())
    }

    async fn clear(&self, name: &str) -> Result<(), RagError> {
        let mut state = self.state.write().await;
        let schema = match state.collections.get(name) {
            Some(collection) => collection.schema,
            None => match state.known.get(name) {
                Some(schema) => *schema,
                None => return Ok(()),
            },
        };
        state.collections.insert(
            name.to_string(),
            Collection {
                schema,
                points: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn upsert(&self, name: &str, points: Vec<IndexedPoint>) -> Result<usize, RagError> {
        let mut state = self.state.write().await;
        let collection = state
            .collections
            .get_mut(name)
            .ok_or_else(|| RagError::NotFound(name.to_string()))?;

        for point in &points {
            check_dimension(point.vector.len(), collection.schema.dimension)?;
        }

        let written = points.len();
        for point in points {
            collection
                .points
                .insert(point.id, (point.vector, point.payload));
        }
        Ok(written)
    }

    async fn query(
        &self,
        name: &str,
        vector: &[f32],
        top_k: usize,
        with_payload: bool,
    ) -> Result<Vec<ScoredPoint>, RagError> {
        check_top_k(top_k)?;
        let state = self.state.read().await;
        let collection = state
            .collections
            .get(name)
            .ok_or_else(|| RagError::NotFound(name.to_string()))?;
        check_dimension(vector.len(), collection.schema.dimension)?;

        let metric = collection.schema.metric;
        let mut scored: Vec<(u64, f32, &PointPayload)> = collection
            .points
            .iter()
            .map(|(id, (stored, payload))| (*id, metric.score(vector, stored), payload))
            .collect();

        scored.sort_by(|left, right| {
            let ord = left.1.total_cmp(&right.1);
            if metric.higher_is_closer() {
                ord.reverse()
            } else {
                ord
            }
        });
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(id, score, payload)| ScoredPoint {
                id,
                score,
                payload: with_payload.then(|| payload.clone()),
            })
            .collect())
    }

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionSchema>, RagError> {
        let state = self.state.read().await;
        Ok(state.collections.get(name).map(|c| c.schema))
    }

    async fn count(&self, name: &str) -> Result<usize, RagError> {
        let state = self.state.read().await;
        state
            .collections
            .get(name)
            .map(|c| c.points.len())
            .ok_or_else(|| RagError::NotFound(name.to_string()))
    }
}
