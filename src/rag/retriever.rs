use std::sync::Arc;

use super::embedder::Embedder;
use super::types::RetrievedPassage;
use crate::core::errors::RagError;
use crate::index::VectorIndex;

pub struct Retriever {
    embedder: Embedder,
    index: Arc<dyn VectorIndex>,
    collection: String,
}

impl Retriever {
    pub fn new(embedder: Embedder, index: Arc<dyn VectorIndex>, collection: impl Into<String>) -> Self {
        Self {
            embedder,
            index,
            collection: collection.into(),
        }
    }

    /// Passages most similar to `query`, in the order the store ranked them.
    ///
    /// A missing collection or a failed query embedding yields no passages.
    /// An unreachable store is an error so callers can tell "nothing relevant"
    /// from "couldn't search".
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedPassage>, RagError> {
        let vector = match self.embedder.embed(query).await {
            Ok(vector) => vector,
            Err(err) => {
                tracing::warn!("Query embedding failed, continuing without context: {}", err);
                return Ok(Vec::new());
            }
        };

        let hits = match self.index.query(&self.collection, &vector, top_k, true).await {
            Ok(hits) => hits,
            Err(RagError::NotFound(collection)) => {
                tracing::warn!("Collection '{}' does not exist yet", collection);
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        let passages: Vec<RetrievedPassage> = hits
            .into_iter()
            .filter_map(|hit| {
                let payload = hit.payload?;
                Some(RetrievedPassage {
                    content: payload.content,
                    score: hit.score,
                    source_name: payload.source_name,
                    section_path: payload.section_path,
                })
            })
            .collect();

        tracing::debug!("Retrieved {} passages for query", passages.len());
        Ok(passages)
    }
}
