use std::sync::Arc;

use serde::Serialize;

use super::chunker::Chunker;
use super::embedder::Embedder;
use crate::conversion::ConvertedDocument;
use crate::core::errors::RagError;
use crate::index::{DistanceMetric, IndexedPoint, PointIdAllocator, PointPayload, VectorIndex};

#[derive(Debug, Clone, Serialize)]
pub struct IndexedDocument {
    pub name: String,
    pub chunks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedDocument {
    pub name: String,
    pub error: String,
}

/// Outcome of ingesting several documents; failures never stop the batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub indexed: Vec<IndexedDocument>,
    pub failed: Vec<FailedDocument>,
    pub total_chunks: usize,
}

impl IngestReport {
    pub fn record_failure(&mut self, name: impl Into<String>, error: &RagError) {
        self.failed.push(FailedDocument {
            name: name.into(),
            error: error.to_string(),
        });
    }

    pub fn record_success(&mut self, name: impl Into<String>, chunks: usize) {
        self.total_chunks += chunks;
        self.indexed.push(IndexedDocument {
            name: name.into(),
            chunks,
        });
    }
}

/// Turns converted documents into indexed points.
pub struct Indexer {
    chunker: Chunker,
    embedder: Embedder,
    index: Arc<dyn VectorIndex>,
    ids: Arc<PointIdAllocator>,
    collection: String,
    metric: DistanceMetric,
}

impl Indexer {
    pub fn new(
        chunker: Chunker,
        embedder: Embedder,
        index: Arc<dyn VectorIndex>,
        ids: Arc<PointIdAllocator>,
        collection: impl Into<String>,
        metric: DistanceMetric,
    ) -> Self {
        Self {
            chunker,
            embedder,
            index,
            ids,
            collection: collection.into(),
            metric,
        }
    }

    /// Indexes one document all-or-nothing and returns the number of points
    /// written. Zero is a valid outcome for a document with no usable text.
    pub async fn index_document(
        &self,
        doc: &ConvertedDocument,
        source_name: &str,
    ) -> Result<usize, RagError> {
        self.index_inner(doc, source_name)
            .await
            .map_err(|cause| RagError::indexing_failed(source_name, cause))
    }

    async fn index_inner(&self, doc: &ConvertedDocument, source_name: &str) -> Result<usize, RagError> {
        let chunks = self.chunker.chunk_document(doc, source_name);
        if chunks.is_empty() {
            tracing::info!("No chunks worth indexing in '{}'", source_name);
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.embedding_text()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        self.index
            .ensure_collection(&self.collection, self.embedder.dimension(), self.metric)
            .await?;

        let ids = self.ids.next_ids(chunks.len());
        let points: Vec<IndexedPoint> = chunks
            .into_iter()
            .zip(vectors)
            .zip(ids)
            .map(|((chunk, vector), id)| IndexedPoint {
                id,
                vector,
                payload: PointPayload::text(chunk.text, chunk.section_path, chunk.source_name),
            })
            .collect();

        let written = self.index.upsert(&self.collection, points).await?;
        tracing::info!("Indexed {} chunks from '{}'", written, source_name);
        Ok(written)
    }

    /// Indexes each document independently, using its name as source.
    pub async fn index_batch(&self, docs: &[ConvertedDocument]) -> IngestReport {
        let mut report = IngestReport::default();
        for doc in docs {
            match self.index_document(doc, &doc.name).await {
                Ok(count) => report.record_success(doc.name.clone(), count),
                Err(err) => {
                    tracing::warn!("Skipping '{}': {}", doc.name, err);
                    report.record_failure(doc.name.clone(), &err);
                }
            }
        }
        report
    }
}
