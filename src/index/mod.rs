//! Vector index abstraction.
//!
//! A [`VectorIndex`] owns named collections of fixed-dimension vectors with a
//! text payload. Two backends exist:
//! - [`QdrantIndex`] talks to a Qdrant server over its REST API
//! - [`InMemoryIndex`] keeps everything in process memory (local runs, tests)

mod ids;
mod memory;
mod qdrant;

pub use ids::PointIdAllocator;
pub use memory::InMemoryIndex;
pub use qdrant::QdrantIndex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::errors::RagError;

/// Similarity function of a collection, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclid,
    Dot,
}

impl DistanceMetric {
    /// Name used on the Qdrant wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "Cosine",
            DistanceMetric::Euclid => "Euclid",
            DistanceMetric::Dot => "Dot",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "cosine" => Some(DistanceMetric::Cosine),
            "euclid" | "euclidean" | "l2" => Some(DistanceMetric::Euclid),
            "dot" => Some(DistanceMetric::Dot),
            _ => None,
        }
    }

    /// Euclid scores are distances, so smaller means closer.
    pub fn higher_is_closer(self) -> bool {
        !matches!(self, DistanceMetric::Euclid)
    }

    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => cosine_similarity(a, b),
            DistanceMetric::Dot => dot(a, b),
            DistanceMetric::Euclid => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub dimension: usize,
    pub metric: DistanceMetric,
}

/// Payload stored next to every vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    #[serde(default)]
    pub section_path: Vec<String>,
    #[serde(default)]
    pub source_name: String,
}

impl PointPayload {
    pub fn text(
        content: impl Into<String>,
        section_path: Vec<String>,
        source_name: impl Into<String>,
    ) -> Self {
        Self {
            kind: "text".to_string(),
            content: content.into(),
            section_path,
            source_name: source_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedPoint {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: u64,
    pub score: f32,
    pub payload: Option<PointPayload>,
}

/// Lifecycle and search over named collections.
///
/// Implementations must be safe for concurrent use; callers add no locking.
/// Point ids come from one [`PointIdAllocator`] per process, so a collection
/// must have a single writing process. A second writer, or a restart after the
/// clock stepped back, can reuse ids and `upsert` then replaces those points.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Creates the collection if absent. An existing collection with the same
    /// dimension is left untouched; a different dimension is a `SchemaConflict`.
    async fn ensure_collection(
        &self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<(), RagError>;

    /// Drops every point. A collection whose schema was never seen is a no-op.
    async fn clear(&self, name: &str) -> Result<(), RagError>;

    /// Writes all points or none of them. Returns the number written.
    async fn upsert(&self, name: &str, points: Vec<IndexedPoint>) -> Result<usize, RagError>;

    /// Nearest neighbours of `vector`, closest first.
    async fn query(
        &self,
        name: &str,
        vector: &[f32],
        top_k: usize,
        with_payload: bool,
    ) -> Result<Vec<ScoredPoint>, RagError>;

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionSchema>, RagError>;

    async fn count(&self, name: &str) -> Result<usize, RagError>;
}

pub(crate) fn check_top_k(top_k: usize) -> Result<(), RagError> {
    if top_k == 0 {
        return Err(RagError::InvalidInput("top_k must be positive".to_string()));
    }
    Ok(())
}

pub(crate) fn check_dimension(len: usize, dimension: usize) -> Result<(), RagError> {
    if len != dimension {
        return Err(RagError::InvalidInput(format!(
            "vector length {} does not match collection dimension {}",
            len, dimension
        )));
    }
    Ok(())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = dot(a, a).sqrt();
    let norm_b = dot(b, b).sqrt();
    let denom = norm_a * norm_b;
    if denom <= f32::EPSILON {
        return 0.0;
    }
    dot(a, b) / denom
}
