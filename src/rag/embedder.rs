use std::sync::Arc;

use crate::core::errors::RagError;
use crate::llm::EmbeddingProvider;

const EMBED_BATCH_SIZE: usize = 32;

/// Fixed-dimension text embedding on top of an external provider.
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    dimension: usize,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, dimension: usize) -> Self {
        Self {
            provider,
            dimension,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::EmbeddingUnavailable("provider returned no vector".to_string()))
    }

    /// Embeds all texts, failing as a whole if any vector is missing or has the
    /// wrong length.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_SIZE) {
            let embedded = self
                .provider
                .embed(batch)
                .await
                .map_err(|err| RagError::EmbeddingUnavailable(err.to_string()))?;
            if embedded.len() != batch.len() {
                return Err(RagError::EmbeddingUnavailable(format!(
                    "{} returned {} vectors for {} inputs",
                    self.provider.name(),
                    embedded.len(),
                    batch.len()
                )));
            }
            for vector in embedded {
                if vector.len() != self.dimension {
                    return Err(RagError::EmbeddingUnavailable(format!(
                        "{} returned a {}-dimensional vector, expected {}",
                        self.provider.name(),
                        vector.len(),
                        self.dimension
                    )));
                }
                vectors.push(vector);
            }
        }
        Ok(vectors)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic embedding provider for pipeline tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::llm::{EmbeddingProvider, ProviderError};

    /// Bag-of-words hashing into a fixed number of buckets, L2-normalized.
    /// Identical texts get identical vectors and shared words raise cosine similarity.
    pub struct HashEmbedder {
        pub dimension: usize,
        pub fail_after: Option<usize>,
        pub calls: AtomicUsize,
    }

    impl HashEmbedder {
        pub fn new(dimension: usize) -> Self {
            Self {
                dimension,
                fail_after: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing_after(dimension: usize, successful_calls: usize) -> Self {
            Self {
                fail_after: Some(successful_calls),
                ..Self::new(dimension)
            }
        }

        pub fn vector(&self, text: &str) -> Vec<f32> {
            let mut vector = vec![0.0f32; self.dimension];
            for word in text.split_whitespace() {
                let word = word.to_lowercase();
                let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
                for byte in word.bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(0x0100_0000_01b3);
                }
                vector[(hash % self.dimension as u64) as usize] += 1.0;
            }
            let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                vector.iter_mut().for_each(|v| *v /= norm);
            }
            vector
        }
    }

    #[async_trait]
    impl EmbeddingProvider for HashEmbedder {
        fn name(&self) -> &str {
            "hash"
        }

        async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.is_some_and(|limit| call >= limit) {
                return Err(ProviderError::Connection("embedding backend down".to_string()));
            }
            Ok(inputs.iter().map(|text| self.vector(text)).collect())
        }
    }
}
