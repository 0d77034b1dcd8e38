//! Owns the long-lived collaborators and wires ingestion and question answering.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::conversion::{ConversionSource, DocumentConverter, HttpConverter};
use crate::core::config::{AppConfig, VectorBackend};
use crate::core::errors::RagError;
use crate::generation::{GenerationSettings, GenerationStream, Generator};
use crate::index::{DistanceMetric, InMemoryIndex, PointIdAllocator, QdrantIndex, VectorIndex};
use crate::llm::{CompletionProvider, EmbeddingProvider, OpenAiCompletions, OpenAiEmbeddings};
use crate::rag::{
    Chunker, ConversationTurn, Embedder, Indexer, IngestReport, PromptBudget, PromptBuilder,
    Retriever, DEFAULT_SYSTEM_INSTRUCTION,
};

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub collection: String,
    pub backend: VectorBackend,
    pub exists: bool,
    pub points: usize,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub embedding_model: String,
    pub llm_model: String,
}

pub struct RagPipeline {
    config: AppConfig,
    index: Arc<dyn VectorIndex>,
    indexer: Indexer,
    generator: Generator,
    converter: Arc<dyn DocumentConverter>,
}

impl RagPipeline {
    /// Builds the pipeline against the services named in `config`.
    pub fn from_config(config: AppConfig) -> Result<Self, RagError> {
        let embeddings = OpenAiEmbeddings::new(
            &config.embedding.base_url,
            config.embedding.api_key.as_deref(),
            &config.embedding.model,
            Duration::from_secs(config.embedding.timeout_secs),
        )
        .map_err(|err| RagError::EmbeddingUnavailable(err.to_string()))?;

        let completions = OpenAiCompletions::new(
            &config.llm.base_url,
            config.llm.api_key.as_deref(),
            config.llm.connect_timeout(),
        )
        .map_err(|err| RagError::GenerationConnection(err.to_string()))?;

        let index: Arc<dyn VectorIndex> = match config.vector_store.backend {
            VectorBackend::Qdrant => Arc::new(QdrantIndex::new(
                &config.vector_store.url,
                config.vector_store.api_key.as_deref(),
                Duration::from_secs(config.vector_store.timeout_secs),
                config.vector_store.upsert_batch_size,
            )?),
            VectorBackend::Memory => Arc::new(InMemoryIndex::new()),
        };

        let converter = HttpConverter::new(
            &config.converter.url,
            Duration::from_secs(config.converter.timeout_secs),
        )?;

        tracing::info!(
            "Pipeline using {:?} vector store, collection '{}'",
            config.vector_store.backend,
            config.vector_store.collection
        );

        Self::new(
            config,
            Arc::new(embeddings),
            Arc::new(completions),
            index,
            Arc::new(converter),
        )
    }

    pub fn new(
        config: AppConfig,
        embeddings: Arc<dyn EmbeddingProvider>,
        completions: Arc<dyn CompletionProvider>,
        index: Arc<dyn VectorIndex>,
        converter: Arc<dyn DocumentConverter>,
    ) -> Result<Self, RagError> {
        let embedder = Embedder::new(embeddings, config.embedding.dimension);
        let collection = config.vector_store.collection.clone();

        let indexer = Indexer::new(
            Chunker::new(config.chunking.clone())?,
            embedder.clone(),
            index.clone(),
            Arc::new(PointIdAllocator::new()),
            collection.clone(),
            config.vector_store.distance,
        );

        let retriever = Arc::new(Retriever::new(embedder, index.clone(), collection));
        let instruction = config
            .prompt
            .system_instruction
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SYSTEM_INSTRUCTION.to_string());
        let prompts = PromptBuilder::new(instruction).with_budget(PromptBudget {
            context_window_tokens: config.llm.context_window_tokens,
            reserved_output_tokens: config.llm.reserved_output_tokens(),
        });
        let settings = GenerationSettings {
            model: config.llm.model.clone(),
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
            top_k: config.retrieval.top_k,
            connect_timeout: config.llm.connect_timeout(),
            idle_timeout: config.llm.idle_timeout(),
            retry: config.retry.clone(),
        };
        let generator = Generator::new(retriever, prompts, completions, settings);

        Ok(Self {
            config,
            index,
            indexer,
            generator,
            converter,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Converts and indexes each source. A failing source is reported and
    /// the rest continue.
    pub async fn ingest(&self, sources: Vec<ConversionSource>) -> IngestReport {
        let mut report = IngestReport::default();
        for source in sources {
            let name = source.display_name();
            let doc = match self
                .converter
                .convert(&source, &self.config.converter.options)
                .await
            {
                Ok(doc) => doc,
                Err(err) => {
                    tracing::warn!("Conversion of '{}' failed: {}", name, err);
                    report.record_failure(name, &err);
                    continue;
                }
            };

            match self.indexer.index_document(&doc, &doc.name).await {
                Ok(chunks) => report.record_success(doc.name.clone(), chunks),
                Err(err) => {
                    tracing::warn!("Indexing of '{}' failed: {}", doc.name, err);
                    report.record_failure(doc.name.clone(), &err);
                }
            }
        }
        tracing::info!(
            "Ingest finished: {} indexed, {} failed, {} chunks",
            report.indexed.len(),
            report.failed.len(),
            report.total_chunks
        );
        report
    }

    pub fn ask(&self, query: impl Into<String>, history: Vec<ConversationTurn>) -> GenerationStream {
        self.generator.generate(query, history)
    }

    pub async fn answer(&self, query: impl Into<String>, history: Vec<ConversationTurn>) -> String {
        self.ask(query, history).collect_answer().await
    }

    /// Empties the collection. Its dimension and metric are kept.
    pub async fn reset_index(&self) -> Result<(), RagError> {
        let collection = &self.config.vector_store.collection;
        self.index.clear(collection).await?;
        tracing::info!("Collection '{}' cleared", collection);
        Ok(())
    }

    pub async fn status(&self) -> Result<PipelineStatus, RagError> {
        let collection = &self.config.vector_store.collection;
        let schema = self.index.collection_info(collection).await?;
        let points = match schema {
            Some(_) => self.index.count(collection).await?,
            None => 0,
        };
        Ok(PipelineStatus {
            collection: collection.clone(),
            backend: self.config.vector_store.backend,
            exists: schema.is_some(),
            points,
            dimension: schema
                .map(|s| s.dimension)
                .unwrap_or(self.config.embedding.dimension),
            metric: schema
                .map(|s| s.metric)
                .unwrap_or(self.config.vector_store.distance),
            embedding_model: self.config.embedding.model.clone(),
            llm_model: self.config.llm.model.clone(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process collaborators for pipeline and HTTP tests.

    use std::sync::Arc;

    use async_trait::async_trait;
    use futures_util::stream::{self, StreamExt};

    use super::RagPipeline;
    use crate::conversion::{
        ConversionOptions, ConversionSource, ConvertedDocument, DocumentConverter, Passage,
    };
    use crate::core::config::AppConfig;
    use crate::core::errors::RagError;
    use crate::index::InMemoryIndex;
    use crate::llm::{CompletionProvider, CompletionRequest, CompletionStream, ProviderError};
    use crate::rag::testing::HashEmbedder;

    pub const DIM: usize = 32;

    /// Streams a fixed answer word by word.
    pub struct CannedCompletions(pub &'static str);

    #[async_trait]
    impl CompletionProvider for CannedCompletions {
        fn name(&self) -> &str {
            "canned"
        }

        async fn open_stream(&self, _: &CompletionRequest) -> Result<CompletionStream, ProviderError> {
            let words: Vec<Result<Option<String>, ProviderError>> = self
                .0
                .split_inclusive(' ')
                .map(|w| Ok(Some(w.to_string())))
                .collect();
            Ok(stream::iter(words).boxed())
        }
    }

    /// Treats the URL or file name as the document text, refusing names
    /// containing "broken".
    pub struct EchoConverter;

    #[async_trait]
    impl DocumentConverter for EchoConverter {
        async fn convert(
            &self,
            source: &ConversionSource,
            _: &ConversionOptions,
        ) -> Result<ConvertedDocument, RagError> {
            let name = source.display_name();
            if name.contains("broken") {
                return Err(RagError::ConversionFailed(format!("{}: unreadable", name)));
            }
            let text = match source {
                ConversionSource::File { bytes, .. } => String::from_utf8_lossy(bytes).into_owned(),
                ConversionSource::Url(url) => format!("{} {}", url, "filler ".repeat(30)),
            };
            Ok(ConvertedDocument {
                name,
                passages: vec![Passage {
                    text,
                    headings: vec!["Body".to_string()],
                }],
            })
        }
    }

    pub fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.embedding.dimension = DIM;
        config.chunking.max_words = 20;
        config.chunking.overlap_words = 5;
        config.chunking.min_words = 3;
        config
    }

    pub fn pipeline(answer: &'static str) -> RagPipeline {
        RagPipeline::new(
            config(),
            Arc::new(HashEmbedder::new(DIM)),
            Arc::new(CannedCompletions(answer)),
            Arc::new(InMemoryIndex::new()),
            Arc::new(EchoConverter),
        )
        .unwrap()
    }
}
