//! Retrieval-augmented generation building blocks.
//!
//! - `Chunker`: splits converted documents into overlapping word windows
//! - `Embedder`: fixed-dimension vectors from an embedding provider
//! - `Indexer`: chunk, embed and upsert one document at a time
//! - `Retriever`: nearest passages for a query
//! - `PromptBuilder`: grounded prompt from passages, history and query

mod chunker;
mod embedder;
mod indexer;
mod prompt;
mod retriever;
mod types;

#[cfg(test)]
pub(crate) use embedder::testing;

pub use chunker::{word_windows, Chunker, ChunkerConfig};
pub use embedder::Embedder;
pub use indexer::{FailedDocument, IndexedDocument, Indexer, IngestReport};
pub use prompt::{
    build_prompt, estimate_tokens, Prompt, PromptBudget, PromptBuilder,
    DEFAULT_SYSTEM_INSTRUCTION,
};
pub use retriever::Retriever;
pub use types::{breadcrumb, join_passages, Chunk, ConversationTurn, RetrievedPassage};
