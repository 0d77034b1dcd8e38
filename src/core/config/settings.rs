//! Typed view of the merged configuration tree.
//!
//! Every section is `#[serde(default)]`, so a missing `config.yml` yields a
//! runnable local setup (in-memory index, OpenAI-compatible endpoints on localhost).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conversion::ConversionOptions;
use crate::generation::RetryPolicy;
use crate::index::DistanceMetric;
use crate::rag::ChunkerConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub vector_store: VectorStoreConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub chunking: ChunkerConfig,
    pub retrieval: RetrievalConfig,
    pub retry: RetryPolicy,
    pub converter: ConverterConfig,
    pub prompt: PromptConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    Qdrant,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub backend: VectorBackend,
    /// REST endpoint of the Qdrant server.
    pub url: String,
    pub api_key: Option<String>,
    pub collection: String,
    pub distance: DistanceMetric,
    pub upsert_batch_size: usize,
    pub timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::Memory,
            url: "http://localhost:6333".to_string(),
            api_key: None,
            collection: "papers".to_string(),
            distance: DistanceMetric::Cosine,
            upsert_batch_size: 64,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimension: usize,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            api_key: None,
            model: "all-MiniLM-L6-v2".to_string(),
            dimension: 384,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Context window of the completion model, in tokens.
    pub context_window_tokens: usize,
    pub connect_timeout_secs: u64,
    /// Longest wait for the next stream increment before the query fails.
    pub idle_timeout_secs: u64,
}

impl LlmConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Tokens kept free for the answer when fitting the prompt.
    pub fn reserved_output_tokens(&self) -> usize {
        self.max_tokens.map(|t| t as usize).unwrap_or(512)
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            api_key: None,
            model: "llama3.2".to_string(),
            temperature: Some(0.2),
            max_tokens: Some(512),
            context_window_tokens: 4096,
            connect_timeout_secs: 30,
            idle_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { top_k: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    pub url: String,
    pub timeout_secs: u64,
    #[serde(flatten)]
    pub options: ConversionOptions,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5001".to_string(),
            timeout_secs: 300,
            options: ConversionOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Replaces the built-in grounding instruction when set.
    pub system_instruction: Option<String>,
}
