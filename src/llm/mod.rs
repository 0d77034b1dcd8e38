pub mod openai;
pub mod provider;
pub mod types;

pub use openai::{OpenAiCompletions, OpenAiEmbeddings};
pub use provider::{CompletionProvider, CompletionStream, EmbeddingProvider, ProviderError};
pub use types::{ChatMessage, CompletionRequest};
