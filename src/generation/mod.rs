//! Streaming answer generation: retrieval, prompt, completion with retries,
//! timeouts and caller cancellation.

mod retry;
mod stream;
mod token;

pub use retry::RetryPolicy;
pub use stream::{GenerationSettings, GenerationStream, Generator};
pub use token::{CancelHandle, GenerationState, GenerationToken, NO_CONTEXT_MESSAGE};
