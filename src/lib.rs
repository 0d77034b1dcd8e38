//! Question answering over a private document collection.
//!
//! Documents are converted to text by an external service, chunked, embedded and
//! stored in a vector index. Questions retrieve the closest chunks and stream an
//! answer from a completion endpoint that is grounded in them.

pub mod conversion;
pub mod core;
pub mod generation;
pub mod index;
pub mod llm;
pub mod pipeline;
pub mod rag;
pub mod server;
pub mod state;
