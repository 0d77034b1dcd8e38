//! Word-window chunking.
//!
//! Text is split on whitespace and cut into windows of `max_words` words that
//! advance by `max_words - overlap_words`, so neighbours share exactly
//! `overlap_words` words. Windows shorter than `min_words` are dropped.

use serde::{Deserialize, Serialize};

use super::types::Chunk;
use crate::conversion::ConvertedDocument;
use crate::core::errors::RagError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    pub max_words: usize,
    pub overlap_words: usize,
    pub min_words: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_words: 500,
            overlap_words: 50,
            min_words: 40,
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<(), RagError> {
        if self.max_words == 0 {
            return Err(RagError::InvalidInput("max_words must be positive".to_string()));
        }
        if self.overlap_words >= self.max_words {
            return Err(RagError::InvalidInput(format!(
                "overlap_words ({}) must be less than max_words ({})",
                self.overlap_words, self.max_words
            )));
        }
        if self.min_words > self.max_words {
            return Err(RagError::InvalidInput(format!(
                "min_words ({}) must not exceed max_words ({})",
                self.min_words, self.max_words
            )));
        }
        Ok(())
    }
}

/// Cuts `words` into overlapping windows. Requires `overlap < max`.
pub fn word_windows<'a>(words: &'a [&'a str], max_words: usize, overlap_words: usize) -> Vec<&'a [&'a str]> {
    let mut windows = Vec::new();
    if words.is_empty() || max_words == 0 || overlap_words >= max_words {
        return windows;
    }

    let step = max_words - overlap_words;
    let mut start = 0;
    loop {
        let end = (start + max_words).min(words.len());
        windows.push(&words[start..end]);
        if end == words.len() {
            break;
        }
        start += step;
    }
    windows
}

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self, RagError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunks one run of text that shares a single heading path.
    pub fn chunk(&self, text: &str, section_path: &[String], source_name: &str) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        self.push_section(&mut chunks, text, section_path, source_name);
        chunks
    }

    /// Chunks a converted document section by section. Consecutive passages with
    /// the same headings form one section; overlap never crosses a section.
    pub fn chunk_document(&self, doc: &ConvertedDocument, source_name: &str) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for (headings, text) in doc.sections() {
            self.push_section(&mut chunks, &text, headings, source_name);
        }
        chunks
    }

    fn push_section(
        &self,
        chunks: &mut Vec<Chunk>,
        text: &str,
        section_path: &[String],
        source_name: &str,
    ) {
        let words: Vec<&str> = text.split_whitespace().collect();
        let windows = word_windows(&words, self.config.max_words, self.config.overlap_words);

        for window in windows {
            if window.len() < self.config.min_words {
                tracing::debug!(
                    "Dropping {}-word chunk from '{}' (minimum {})",
                    window.len(),
                    source_name,
                    self.config.min_words
                );
                continue;
            }
            chunks.push(Chunk {
                text: window.join(" "),
                source_name: source_name.to_string(),
                section_path: section_path.to_vec(),
                sequence_index: chunks.len(),
            });
        }
    }
}
