//! Boundary to the external document conversion service.
//!
//! The service turns PDFs, office files and web pages into passages of plain
//! text, each tagged with the heading path it appeared under. Layout analysis,
//! OCR and figure extraction all happen on the other side.

mod http;

pub use http::HttpConverter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::errors::RagError;

const SUPPORTED_EXTENSIONS: [&str; 4] = ["pdf", "docx", "pptx", "html"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    /// Extract text from scanned images.
    pub do_ocr: bool,
    /// Preserve table layout.
    pub do_table_structure: bool,
    /// Render embedded figures.
    pub generate_picture_images: bool,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            do_ocr: true,
            do_table_structure: true,
            generate_picture_images: true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConversionSource {
    Url(String),
    File { name: String, bytes: Vec<u8> },
}

impl ConversionSource {
    pub fn file(name: impl Into<String>, bytes: Vec<u8>) -> Result<Self, RagError> {
        let name = name.into();
        check_supported(&name)?;
        Ok(ConversionSource::File { name, bytes })
    }

    /// Name used as `source_name` for indexed chunks.
    pub fn display_name(&self) -> String {
        match self {
            ConversionSource::File { name, .. } => name.clone(),
            ConversionSource::Url(url) => {
                let trimmed = url.split(['?', '#']).next().unwrap_or(url);
                match trimmed.rsplit('/').next() {
                    Some(last) if !last.is_empty() => last.to_string(),
                    _ => "document".to_string(),
                }
            }
        }
    }
}

pub fn check_supported(file_name: &str) -> Result<(), RagError> {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Ok(());
    }
    Err(RagError::InvalidInput(format!(
        "unsupported file type '{}': expected one of {}",
        file_name,
        SUPPORTED_EXTENSIONS.join(", ")
    )))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    #[serde(default)]
    pub headings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertedDocument {
    pub name: String,
    pub passages: Vec<Passage>,
}

impl ConvertedDocument {
    /// Single-section document without headings.
    pub fn plain(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passages: vec![Passage {
                text: text.into(),
                headings: Vec::new(),
            }],
        }
    }

    /// Runs of consecutive passages sharing a heading path, with their text joined.
    pub fn sections(&self) -> Vec<(&[String], String)> {
        let mut sections: Vec<(&[String], String)> = Vec::new();
        for passage in &self.passages {
            match sections.last_mut() {
                Some((headings, text)) if *headings == passage.headings.as_slice() => {
                    text.push('\n');
                    text.push_str(&passage.text);
                }
                _ => sections.push((passage.headings.as_slice(), passage.text.clone())),
            }
        }
        sections
    }
}

#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert(
        &self,
        source: &ConversionSource,
        options: &ConversionOptions,
    ) -> Result<ConvertedDocument, RagError>;
}
