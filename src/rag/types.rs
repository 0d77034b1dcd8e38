use serde::{Deserialize, Serialize};

/// Separator between headings of a section breadcrumb.
pub const BREADCRUMB_SEPARATOR: &str = " > ";

pub fn breadcrumb(section_path: &[String]) -> String {
    section_path.join(BREADCRUMB_SEPARATOR)
}

/// Bounded window of one document's words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub source_name: String,
    pub section_path: Vec<String>,
    /// Position within the document, counted across sections.
    pub sequence_index: usize,
}

impl Chunk {
    /// Text handed to the embedding provider: the breadcrumb biases the vector
    /// towards its section while the stored content stays raw.
    pub fn embedding_text(&self) -> String {
        if self.section_path.is_empty() {
            return self.text.clone();
        }
        format!("{}\n\n{}", breadcrumb(&self.section_path), self.text)
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedPassage {
    pub content: String,
    pub score: f32,
    pub source_name: String,
    pub section_path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub query: String,
    pub response: String,
}

/// Renders passages into one context block, best match first.
pub fn join_passages(passages: &[RetrievedPassage]) -> String {
    passages
        .iter()
        .map(render_passage)
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub(crate) fn render_passage(passage: &RetrievedPassage) -> String {
    if passage.section_path.is_empty() {
        return passage.content.clone();
    }
    format!("[{}]\n{}", breadcrumb(&passage.section_path), passage.content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(content: &str, path: &[&str]) -> RetrievedPassage {
        RetrievedPassage {
            content: content.to_string(),
            score: 0.5,
            source_name: "doc".to_string(),
            section_path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn embedding_text_prepends_breadcrumb() {
        let chunk = Chunk {
            text: "body words".to_string(),
            source_name: "paper.pdf".to_string(),
            section_path: vec!["Methods".to_string(), "Sampling".to_string()],
            sequence_index: 0,
        };
        assert_eq!(chunk.embedding_text(), "Methods > Sampling\n\nbody words");

        let flat = Chunk {
            section_path: Vec::new(),
            ..chunk
        };
        assert_eq!(flat.embedding_text(), "body words");
    }

    #[test]
    fn join_passages_keeps_order_and_section_labels() {
        let joined = join_passages(&[passage("first", &["Intro"]), passage("second", &[])]);
        assert_eq!(joined, "[Intro]\nfirst\n\nsecond");
        assert_eq!(join_passages(&[]), "");
    }
}
