use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ConversionOptions, ConversionSource, ConvertedDocument, DocumentConverter, Passage};
use crate::core::errors::RagError;

/// Client of a conversion service exposing `POST /convert`.
#[derive(Clone)]
pub struct HttpConverter {
    base_url: String,
    client: Client,
}

impl HttpConverter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RagError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RagError::ConversionFailed(err.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[derive(Deserialize)]
struct ConvertResponse {
    #[serde(default)]
    name: Option<String>,
    passages: Vec<Passage>,
}

fn source_body(source: &ConversionSource) -> Value {
    match source {
        ConversionSource::Url(url) => json!({ "kind": "url", "url": url }),
        ConversionSource::File { name, bytes } => json!({
            "kind": "file",
            "name": name,
            "content_base64": STANDARD.encode(bytes),
        }),
    }
}

#[async_trait]
impl DocumentConverter for HttpConverter {
    async fn convert(
        &self,
        source: &ConversionSource,
        options: &ConversionOptions,
    ) -> Result<ConvertedDocument, RagError> {
        let display_name = source.display_name();
        let body = json!({
            "source": source_body(source),
            "options": options,
        });

        let res = self
            .client
            .post(format!("{}/convert", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                RagError::ConversionFailed(format!("{}: {}", display_name, err))
            })?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(RagError::ConversionFailed(format!(
                "{}: service returned {}: {}",
                display_name, status, text
            )));
        }

        let parsed: ConvertResponse = res.json().await.map_err(|err| {
            RagError::ConversionFailed(format!("{}: invalid response: {}", display_name, err))
        })?;

        tracing::debug!(
            "Converted '{}' into {} passages",
            display_name,
            parsed.passages.len()
        );

        Ok(ConvertedDocument {
            name: parsed
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or(display_name),
            passages: parsed.passages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn uploads_file_as_base64_with_options() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/convert"))
            .and(body_partial_json(json!({
                "source": { "kind": "file", "name": "a.pdf", "content_base64": "JVBERi0=" },
                "options": { "do_ocr": false, "do_table_structure": true }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "passages": [
                    { "text": "Abstract text", "headings": ["Abstract"] },
                    { "text": "Body" }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let converter = HttpConverter::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let source = ConversionSource::file("a.pdf", b"%PDF-".to_vec()).unwrap();
        let options = ConversionOptions {
            do_ocr: false,
            ..ConversionOptions::default()
        };

        let doc = converter.convert(&source, &options).await.unwrap();

        assert_eq!(doc.name, "a.pdf");
        assert_eq!(doc.passages.len(), 2);
        assert_eq!(doc.passages[0].headings, vec!["Abstract".to_string()]);
        assert!(doc.passages[1].headings.is_empty());
    }

    #[tokio::test]
    async fn service_errors_become_conversion_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/convert"))
            .respond_with(ResponseTemplate::new(422).set_body_string("encrypted pdf"))
            .mount(&server)
            .await;

        let converter = HttpConverter::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let source = ConversionSource::Url("https://example.com/locked.pdf".to_string());
        let err = converter
            .convert(&source, &ConversionOptions::default())
            .await
            .unwrap_err();

        assert!(
            matches!(err, RagError::ConversionFailed(msg) if msg.contains("locked.pdf") && msg.contains("encrypted pdf"))
        );
    }
}
