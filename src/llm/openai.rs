//! OpenAI-compatible HTTP endpoints (`/v1/chat/completions`, `/v1/embeddings`).
//!
//! Works against Ollama, LM Studio, llama.cpp server and hosted OpenAI-style APIs.

use std::collections::VecDeque;
use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};

use super::provider::{CompletionProvider, CompletionStream, EmbeddingProvider, ProviderError};
use super::types::CompletionRequest;

fn build_client(
    api_key: Option<&str>,
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
) -> Result<Client, ProviderError> {
    let mut headers = HeaderMap::new();
    if let Some(key) = api_key.map(str::trim).filter(|k| !k.is_empty()) {
        let value = HeaderValue::from_str(&format!("Bearer {}", key))
            .map_err(|_| ProviderError::Connection("invalid API key".to_string()))?;
        headers.insert(AUTHORIZATION, value);
    }

    let mut builder = Client::builder()
        .connect_timeout(connect_timeout)
        .default_headers(headers);
    if let Some(timeout) = request_timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|err| ProviderError::Connection(err.to_string()))
}

async fn ensure_success(res: Response) -> Result<Response, ProviderError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(ProviderError::Status {
        status: status.as_u16(),
        body,
    })
}

#[derive(Clone)]
pub struct OpenAiCompletions {
    base_url: String,
    client: Client,
}

impl OpenAiCompletions {
    /// Streams have no overall deadline; progress is bounded by the caller.
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        connect_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: build_client(api_key, connect_timeout, None)?,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompletions {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn open_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": true,
        });
        if let Some(obj) = body.as_object_mut() {
            if let Some(t) = request.temperature {
                obj.insert("temperature".to_string(), json!(t));
            }
            if let Some(t) = request.max_tokens {
                obj.insert("max_tokens".to_string(), json!(t));
            }
        }

        let res = self.client.post(&url).json(&body).send().await?;
        let res = ensure_success(res).await?;
        Ok(sse_increments(Box::pin(res.bytes_stream())))
    }
}

#[derive(Clone)]
pub struct OpenAiEmbeddings {
    base_url: String,
    model: String,
    client: Client,
}

impl OpenAiEmbeddings {
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: build_client(api_key, timeout, Some(timeout))?,
        })
    }
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = json!({
            "model": self.model,
            "input": inputs,
        });

        let res = self.client.post(&url).json(&body).send().await?;
        let res = ensure_success(res).await?;
        let mut payload: EmbeddingsResponse = res
            .json()
            .await
            .map_err(|err| ProviderError::Stream(format!("invalid embeddings response: {}", err)))?;

        if payload.data.len() != inputs.len() {
            return Err(ProviderError::Stream(format!(
                "provider returned {} embeddings for {} inputs",
                payload.data.len(),
                inputs.len()
            )));
        }
        payload.data.sort_by_key(|d| d.index.unwrap_or(0));
        Ok(payload.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Splits a byte stream into `data:` lines. Bytes are buffered until a newline
/// so frames and multi-byte characters may straddle network chunks.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(raw: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(raw);
    let data = line.trim().strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    if data.is_empty() {
        return None;
    }
    Some(SseEvent::Data(data.to_string()))
}

fn parse_delta(data: &str) -> Result<Option<String>, ProviderError> {
    let value: Value = serde_json::from_str(data).map_err(|_| {
        let preview: String = data.chars().take(80).collect();
        ProviderError::Stream(format!("malformed stream frame: {}", preview))
    })?;

    if let Some(error) = value.get("error") {
        let message = error["message"]
            .as_str()
            .or_else(|| error.as_str())
            .unwrap_or("provider reported an error");
        return Err(ProviderError::Stream(message.to_string()));
    }

    Ok(value["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string))
}

struct SseState<S> {
    body: S,
    decoder: SseDecoder,
    pending: VecDeque<Result<Option<String>, ProviderError>>,
    done: bool,
}

/// Turns a chat-completion SSE body into increments, reading the body only
/// when the consumer asks for the next item.
fn sse_increments<S, B, E>(body: S) -> CompletionStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = SseState {
        body,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                if item.is_err() {
                    st.done = true;
                    st.pending.clear();
                }
                return Some((item, st));
            }
            if st.done {
                return None;
            }

            match st.body.next().await {
                Some(Ok(chunk)) => {
                    for event in st.decoder.push(chunk.as_ref()) {
                        match event {
                            SseEvent::Data(data) => st.pending.push_back(parse_delta(&data)),
                            SseEvent::Done => {
                                st.done = true;
                                break;
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    st.done = true;
                    return Some((Err(ProviderError::Stream(err.to_string())), st));
                }
                None => {
                    st.done = true;
                    if let Some(SseEvent::Data(data)) = st.decoder.finish() {
                        st.pending.push_back(parse_delta(&data));
                    }
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ChatMessage;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn frame(content: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({ "choices": [{ "index": 0, "delta": { "content": content } }] })
        )
    }

    async fn collect(stream: CompletionStream) -> Vec<Result<Option<String>, ProviderError>> {
        stream.collect().await
    }

    #[test]
    fn decoder_joins_frames_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        let events = decoder.push(b":1}\n\n: keep-alive\ndata: [DONE]\n");
        assert_eq!(
            events,
            vec![SseEvent::Data("{\"a\":1}".to_string()), SseEvent::Done]
        );
    }

    #[test]
    fn decoder_keeps_multibyte_characters_intact() {
        let mut decoder = SseDecoder::default();
        let text = "data: héllo\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(decoder.push(&text[..split]).is_empty());
        assert_eq!(
            decoder.push(&text[split..]),
            vec![SseEvent::Data("héllo".to_string())]
        );
    }

    #[test]
    fn delta_without_content_is_empty_increment() {
        let role_only = json!({ "choices": [{ "delta": { "role": "assistant" } }] }).to_string();
        assert_eq!(parse_delta(&role_only).unwrap(), None);
        assert_eq!(
            parse_delta(&json!({ "choices": [{ "delta": { "content": "hi" } }] }).to_string())
                .unwrap(),
            Some("hi".to_string())
        );
    }

    #[test]
    fn error_payload_and_garbage_are_stream_errors() {
        let err = parse_delta(r#"{"error":{"message":"model overloaded"}}"#).unwrap_err();
        assert!(matches!(err, ProviderError::Stream(msg) if msg == "model overloaded"));
        assert!(matches!(parse_delta("{not json"), Err(ProviderError::Stream(_))));
    }

    #[tokio::test]
    async fn increments_stop_at_done_and_after_errors() {
        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(format!("{}{}", frame("a"), frame("b")).into_bytes()),
            Ok(b"data: [DONE]\n\n".to_vec()),
            Ok(frame("ignored").into_bytes()),
        ];
        let items = collect(sse_increments(stream::iter(chunks))).await;
        let texts: Vec<_> = items.into_iter().map(|i| i.unwrap()).collect();
        assert_eq!(texts, vec![Some("a".to_string()), Some("b".to_string())]);

        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(format!("{}data: oops\n\n{}", frame("a"), frame("b")).into_bytes()),
        ];
        let items = collect(sse_increments(stream::iter(chunks))).await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn body_error_mid_stream_is_reported_once() {
        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(frame("partial").into_bytes()),
            Err("connection reset".to_string()),
            Ok(frame("never").into_bytes()),
        ];
        let items = collect(sse_increments(stream::iter(chunks))).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[1], Err(ProviderError::Stream(msg)) if msg == "connection reset"));
    }

    #[tokio::test]
    async fn streams_chat_completion_from_server() {
        let server = MockServer::start().await;
        let body = format!(
            "data: {}\n\n{}{}data: [DONE]\n\n",
            json!({ "choices": [{ "delta": { "role": "assistant" } }] }),
            frame("Hello"),
            frame(" world")
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({ "model": "m", "stream": true, "max_tokens": 64 })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let provider =
            OpenAiCompletions::new(&server.uri(), Some("sk-test"), Duration::from_secs(5))
                .unwrap();
        let request = CompletionRequest::new("m", vec![ChatMessage::user("hi")])
            .with_sampling(None, Some(64));
        let items = collect(provider.open_stream(&request).await.unwrap()).await;
        let items: Vec<_> = items.into_iter().map(|i| i.unwrap()).collect();

        assert_eq!(
            items,
            vec![None, Some("Hello".to_string()), Some(" world".to_string())]
        );
    }

    #[tokio::test]
    async fn error_status_is_reported_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("loading model"))
            .mount(&server)
            .await;

        let provider = OpenAiCompletions::new(&server.uri(), None, Duration::from_secs(5)).unwrap();
        let request = CompletionRequest::new("m", vec![ChatMessage::user("hi")]);
        let err = provider.open_stream(&request).await.err().unwrap();

        assert!(err.is_retryable());
        assert!(matches!(err, ProviderError::Status { status: 503, body } if body == "loading model"));
    }

    #[tokio::test]
    async fn refused_connection_is_retryable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider =
            OpenAiCompletions::new(&format!("http://{addr}"), None, Duration::from_secs(2))
                .unwrap();
        let request = CompletionRequest::new("m", vec![ChatMessage::user("hi")]);
        let err = provider.open_stream(&request).await.err().unwrap();
        assert!(matches!(err, ProviderError::Connection(_)));
    }

    #[tokio::test]
    async fn embeddings_are_returned_in_input_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(body_partial_json(json!({ "model": "mini", "input": ["a", "b"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [
                    { "object": "embedding", "index": 1, "embedding": [0.0, 1.0] },
                    { "object": "embedding", "index": 0, "embedding": [1.0, 0.0] }
                ]
            })))
            .mount(&server)
            .await;

        let provider =
            OpenAiEmbeddings::new(&server.uri(), None, "mini", Duration::from_secs(5)).unwrap();
        let vectors = provider
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();

        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn embedding_count_mismatch_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [ { "index": 0, "embedding": [1.0] } ]
            })))
            .mount(&server)
            .await;

        let provider =
            OpenAiEmbeddings::new(&server.uri(), None, "mini", Duration::from_secs(5)).unwrap();
        let err = provider
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Stream(_)));
    }
}
