//! Token stream for one query.
//!
//! Retrieval, prompt assembly, connection retries and streaming all run inside
//! the stream's own polling, so nothing happens ahead of the consumer and
//! dropping the stream drops the provider connection with it.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use tokio::sync::watch;

use super::retry::RetryPolicy;
use super::token::{CancelHandle, GenerationState, GenerationToken};
use crate::core::errors::RagError;
use crate::llm::{CompletionProvider, CompletionRequest, CompletionStream, ProviderError};
use crate::rag::{ConversationTurn, PromptBuilder, Retriever};

/// Knobs for the completion call.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_k: usize,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub retry: RetryPolicy,
}

/// Creates one [`GenerationStream`] per query over shared collaborators.
#[derive(Clone)]
pub struct Generator {
    retriever: Arc<Retriever>,
    prompts: PromptBuilder,
    provider: Arc<dyn CompletionProvider>,
    settings: GenerationSettings,
}

impl Generator {
    pub fn new(
        retriever: Arc<Retriever>,
        prompts: PromptBuilder,
        provider: Arc<dyn CompletionProvider>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            retriever,
            prompts,
            provider,
            settings,
        }
    }

    pub fn generate(&self, query: impl Into<String>, history: Vec<ConversationTurn>) -> GenerationStream {
        let cancel = CancelHandle::new();
        let (state_tx, state_rx) = watch::channel(GenerationState::Idle);
        let machine = Machine {
            generator: self.clone(),
            query: query.into(),
            history,
            phase: Phase::Retrieve,
            state: state_tx,
            cancel: cancel.clone(),
        };

        let tokens = stream::unfold(machine, |mut machine| async move {
            let token = machine.next_token().await?;
            Some((token, machine))
        })
        .boxed();

        GenerationStream {
            tokens,
            state: state_rx,
            cancel,
        }
    }
}

/// Finite, non-restartable sequence of tokens for one query.
pub struct GenerationStream {
    tokens: BoxStream<'static, GenerationToken>,
    state: watch::Receiver<GenerationState>,
    cancel: CancelHandle,
}

impl GenerationStream {
    pub fn state(&self) -> GenerationState {
        *self.state.borrow()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drains the stream into one answer. Retry advisories are left out.
    pub async fn collect_answer(mut self) -> String {
        let mut answer = String::new();
        while let Some(token) = self.tokens.next().await {
            match token {
                GenerationToken::Retrying { .. } => {}
                GenerationToken::Text { text } => answer.push_str(&text),
                other => {
                    if !answer.is_empty() {
                        answer.push_str("\n\n");
                    }
                    answer.push_str(&other.to_string());
                }
            }
        }
        answer
    }
}

impl Stream for GenerationStream {
    type Item = GenerationToken;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.tokens.poll_next_unpin(cx)
    }
}

enum Phase {
    Retrieve,
    Connect {
        request: CompletionRequest,
        retries: u32,
    },
    Backoff {
        request: CompletionRequest,
        retries: u32,
        delay: Duration,
    },
    Streaming(CompletionStream),
    Done,
}

struct Machine {
    generator: Generator,
    query: String,
    history: Vec<ConversationTurn>,
    phase: Phase,
    state: watch::Sender<GenerationState>,
    cancel: CancelHandle,
}

impl Machine {
    fn set_state(&self, state: GenerationState) {
        tracing::debug!("Generation state -> {:?}", state);
        self.state.send_replace(state);
    }

    fn fail(&mut self, token: GenerationToken) -> Option<GenerationToken> {
        tracing::warn!("Generation failed: {}", token);
        self.set_state(GenerationState::Failed);
        Some(token)
    }

    fn stopped(&mut self) -> Option<GenerationToken> {
        tracing::info!("Generation cancelled by caller");
        self.set_state(GenerationState::Cancelled);
        Some(GenerationToken::Stopped)
    }

    async fn next_token(&mut self) -> Option<GenerationToken> {
        let settings = self.generator.settings.clone();
        loop {
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Done => return None,

                Phase::Retrieve => {
                    let context = match self
                        .generator
                        .retriever
                        .retrieve(&self.query, settings.top_k)
                        .await
                    {
                        Ok(context) => context,
                        Err(err) => return self.fail(GenerationToken::from_rag_error(&err)),
                    };
                    self.set_state(GenerationState::ContextRetrieved);

                    if context.is_empty() {
                        self.set_state(GenerationState::Completed);
                        return Some(GenerationToken::no_context());
                    }

                    let prompt = self.generator.prompts.build(&context, &self.history, &self.query);
                    tracing::debug!(
                        "Prompt uses {} passages and {} turns (~{} tokens)",
                        prompt.passages_used,
                        prompt.turns_used,
                        prompt.estimated_tokens
                    );
                    let request = CompletionRequest::new(settings.model.clone(), prompt.messages)
                        .with_sampling(settings.temperature, settings.max_tokens);
                    self.phase = Phase::Connect {
                        request,
                        retries: 0,
                    };
                }

                Phase::Connect { request, retries } => {
                    let provider = self.generator.provider.clone();
                    let cancel = self.cancel.clone();
                    let opened = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return self.stopped(),
                        opened = tokio::time::timeout(settings.connect_timeout, provider.open_stream(&request)) => opened,
                    };

                    match opened {
                        Ok(Ok(stream)) => {
                            self.set_state(GenerationState::Streaming);
                            self.phase = Phase::Streaming(stream);
                        }
                        Err(_) => {
                            return self.fail(GenerationToken::from_rag_error(
                                &RagError::GenerationTimeout(settings.connect_timeout),
                            ));
                        }
                        Ok(Err(err)) if err.is_retryable() && settings.retry.should_retry(retries + 1) => {
                            let attempt = retries + 1;
                            let delay = settings.retry.delay_for(attempt);
                            tracing::warn!(
                                "{} connection failed ({}), retry {}/{} in {:?}",
                                provider.name(),
                                err,
                                attempt,
                                settings.retry.max_retries,
                                delay
                            );
                            self.phase = Phase::Backoff {
                                request,
                                retries: attempt,
                                delay,
                            };
                            return Some(GenerationToken::Retrying {
                                attempt,
                                max_retries: settings.retry.max_retries,
                                delay,
                            });
                        }
                        Ok(Err(ProviderError::Timeout(reason))) => {
                            tracing::debug!("{} connect timed out: {}", provider.name(), reason);
                            return self.fail(GenerationToken::from_rag_error(
                                &RagError::GenerationTimeout(settings.connect_timeout),
                            ));
                        }
                        Ok(Err(err)) => {
                            let err = if err.is_retryable() {
                                RagError::GenerationConnection(format!(
                                    "{} after {} retries",
                                    err, retries
                                ))
                            } else {
                                RagError::GenerationConnection(err.to_string())
                            };
                            return self.fail(GenerationToken::from_rag_error(&err));
                        }
                    }
                }

                Phase::Backoff {
                    request,
                    retries,
                    delay,
                } => {
                    let cancel = self.cancel.clone();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return self.stopped(),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.phase = Phase::Connect { request, retries };
                }

                Phase::Streaming(mut stream) => {
                    let cancel = self.cancel.clone();
                    let next = tokio::select! {
                        biased;
                        // The provider stream is dropped on return, which closes the connection.
                        _ = cancel.cancelled() => return self.stopped(),
                        next = tokio::time::timeout(settings.idle_timeout, stream.next()) => next,
                    };

                    match next {
                        Err(_) => {
                            return self.fail(GenerationToken::from_rag_error(
                                &RagError::GenerationTimeout(settings.idle_timeout),
                            ));
                        }
                        Ok(None) => {
                            self.set_state(GenerationState::Completed);
                            return None;
                        }
                        Ok(Some(Err(err))) => {
                            return self.fail(GenerationToken::from_provider_error(&err));
                        }
                        Ok(Some(Ok(increment))) => {
                            self.phase = Phase::Streaming(stream);
                            match increment {
                                Some(text) if !text.is_empty() => {
                                    return Some(GenerationToken::text(text));
                                }
                                _ => continue,
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::index::{DistanceMetric, IndexedPoint, InMemoryIndex, PointPayload, VectorIndex};
    use crate::rag::testing::HashEmbedder;
    use crate::rag::Embedder;

    const DIM: usize = 32;

    /// Completion provider scripted per connection attempt.
    struct ScriptedProvider {
        /// Number of leading attempts that fail to connect.
        failures: usize,
        failure: ProviderError,
        increments: Vec<Result<Option<String>, ProviderError>>,
        hang_after_increments: bool,
        attempts: AtomicUsize,
        released: Arc<AtomicBool>,
        last_request: Mutex<Option<CompletionRequest>>,
    }

    impl ScriptedProvider {
        fn streaming(words: &[&str]) -> Self {
            Self {
                failures: 0,
                failure: ProviderError::Connection("refused".into()),
                increments: words.iter().map(|w| Ok(Some(w.to_string()))).collect(),
                hang_after_increments: false,
                attempts: AtomicUsize::new(0),
                released: Arc::new(AtomicBool::new(false)),
                last_request: Mutex::new(None),
            }
        }
    }

    struct ReleaseGuard(Arc<AtomicBool>);

    impl Drop for ReleaseGuard {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn open_stream(&self, request: &CompletionRequest) -> Result<CompletionStream, ProviderError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request.clone());
            if attempt < self.failures {
                return Err(self.failure.clone());
            }
            let guard = ReleaseGuard(self.released.clone());
            let items = stream::iter(self.increments.clone()).map(move |item| {
                let _held = &guard;
                item
            });
            if self.hang_after_increments {
                Ok(items.chain(stream::pending()).boxed())
            } else {
                Ok(items.boxed())
            }
        }
    }

    fn settings() -> GenerationSettings {
        GenerationSettings {
            model: "test-model".to_string(),
            temperature: Some(0.0),
            max_tokens: Some(64),
            top_k: 3,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(10),
            retry: RetryPolicy {
                max_retries: 3,
                initial_delay_ms: 100,
                multiplier: 2,
                max_delay_ms: 10_000,
            },
        }
    }

    async fn retriever(texts: &[&str]) -> Arc<Retriever> {
        let provider = HashEmbedder::new(DIM);
        let index = Arc::new(InMemoryIndex::new());
        index
            .ensure_collection("papers", DIM, DistanceMetric::Cosine)
            .await
            .unwrap();
        let points: Vec<IndexedPoint> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| IndexedPoint {
                id: i as u64,
                vector: provider.vector(text),
                payload: PointPayload::text(*text, Vec::new(), "doc.pdf"),
            })
            .collect();
        index.upsert("papers", points).await.unwrap();
        Arc::new(Retriever::new(Embedder::new(Arc::new(provider), DIM), index, "papers"))
    }

    async fn generator(provider: Arc<ScriptedProvider>) -> Generator {
        Generator::new(
            retriever(&["attention is all you need"]).await,
            PromptBuilder::default(),
            provider,
            settings(),
        )
    }

    #[tokio::test]
    async fn streams_increments_in_order_and_completes() {
        let mut provider = ScriptedProvider::streaming(&["Hello", " ", "world"]);
        provider.increments.insert(1, Ok(None));
        let provider = Arc::new(provider);
        let mut stream = generator(provider.clone()).await.generate("what is attention", Vec::new());

        assert_eq!(stream.state(), GenerationState::Idle);
        let tokens: Vec<_> = (&mut stream).collect().await;

        assert_eq!(
            tokens,
            vec![
                GenerationToken::text("Hello"),
                GenerationToken::text(" "),
                GenerationToken::text("world"),
            ]
        );
        assert_eq!(stream.state(), GenerationState::Completed);
        let request = provider.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.model, "test-model");
        assert!(request.messages[0].content.contains("attention is all you need"));
    }

    #[tokio::test]
    async fn empty_context_short_circuits() {
        let provider = Arc::new(ScriptedProvider::streaming(&["never"]));
        let generator = Generator::new(
            retriever(&[]).await,
            PromptBuilder::default(),
            provider.clone(),
            settings(),
        );
        let mut stream = generator.generate("anything", Vec::new());

        let tokens: Vec<_> = (&mut stream).collect().await;

        assert_eq!(tokens, vec![GenerationToken::no_context()]);
        assert_eq!(stream.state(), GenerationState::Completed);
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_growing_delay_then_streams() {
        let mut provider = ScriptedProvider::streaming(&["ok"]);
        provider.failures = 2;
        let provider = Arc::new(provider);
        let mut stream = generator(provider.clone()).await.generate("attention", Vec::new());

        let first = stream.next().await.unwrap();
        let t1 = tokio::time::Instant::now();
        let second = stream.next().await.unwrap();
        let t2 = tokio::time::Instant::now();
        let third = stream.next().await.unwrap();
        let t3 = tokio::time::Instant::now();

        assert!(matches!(first, GenerationToken::Retrying { attempt: 1, max_retries: 3, .. }));
        assert!(matches!(second, GenerationToken::Retrying { attempt: 2, .. }));
        assert_eq!(third, GenerationToken::text("ok"));
        assert!(t2 - t1 >= Duration::from_millis(100));
        assert!(t3 - t2 >= Duration::from_millis(200));
        assert!(stream.next().await.is_none());
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(stream.state(), GenerationState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_with_connection_error() {
        let mut provider = ScriptedProvider::streaming(&["never"]);
        provider.failures = usize::MAX;
        let provider = Arc::new(provider);
        let mut stream = generator(provider.clone()).await.generate("attention", Vec::new());

        let tokens: Vec<_> = (&mut stream).collect().await;

        let retries = tokens
            .iter()
            .filter(|t| matches!(t, GenerationToken::Retrying { .. }))
            .count();
        assert_eq!(retries, 3);
        assert!(matches!(tokens.last(), Some(GenerationToken::Error { kind, .. }) if kind == "connection"));
        assert_eq!(stream.state(), GenerationState::Failed);
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let mut provider = ScriptedProvider::streaming(&["never"]);
        provider.failures = 1;
        provider.failure = ProviderError::Status {
            status: 401,
            body: "bad key".into(),
        };
        let provider = Arc::new(provider);
        let stream = generator(provider.clone()).await.generate("attention", Vec::new());

        let tokens: Vec<_> = stream.collect().await;

        assert_eq!(tokens.len(), 1);
        assert!(matches!(&tokens[0], GenerationToken::Error { message, .. } if message.contains("bad key")));
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_after_n_tokens_stops_and_releases_connection() {
        let mut provider = ScriptedProvider::streaming(&["a", "b", "c", "d"]);
        provider.hang_after_increments = true;
        let provider = Arc::new(provider);
        let mut stream = generator(provider.clone()).await.generate("attention", Vec::new());

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        stream.cancel_handle().cancel();
        let marker = stream.next().await.unwrap();

        assert_eq!(first, GenerationToken::text("a"));
        assert_eq!(second, GenerationToken::text("b"));
        assert_eq!(marker, GenerationToken::Stopped);
        assert!(provider.released.load(Ordering::SeqCst));
        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), GenerationState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_times_out() {
        let mut provider = ScriptedProvider::streaming(&["partial"]);
        provider.hang_after_increments = true;
        let provider = Arc::new(provider);
        let mut stream = generator(provider).await.generate("attention", Vec::new());

        assert_eq!(stream.next().await.unwrap(), GenerationToken::text("partial"));
        let token = stream.next().await.unwrap();

        assert!(matches!(token, GenerationToken::Error { ref kind, .. } if kind == "timeout"));
        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), GenerationState::Failed);
    }

    #[tokio::test]
    async fn mid_stream_error_is_reported_after_partial_output() {
        let mut provider = ScriptedProvider::streaming(&["partial"]);
        provider
            .increments
            .push(Err(ProviderError::Stream("model overloaded".into())));
        let stream = generator(Arc::new(provider)).await.generate("attention", Vec::new());

        let answer = stream.collect_answer().await;

        assert_eq!(answer, "partial\n\nError (stream): model overloaded");
    }

    #[tokio::test]
    async fn dropping_the_stream_releases_the_connection() {
        let mut provider = ScriptedProvider::streaming(&["a"]);
        provider.hang_after_increments = true;
        let provider = Arc::new(provider);
        let mut stream = generator(provider.clone()).await.generate("attention", Vec::new());

        stream.next().await.unwrap();
        assert!(!provider.released.load(Ordering::SeqCst));
        drop(stream);

        assert!(provider.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn provider_connect_timeout_is_reported_as_timeout() {
        let mut provider = ScriptedProvider::streaming(&["never"]);
        provider.failures = 1;
        provider.failure = ProviderError::Timeout("operation timed out".into());
        let provider = Arc::new(provider);
        let mut stream = generator(provider.clone()).await.generate("attention", Vec::new());

        let tokens: Vec<_> = (&mut stream).collect().await;

        assert_eq!(tokens.len(), 1);
        assert!(matches!(&tokens[0], GenerationToken::Error { kind, .. } if kind == "timeout"));
        assert_eq!(stream.state(), GenerationState::Failed);
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelling_one_query_leaves_a_concurrent_one_running() {
        let provider = Arc::new(ScriptedProvider::streaming(&["a", "b", "c"]));
        let generator = generator(provider.clone()).await;
        let mut cancelled = generator.generate("attention", Vec::new());
        let mut running = generator.generate("attention please", Vec::new());

        let (stopped, finished) = tokio::join!(
            async {
                let first = cancelled.next().await;
                cancelled.cancel();
                let rest: Vec<_> = (&mut cancelled).collect().await;
                (first, rest)
            },
            async { (&mut running).collect::<Vec<_>>().await },
        );

        assert_eq!(stopped.0, Some(GenerationToken::text("a")));
        assert_eq!(stopped.1, vec![GenerationToken::Stopped]);
        assert_eq!(cancelled.state(), GenerationState::Cancelled);
        assert_eq!(
            finished,
            vec![
                GenerationToken::text("a"),
                GenerationToken::text("b"),
                GenerationToken::text("c"),
            ]
        );
        assert_eq!(running.state(), GenerationState::Completed);
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 2);
    }
}
