//! Response Generator - drives a native session to a full reply or a token stream
//!
//! Streaming runs on a worker task feeding a bounded channel. The worker
//! checks the cancel token between token batches and hands the outcome to a
//! finisher before the channel closes, so the next request on the same
//! session always sees the finished state.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::provider::{
    CompletionRequest, CompletionResponse, InferenceRuntime, LlmError, Message, MessageRole, SessionHandle,
    ToolDefinition,
};

/// Per-request generation options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Conversation thread; None runs on a throwaway session
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub disable_tools: bool,
    /// Answer from system messages and the prompt only, leaving thread state untouched
    #[serde(default)]
    pub disable_history: bool,
    #[serde(skip)]
    pub cancel: Option<CancellationToken>,
}

/// How a streamed generation ended
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    /// Runtime finished; carries the full reply text
    Completed(String),
    Cancelled,
    Failed,
}

/// Runs once the worker has stopped pulling tokens, before the stream ends
pub type StreamFinisher = Box<dyn FnOnce(StreamOutcome) -> BoxFuture<'static, ()> + Send>;

/// Split a message list into (history, prompt)
pub fn split_prompt(messages: &[Message]) -> Result<(&[Message], &Message), LlmError> {
    match messages.split_last() {
        Some((prompt, history)) => Ok((history, prompt)),
        None => Err(LlmError::InvalidRequest("messages must not be empty".to_string())),
    }
}

/// System messages only, for history-free generation
pub fn system_only(history: &[Message]) -> Vec<Message> {
    history
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .cloned()
        .collect()
}

pub struct ResponseGenerator {
    runtime: Arc<dyn InferenceRuntime>,
    stream_buffer: usize,
}

impl ResponseGenerator {
    pub fn new(runtime: Arc<dyn InferenceRuntime>, stream_buffer: usize) -> Self {
        Self {
            runtime,
            stream_buffer: stream_buffer.max(1),
        }
    }

    pub fn build_request(&self, prompt: &Message, options: &GenerateOptions) -> CompletionRequest {
        CompletionRequest {
            prompt: prompt.clone(),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            tools: if options.disable_tools {
                Vec::new()
            } else {
                options.tools.clone()
            },
        }
    }

    /// Run a completion to the end, or stop with `Cancelled`
    pub async fn generate(
        &self,
        session: SessionHandle,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, LlmError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            result = self.runtime.complete(session, request) => result,
        }
    }

    /// Start a streaming completion on a worker task.
    ///
    /// An error after chunks were delivered arrives as `Truncated`; chunks
    /// already sent stay valid.
    pub fn spawn_stream(
        &self,
        session: SessionHandle,
        request: CompletionRequest,
        cancel: CancellationToken,
        finish: StreamFinisher,
    ) -> mpsc::Receiver<Result<String, LlmError>> {
        let (tx, rx) = mpsc::channel(self.stream_buffer);
        let runtime = Arc::clone(&self.runtime);

        tokio::spawn(async move {
            let outcome = pump_tokens(runtime, session, request, &cancel, &tx).await;
            finish(outcome).await;
            drop(tx);
        });

        rx
    }
}

async fn pump_tokens(
    runtime: Arc<dyn InferenceRuntime>,
    session: SessionHandle,
    request: CompletionRequest,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<Result<String, LlmError>>,
) -> StreamOutcome {
    let started = tokio::select! {
        biased;
        _ = cancel.cancelled() => return StreamOutcome::Cancelled,
        started = runtime.complete_stream(session, request) => started,
    };
    let mut tokens = match started {
        Ok(tokens) => tokens,
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            return StreamOutcome::Failed;
        }
    };

    let mut text = String::new();
    let mut delivered = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamOutcome::Cancelled,
            _ = tx.closed() => return StreamOutcome::Cancelled,
            next = tokens.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                crate::perf_trace!("Token batch {} on session {:?}: {} bytes", delivered, session, chunk.len());
                text.push_str(&chunk);
                delivered += 1;
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    sent = tx.send(Ok(chunk)) => sent.is_ok(),
                };
                if !sent {
                    return StreamOutcome::Cancelled;
                }
            }
            Some(Err(e)) => {
                let err = if delivered > 0 {
                    LlmError::Truncated(e.to_string())
                } else {
                    e
                };
                log::warn!("Stream on session {:?} failed after {} chunks: {}", session, delivered, err);
                let _ = tx.send(Err(err)).await;
                return StreamOutcome::Failed;
            }
            None => {
                crate::perf_debug!("Stream on session {:?} finished with {} chunks", session, delivered);
                return StreamOutcome::Completed(text);
            }
        }
    }
}

/// A finite, non-restartable sequence of reply chunks.
///
/// Dropping the stream cancels the generation.
pub struct GenerationStream {
    request_id: String,
    model_id: String,
    thread_id: Option<String>,
    cancel: CancellationToken,
    chunks: mpsc::Receiver<Result<String, LlmError>>,
}

impl GenerationStream {
    pub fn new(
        request_id: String,
        model_id: String,
        thread_id: Option<String>,
        cancel: CancellationToken,
        chunks: mpsc::Receiver<Result<String, LlmError>>,
    ) -> Self {
        Self {
            request_id,
            model_id,
            thread_id,
            cancel,
            chunks,
        }
    }

    /// Id for `cancel_generation`
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain the stream into one string
    pub async fn collect_text(mut self) -> Result<String, LlmError> {
        let mut text = String::new();
        while let Some(chunk) = self.next().await {
            text.push_str(&chunk?);
        }
        Ok(text)
    }
}

impl Stream for GenerationStream {
    type Item = Result<String, LlmError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.chunks.poll_recv(cx)
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_engine::settings::LoadSettings;
    use crate::llm_engine::testing::ScriptedRuntime;
    use futures_util::FutureExt;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::oneshot;

    const SETTINGS: LoadSettings = LoadSettings {
        gpu_layers: 0,
        context_size: 2048,
        batch_size: 512,
    };

    async fn session(runtime: &Arc<ScriptedRuntime>) -> SessionHandle {
        let model = runtime.load_model(Path::new("m.gguf"), &SETTINGS).await.unwrap();
        runtime.create_session(model).await.unwrap()
    }

    fn finisher() -> (StreamFinisher, oneshot::Receiver<StreamOutcome>) {
        let (tx, rx) = oneshot::channel();
        let finish: StreamFinisher = Box::new(move |outcome: StreamOutcome| {
            async move {
                let _ = tx.send(outcome);
            }
            .boxed()
        });
        (finish, rx)
    }

    #[test]
    fn test_split_prompt() {
        let messages = vec![Message::system("s"), Message::user("q")];
        let (history, prompt) = split_prompt(&messages).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(prompt.content, "q");
        assert!(matches!(split_prompt(&[]), Err(LlmError::InvalidRequest(_))));
    }

    #[test]
    fn test_disable_tools_strips_tools() {
        let generator = ResponseGenerator::new(Arc::new(ScriptedRuntime::new()), 1);
        let options = GenerateOptions {
            tools: vec![ToolDefinition {
                name: "clock".into(),
                description: "time".into(),
                parameters: serde_json::json!({}),
            }],
            disable_tools: true,
            ..Default::default()
        };
        assert!(generator.build_request(&Message::user("q"), &options).tools.is_empty());
    }

    #[tokio::test]
    async fn test_generate_honours_cancel() {
        let runtime = Arc::new(ScriptedRuntime {
            complete_delay: Duration::from_secs(5),
            ..Default::default()
        });
        let session = session(&runtime).await;
        let generator = ResponseGenerator::new(runtime.clone(), 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let request = generator.build_request(&Message::user("q"), &GenerateOptions::default());
        let result = generator.generate(session, request, &cancel).await;
        assert_eq!(result, Err(LlmError::Cancelled));
    }

    #[tokio::test]
    async fn test_stream_completes_with_full_text() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let session = session(&runtime).await;
        let generator = ResponseGenerator::new(runtime.clone(), 1);
        let (finish, outcome) = finisher();

        let request = generator.build_request(&Message::user("hello"), &GenerateOptions::default());
        let rx = generator.spawn_stream(session, request, CancellationToken::new(), finish);
        let stream = GenerationStream::new("r".into(), "m".into(), None, CancellationToken::new(), rx);

        let text = stream.collect_text().await.unwrap();
        assert_eq!(text, "echo hello after []");
        assert_eq!(outcome.await.unwrap(), StreamOutcome::Completed(text));
    }

    #[tokio::test]
    async fn test_mid_stream_failure_is_truncated() {
        let runtime = Arc::new(ScriptedRuntime {
            stream_len: 5,
            fail_stream_after: Some(2),
            ..Default::default()
        });
        let session = session(&runtime).await;
        let generator = ResponseGenerator::new(runtime.clone(), 1);
        let (finish, outcome) = finisher();

        let request = generator.build_request(&Message::user("q"), &GenerateOptions::default());
        let mut rx = generator.spawn_stream(session, request, CancellationToken::new(), finish);

        assert_eq!(rx.recv().await.unwrap().unwrap(), "t0 ");
        assert_eq!(rx.recv().await.unwrap().unwrap(), "t1 ");
        assert!(matches!(rx.recv().await.unwrap(), Err(LlmError::Truncated(_))));
        assert!(rx.recv().await.is_none());
        assert_eq!(outcome.await.unwrap(), StreamOutcome::Failed);
    }

    #[tokio::test]
    async fn test_failure_before_first_chunk_passes_through() {
        let runtime = Arc::new(ScriptedRuntime {
            stream_len: 5,
            fail_stream_after: Some(0),
            ..Default::default()
        });
        let session = session(&runtime).await;
        let generator = ResponseGenerator::new(runtime.clone(), 1);
        let (finish, _outcome) = finisher();

        let request = generator.build_request(&Message::user("q"), &GenerateOptions::default());
        let mut rx = generator.spawn_stream(session, request, CancellationToken::new(), finish);
        assert!(matches!(rx.recv().await.unwrap(), Err(LlmError::RuntimeFailure(_))));
    }

    #[tokio::test]
    async fn test_cancel_stops_production() {
        let runtime = Arc::new(ScriptedRuntime {
            stream_len: 1000,
            token_delay: Duration::from_millis(1),
            ..Default::default()
        });
        let session = session(&runtime).await;
        let generator = ResponseGenerator::new(runtime.clone(), 1);
        let (finish, outcome) = finisher();
        let cancel = CancellationToken::new();

        let request = generator.build_request(&Message::user("q"), &GenerateOptions::default());
        let mut rx = generator.spawn_stream(session, request, cancel.clone(), finish);
        rx.recv().await.unwrap().unwrap();
        cancel.cancel();

        assert_eq!(outcome.await.unwrap(), StreamOutcome::Cancelled);
        let produced = runtime.tokens_produced.load(Ordering::SeqCst);
        assert!(produced < 10, "produced {} tokens after cancel", produced);
    }
}
