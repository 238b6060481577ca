//! Response Service - thread-aware generation on loaded models
//!
//! A thread's work runs while holding its session lock (see `sessions`), so a
//! history update issued before a generation is always visible to it. Every
//! generation is tracked in the task registry for cancellation.

use std::sync::Arc;

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};

use super::generator::{
    split_prompt, system_only, GenerateOptions, GenerationStream, ResponseGenerator, StreamFinisher, StreamOutcome,
};
use super::provider::{CompletionResponse, InferenceRuntime, LlmError, Message, SessionHandle};
use super::registry::{ModelRegistry, ModelRuntimeInfo};
use super::sessions::SessionManager;
use super::settings::LoadSettings;
use super::task_registry::GenerationTaskRegistry;

/// Read-only view of a model's runtime state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub model_id: String,
    pub loaded: bool,
    pub settings: Option<LoadSettings>,
    pub runtime: Option<ModelRuntimeInfo>,
    pub active_threads: usize,
    pub active_generations: usize,
}

pub struct ResponseService {
    registry: ModelRegistry,
    sessions: Arc<SessionManager>,
    tasks: Arc<GenerationTaskRegistry>,
    generator: ResponseGenerator,
}

impl ResponseService {
    pub fn new(
        runtime: Arc<dyn InferenceRuntime>,
        registry: ModelRegistry,
        sessions: Arc<SessionManager>,
        tasks: Arc<GenerationTaskRegistry>,
        stream_buffer: usize,
    ) -> Self {
        Self {
            registry,
            sessions,
            tasks,
            generator: ResponseGenerator::new(runtime, stream_buffer),
        }
    }

    /// Bring a thread's native session in line with `messages`.
    ///
    /// Waits behind any update or generation already queued on the thread.
    pub async fn update_session_history(
        &self,
        model_id: &str,
        thread_id: &str,
        messages: &[Message],
    ) -> Result<bool, LlmError> {
        let mut thread = self.sessions.acquire(model_id, thread_id).await?;
        self.sessions.update_history(&mut thread, messages).await
    }

    /// Generate a full reply to the last message of `messages`
    pub async fn generate_response(
        &self,
        model_id: &str,
        messages: &[Message],
        options: GenerateOptions,
    ) -> Result<CompletionResponse, LlmError> {
        let (history, prompt) = split_prompt(messages)?;
        self.ensure_loaded(model_id)?;
        let thread_id = thread_for(&options);

        let (request_id, cancel) = self.tasks.register(model_id, thread_id, options.cancel.as_ref());
        let request = self.generator.build_request(prompt, &options);
        log::info!(
            "Generating on model {} (thread {:?}, request {})",
            model_id,
            thread_id,
            request_id
        );

        let result = match thread_id {
            Some(thread_id) => {
                let outcome = async {
                    let mut thread = self.sessions.acquire(model_id, thread_id).await?;
                    self.sessions.update_history(&mut thread, history).await?;
                    let session = thread
                        .handle()
                        .ok_or_else(|| LlmError::RuntimeFailure("thread has no native session".to_string()))?;
                    let result = self.generator.generate(session, request, &cancel).await;
                    match &result {
                        Ok(response) => thread.record_turn(prompt.clone(), Message::assistant(response.content.clone())),
                        Err(_) => thread.invalidate_history(),
                    }
                    result
                };
                outcome.await
            }
            None => {
                let history = ephemeral_history(history, &options);
                match self.sessions.ephemeral(model_id, &history).await {
                    Ok(session) => {
                        let result = self.generator.generate(session.handle(), request, &cancel).await;
                        self.sessions.release(session).await;
                        result
                    }
                    Err(e) => Err(e),
                }
            }
        };

        self.tasks.remove(&request_id);
        match &result {
            Err(LlmError::Cancelled) => log::info!("Generation {} cancelled", request_id),
            Err(e) => log::error!("Generation {} failed: {}", request_id, e),
            Ok(_) => {}
        }
        result
    }

    /// Stream a reply to the last message of `messages`.
    ///
    /// The thread lock is taken before returning, so calls issued later on the
    /// same thread queue behind this stream.
    pub async fn generate_stream_response(
        &self,
        model_id: &str,
        messages: &[Message],
        options: GenerateOptions,
    ) -> Result<GenerationStream, LlmError> {
        let (history, prompt) = split_prompt(messages)?;
        self.ensure_loaded(model_id)?;
        let thread_id = thread_for(&options);
        let request = self.generator.build_request(prompt, &options);

        // Registered first so an unload in between cancels this request
        let (request_id, cancel) = self.tasks.register(model_id, thread_id, options.cancel.as_ref());
        let (session, finish) = match self.open_stream_session(model_id, thread_id, history, prompt, &options).await {
            Ok(opened) => opened,
            Err(e) => {
                self.tasks.remove(&request_id);
                return Err(e);
            }
        };

        let tasks = Arc::clone(&self.tasks);
        let finished_id = request_id.clone();
        let finish: StreamFinisher = Box::new(move |outcome: StreamOutcome| {
            async move {
                if outcome == StreamOutcome::Cancelled {
                    log::info!("Stream {} cancelled", finished_id);
                }
                finish(outcome).await;
                tasks.remove(&finished_id);
            }
            .boxed()
        });

        log::info!(
            "Streaming on model {} (thread {:?}, request {})",
            model_id,
            thread_id,
            request_id
        );
        let chunks = self.generator.spawn_stream(session, request, cancel.clone(), finish);
        Ok(GenerationStream::new(
            request_id,
            model_id.to_string(),
            thread_id.map(str::to_string),
            cancel,
            chunks,
        ))
    }

    async fn open_stream_session(
        &self,
        model_id: &str,
        thread_id: Option<&str>,
        history: &[Message],
        prompt: &Message,
        options: &GenerateOptions,
    ) -> Result<(SessionHandle, StreamFinisher), LlmError> {
        match thread_id {
            Some(thread_id) => {
                let mut thread = self.sessions.acquire(model_id, thread_id).await?;
                self.sessions.update_history(&mut thread, history).await?;
                let session = thread
                    .handle()
                    .ok_or_else(|| LlmError::RuntimeFailure("thread has no native session".to_string()))?;
                let prompt = prompt.clone();
                let finish: StreamFinisher = Box::new(move |outcome: StreamOutcome| {
                    async move {
                        let mut thread = thread;
                        match outcome {
                            StreamOutcome::Completed(text) => thread.record_turn(prompt, Message::assistant(text)),
                            StreamOutcome::Cancelled | StreamOutcome::Failed => thread.invalidate_history(),
                        }
                    }
                    .boxed()
                });
                Ok((session, finish))
            }
            None => {
                let history = ephemeral_history(history, options);
                let session = self.sessions.ephemeral(model_id, &history).await?;
                let handle = session.handle();
                let sessions = Arc::clone(&self.sessions);
                let finish: StreamFinisher = Box::new(move |_: StreamOutcome| {
                    async move {
                        sessions.release(session).await;
                    }
                    .boxed()
                });
                Ok((handle, finish))
            }
        }
    }

    /// Whether a model is loaded and with which settings
    pub fn get_model_status(&self, model_id: &str) -> ModelStatus {
        let runtime = self.registry.get_model_runtime_info(model_id);
        ModelStatus {
            model_id: model_id.to_string(),
            loaded: runtime.is_some(),
            settings: self.registry.runtime_settings(model_id),
            runtime,
            active_threads: self.sessions.thread_count(model_id),
            active_generations: self.tasks.active_for_model(model_id),
        }
    }

    pub fn cancel_generation(&self, request_id: &str) -> bool {
        self.tasks.cancel_generation(request_id)
    }

    pub fn cancel_thread(&self, thread_id: &str) -> usize {
        self.tasks.cancel_thread(thread_id)
    }

    fn ensure_loaded(&self, model_id: &str) -> Result<(), LlmError> {
        if self.registry.get(model_id).is_some() {
            Ok(())
        } else {
            Err(LlmError::NotLoaded(model_id.to_string()))
        }
    }
}

/// The thread to run on, or None for a throwaway session
fn thread_for(options: &GenerateOptions) -> Option<&str> {
    if options.disable_history {
        None
    } else {
        options.thread_id.as_deref()
    }
}

fn ephemeral_history(history: &[Message], options: &GenerateOptions) -> Vec<Message> {
    if options.disable_history {
        system_only(history)
    } else {
        history.to_vec()
    }
}
