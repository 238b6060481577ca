//! Runtime contract and shared types
//!
//! Defines the interface to the native inference engine plus the message,
//! request and error types every other part of the engine speaks.

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::settings::LoadSettings;

/// Error types for local model operations
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum LlmError {
    /// Unknown model id, filename or download
    #[error("Not found: {0}")]
    NotFound(String),
    /// A conflicting operation holds the key
    #[error("Already in progress: {0}")]
    AlreadyInProgress(String),
    /// Not enough RAM/VRAM for the requested settings
    #[error("Insufficient resources: {0}")]
    ResourceExhausted(String),
    /// Model file is missing, truncated or not GGUF
    #[error("Invalid model file: {0}")]
    InvalidModel(String),
    /// Native session construction or generation failed
    #[error("Runtime failure: {0}")]
    RuntimeFailure(String),
    /// Filesystem or network failure
    #[error("I/O failure: {0}")]
    IoFailure(String),
    /// Model download failed
    #[error("Download failed: {0}")]
    DownloadFailed(String),
    /// Generation requested against a model that is not loaded
    #[error("Model not loaded: {0}")]
    NotLoaded(String),
    /// Invalid request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// A stream failed after some chunks were already delivered
    #[error("Stream truncated: {0}")]
    Truncated(String),
    /// Settings store failure
    #[error("Storage failure: {0}")]
    Storage(String),
    /// Caller-initiated cancellation
    #[error("Cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LlmError::Cancelled)
    }

    /// Whether the error should be reported to the user as a failure
    pub fn is_failure(&self) -> bool {
        !self.is_cancelled()
    }
}

impl From<std::io::Error> for LlmError {
    fn from(e: std::io::Error) -> Self {
        LlmError::IoFailure(e.to_string())
    }
}

/// Role of a message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Tool definition to pass to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value, // JSON Schema
}

/// A single completion turn sent to a native session.
///
/// The session already holds the conversation history; `prompt` is the new turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: Message,
    /// Maximum tokens to generate (None = runtime default)
    pub max_tokens: Option<u32>,
    /// Temperature for sampling
    pub temperature: Option<f32>,
    /// Tools the model may call; empty when tools are disabled
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

/// Response from a completion request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionResponse {
    /// Generated text content
    pub content: String,
    /// Number of tokens generated
    pub completion_tokens: Option<u32>,
    /// Finish reason (stop, length, cancelled)
    pub finish_reason: Option<String>,
}

/// Opaque handle to a model loaded inside the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelHandle(pub u64);

/// Opaque handle to a conversation session inside a loaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub u64);

/// Token batches produced by a streaming completion
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Invoked when the runtime loses every model and session it held
pub type ResetHook = Arc<dyn Fn() + Send + Sync>;

/// The native inference engine, treated as a black box.
///
/// Dropping a `TokenStream` before it ends must stop production and leave the
/// session usable for the next request.
#[async_trait]
pub trait InferenceRuntime: Send + Sync {
    /// Runtime name for logs and runtime info
    fn runtime_name(&self) -> &'static str;

    /// Load a model file with concrete settings
    async fn load_model(&self, model_path: &Path, settings: &LoadSettings) -> Result<ModelHandle, LlmError>;

    /// Release a loaded model and its memory
    async fn unload_model(&self, model: ModelHandle) -> Result<(), LlmError>;

    /// Create a conversation session bound to a loaded model
    async fn create_session(&self, model: ModelHandle) -> Result<SessionHandle, LlmError>;

    /// Dispose a conversation session
    async fn dispose_session(&self, session: SessionHandle) -> Result<(), LlmError>;

    /// Replace the session's conversation context
    async fn set_history(&self, session: SessionHandle, messages: &[Message]) -> Result<(), LlmError>;

    /// Run a completion to the end
    async fn complete(
        &self,
        session: SessionHandle,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError>;

    /// Run a completion, yielding token batches as they are produced
    async fn complete_stream(
        &self,
        session: SessionHandle,
        request: CompletionRequest,
    ) -> Result<TokenStream, LlmError>;

    /// Register a callback for when the runtime drops all of its state,
    /// e.g. an out-of-process runtime that crashed. In-process runtimes
    /// never reset and can ignore it.
    fn set_reset_hook(&self, _hook: ResetHook) {}
}
