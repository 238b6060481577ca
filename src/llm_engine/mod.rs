//! LLM Engine module for local GGUF inference
//!
//! Module structure:
//! - provider.rs: InferenceRuntime contract, messages, errors
//! - settings.rs: Effective load settings (runtime > persisted > calculated)
//! - registry.rs: Loaded model table
//! - sessions.rs: Per-thread sessions with serialized access
//! - task_registry.rs: Cancellation tokens for in-flight generations
//! - generator.rs: Blocking and streaming generation
//! - response.rs: Request-level generation service
//! - loader.rs: Load/unload/delete state machine
//! - engine.rs: LlmEngine, the public entry point
//! - model_manager/: Inventory, catalogs, downloads, context sizing
//! - providers/: Concrete runtimes

pub mod provider;
pub mod settings;
pub mod registry;
pub mod sessions;
pub mod task_registry;
pub mod generator;
pub mod response;
pub mod loader;
pub mod engine;
pub mod model_manager;
pub mod providers;

#[cfg(test)]
pub mod testing;

pub use provider::{
    CompletionRequest, CompletionResponse, InferenceRuntime, LlmError, Message, MessageRole, ModelHandle,
    ResetHook, SessionHandle, TokenStream, ToolDefinition,
};
pub use settings::{LoadSettings, ModelLoadingSettings, ModelSettings, ModelSettingsStore, SettingsSource};
pub use registry::ModelRuntimeInfo;
pub use generator::{GenerateOptions, GenerationStream};
pub use response::ModelStatus;
pub use loader::ModelState;
pub use engine::LlmEngine;
