//! Test doubles shared by the engine's unit tests

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;

use super::model_manager::catalog::RemoteCatalog;
use super::model_manager::types::{CatalogMetadata, LocalModel, RemoteModelInfo};
use super::provider::{
    CompletionRequest, CompletionResponse, InferenceRuntime, LlmError, Message, ModelHandle,
    SessionHandle, TokenStream,
};
use super::registry::LoadedModelRuntime;
use super::settings::LoadSettings;
use crate::hardware_detector::{GpuKind, HardwareProbe, HardwareSnapshot};

const GIB: u64 = 1024 * 1024 * 1024;

// ----------------------------------------------------------------------------
// GGUF fixtures
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GgufFixture {
    pub version: u32,
    pub architecture: String,
    pub context_length: u32,
    pub block_count: u32,
    pub embedding_length: u32,
    pub head_count: u32,
    pub head_count_kv: u32,
    pub file_type: u32,
    /// Zero bytes appended after the header
    pub padding: usize,
}

impl Default for GgufFixture {
    fn default() -> Self {
        Self {
            version: 3,
            architecture: "llama".to_string(),
            context_length: 4096,
            block_count: 32,
            embedding_length: 4096,
            head_count: 32,
            head_count_kv: 8,
            file_type: 15,
            padding: 64,
        }
    }
}

fn push_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn push_u32_kv(buf: &mut Vec<u8>, key: &str, value: u32) {
    push_string(buf, key);
    buf.extend_from_slice(&4u32.to_le_bytes());
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn gguf_fixture_bytes(fixture: &GgufFixture) -> Vec<u8> {
    let arch = fixture.architecture.as_str();
    let mut buf = Vec::new();
    buf.extend_from_slice(b"GGUF");
    buf.extend_from_slice(&fixture.version.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes()); // tensors
    buf.extend_from_slice(&9u64.to_le_bytes()); // metadata entries

    push_string(&mut buf, "general.architecture");
    buf.extend_from_slice(&8u32.to_le_bytes());
    push_string(&mut buf, arch);

    push_string(&mut buf, "general.name");
    buf.extend_from_slice(&8u32.to_le_bytes());
    push_string(&mut buf, "fixture");

    // String array, skipped by the reader
    push_string(&mut buf, "tokenizer.ggml.tokens");
    buf.extend_from_slice(&9u32.to_le_bytes());
    buf.extend_from_slice(&8u32.to_le_bytes());
    buf.extend_from_slice(&2u64.to_le_bytes());
    push_string(&mut buf, "<s>");
    push_string(&mut buf, "</s>");

    push_u32_kv(&mut buf, &format!("{}.context_length", arch), fixture.context_length);
    push_u32_kv(&mut buf, &format!("{}.block_count", arch), fixture.block_count);
    push_u32_kv(&mut buf, &format!("{}.embedding_length", arch), fixture.embedding_length);
    push_u32_kv(&mut buf, &format!("{}.attention.head_count", arch), fixture.head_count);
    push_u32_kv(&mut buf, &format!("{}.attention.head_count_kv", arch), fixture.head_count_kv);
    push_u32_kv(&mut buf, "general.file_type", fixture.file_type);

    buf.resize(buf.len() + fixture.padding, 0);
    buf
}

pub fn write_gguf_fixture(path: &Path, fixture: &GgufFixture) -> std::io::Result<()> {
    std::fs::write(path, gguf_fixture_bytes(fixture))
}

// ----------------------------------------------------------------------------
// Records and snapshots
// ----------------------------------------------------------------------------

/// CPU-only machine with plenty of memory
pub fn ample_cpu_snapshot() -> HardwareSnapshot {
    HardwareSnapshot {
        total_ram: 32 * GIB,
        free_ram: 24 * GIB,
        cpu_threads: 8,
        gpu_present: false,
        gpu_kind: GpuKind::None,
        vram_total: None,
        vram_free: None,
    }
}

pub fn local_model(id: &str, size_bytes: u64, trained: Option<u32>) -> LocalModel {
    LocalModel {
        id: id.to_string(),
        filename: format!("{}.gguf", id),
        path: PathBuf::from(format!("{}.gguf", id)),
        size_bytes,
        quantization: None,
        trained_context_length: trained,
        block_count: None,
        kv_bytes_per_token: None,
        safe_context_size: None,
        display_name: id.to_string(),
    }
}

pub fn runtime_record(model_id: &str, settings: LoadSettings) -> LoadedModelRuntime {
    LoadedModelRuntime {
        model_id: model_id.to_string(),
        handle: ModelHandle(1),
        model_path: PathBuf::from(format!("{}.gguf", model_id)),
        settings,
        gpu_kind: GpuKind::None,
        runtime_name: "scripted",
        loaded_at: Utc::now(),
        load_duration: Duration::from_millis(10),
    }
}

pub fn remote_model(filename: &str, url: &str) -> RemoteModelInfo {
    RemoteModelInfo {
        filename: filename.to_string(),
        url: url.to_string(),
        size_bytes: 0,
        quantization: None,
        sha256: None,
        catalog_metadata: CatalogMetadata {
            name: filename.trim_end_matches(".gguf").to_string(),
            ..Default::default()
        },
    }
}

// ----------------------------------------------------------------------------
// Collaborators
// ----------------------------------------------------------------------------

pub struct StaticProbe {
    snapshot: Mutex<HardwareSnapshot>,
}

impl StaticProbe {
    pub fn new(snapshot: HardwareSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn set(&self, snapshot: HardwareSnapshot) {
        *self.snapshot.lock().unwrap() = snapshot;
    }
}

impl HardwareProbe for StaticProbe {
    fn snapshot(&self) -> HardwareSnapshot {
        self.snapshot.lock().unwrap().clone()
    }
}

pub struct StaticCatalog {
    models: Vec<RemoteModelInfo>,
    unavailable: bool,
}

impl StaticCatalog {
    pub fn new(models: Vec<RemoteModelInfo>) -> Self {
        Self {
            models,
            unavailable: false,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            models: Vec::new(),
            unavailable: true,
        }
    }
}

#[async_trait]
impl RemoteCatalog for StaticCatalog {
    async fn list_available(&self) -> Result<Vec<RemoteModelInfo>, LlmError> {
        if self.unavailable {
            return Err(LlmError::IoFailure("catalog offline".to_string()));
        }
        Ok(self.models.clone())
    }

    async fn search(&self, query: &str) -> Result<Vec<RemoteModelInfo>, LlmError> {
        let query = query.to_lowercase();
        Ok(self
            .list_available()
            .await?
            .into_iter()
            .filter(|m| m.filename.to_lowercase().contains(&query))
            .collect())
    }
}

/// In-process runtime that echoes prompts and records what it was asked to do
pub struct ScriptedRuntime {
    pub load_delay: Duration,
    pub token_delay: Duration,
    pub complete_delay: Duration,
    /// Tokens per streamed reply; 0 streams the reply word by word
    pub stream_len: usize,
    /// Fail a stream after this many chunks
    pub fail_stream_after: Option<usize>,
    pub fail_load: Mutex<Option<LlmError>>,

    pub loads: AtomicUsize,
    pub unloads: AtomicUsize,
    pub sessions_created: AtomicUsize,
    pub sessions_disposed: AtomicUsize,
    pub history_updates: AtomicUsize,
    pub tokens_produced: Arc<AtomicUsize>,

    pub next_id: AtomicU64,
    pub models: DashMap<u64, PathBuf>,
    pub sessions: Arc<DashMap<u64, Vec<Message>>>,
    /// Delay before a session is actually released
    pub dispose_delay: Duration,
}

impl Default for ScriptedRuntime {
    fn default() -> Self {
        Self {
            load_delay: Duration::ZERO,
            token_delay: Duration::ZERO,
            complete_delay: Duration::ZERO,
            stream_len: 0,
            fail_stream_after: None,
            fail_load: Mutex::new(None),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            sessions_created: AtomicUsize::new(0),
            sessions_disposed: AtomicUsize::new(0),
            history_updates: AtomicUsize::new(0),
            tokens_produced: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
            models: DashMap::new(),
            sessions: Arc::new(DashMap::new()),
            dispose_delay: Duration::ZERO,
        }
    }
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn loaded_models(&self) -> usize {
        self.models.len()
    }

    pub fn history_of(&self, session: SessionHandle) -> Option<Vec<Message>> {
        self.sessions.get(&session.0).map(|h| h.clone())
    }

    /// The reply names the prompt and every history message it saw
    pub fn reply_for(prompt: &Message, history: &[Message]) -> String {
        let seen: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        format!("echo {} after [{}]", prompt.content, seen.join(" | "))
    }

    fn history(&self, session: SessionHandle) -> Result<Vec<Message>, LlmError> {
        self.history_of(session)
            .ok_or_else(|| LlmError::RuntimeFailure(format!("unknown session {}", session.0)))
    }
}

struct ScriptedStream {
    index: usize,
    tokens: Vec<String>,
    fail_at: Option<usize>,
    delay: Duration,
    produced: Arc<AtomicUsize>,
    sessions: Arc<DashMap<u64, Vec<Message>>>,
    session: u64,
    turn: Option<(Message, Message)>,
}

#[async_trait]
impl InferenceRuntime for ScriptedRuntime {
    fn runtime_name(&self) -> &'static str {
        "scripted"
    }

    async fn load_model(&self, model_path: &Path, _settings: &LoadSettings) -> Result<ModelHandle, LlmError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        if let Some(err) = self.fail_load.lock().unwrap().take() {
            return Err(err);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.models.insert(id, model_path.to_path_buf());
        Ok(ModelHandle(id))
    }

    async fn unload_model(&self, model: ModelHandle) -> Result<(), LlmError> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        self.models
            .remove(&model.0)
            .map(|_| ())
            .ok_or_else(|| LlmError::RuntimeFailure(format!("unknown model {}", model.0)))
    }

    async fn create_session(&self, model: ModelHandle) -> Result<SessionHandle, LlmError> {
        if !self.models.contains_key(&model.0) {
            return Err(LlmError::RuntimeFailure(format!("model {} not loaded", model.0)));
        }
        self.sessions_created.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions.insert(id, Vec::new());
        Ok(SessionHandle(id))
    }

    async fn dispose_session(&self, session: SessionHandle) -> Result<(), LlmError> {
        if !self.dispose_delay.is_zero() {
            tokio::time::sleep(self.dispose_delay).await;
        }
        self.sessions_disposed.fetch_add(1, Ordering::SeqCst);
        self.sessions.remove(&session.0);
        Ok(())
    }

    async fn set_history(&self, session: SessionHandle, messages: &[Message]) -> Result<(), LlmError> {
        let mut history = self
            .sessions
            .get_mut(&session.0)
            .ok_or_else(|| LlmError::RuntimeFailure(format!("unknown session {}", session.0)))?;
        self.history_updates.fetch_add(1, Ordering::SeqCst);
        *history = messages.to_vec();
        Ok(())
    }

    async fn complete(
        &self,
        session: SessionHandle,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let history = self.history(session)?;
        if !self.complete_delay.is_zero() {
            tokio::time::sleep(self.complete_delay).await;
        }
        let reply = Self::reply_for(&request.prompt, &history);
        if let Some(mut h) = self.sessions.get_mut(&session.0) {
            h.push(request.prompt.clone());
            h.push(Message::assistant(reply.clone()));
        }
        Ok(CompletionResponse {
            completion_tokens: Some(reply.split_whitespace().count() as u32),
            content: reply,
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn complete_stream(
        &self,
        session: SessionHandle,
        request: CompletionRequest,
    ) -> Result<TokenStream, LlmError> {
        let history = self.history(session)?;
        let reply = Self::reply_for(&request.prompt, &history);
        let tokens: Vec<String> = if self.stream_len > 0 {
            (0..self.stream_len).map(|i| format!("t{} ", i)).collect()
        } else {
            reply.split_inclusive(' ').map(str::to_string).collect()
        };
        let full: String = tokens.concat();

        let state = ScriptedStream {
            index: 0,
            tokens,
            fail_at: self.fail_stream_after,
            delay: self.token_delay,
            produced: Arc::clone(&self.tokens_produced),
            sessions: Arc::clone(&self.sessions),
            session: session.0,
            turn: Some((request.prompt, Message::assistant(full))),
        };

        let stream = futures_util::stream::unfold(state, |mut st| async move {
            if st.fail_at == Some(st.index) {
                st.fail_at = None;
                st.index = usize::MAX;
                return Some((Err(LlmError::RuntimeFailure("decode failed".to_string())), st));
            }
            if st.index >= st.tokens.len() {
                if let Some((prompt, reply)) = st.turn.take() {
                    if st.index == st.tokens.len() {
                        if let Some(mut h) = st.sessions.get_mut(&st.session) {
                            h.push(prompt);
                            h.push(reply);
                        }
                    }
                }
                return None;
            }
            if !st.delay.is_zero() {
                tokio::time::sleep(st.delay).await;
            }
            st.produced.fetch_add(1, Ordering::SeqCst);
            let token = st.tokens[st.index].clone();
            st.index += 1;
            Some((Ok(token), st))
        });

        Ok(stream.boxed())
    }
}
