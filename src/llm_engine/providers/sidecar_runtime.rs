//! Sidecar inference runtime
//!
//! Runs GGUF inference in a separate process and talks to it with
//! line-delimited JSON-RPC over stdin/stdout. Requests are multiplexed: a
//! reader task routes every response to its request by id, so a long stream
//! on one model never holds up calls for another. Abandoned completions are
//! cancelled on the sidecar side.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing
#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use crate::llm_engine::provider::{
    CompletionRequest, CompletionResponse, InferenceRuntime, LlmError, Message, ModelHandle, ResetHook,
    SessionHandle, TokenStream,
};
use crate::llm_engine::settings::LoadSettings;

const SIDECAR_NAME: &str = if cfg!(windows) { "llm-sidecar.exe" } else { "llm-sidecar" };

/// Sidecar error codes with a dedicated error kind
const ERR_INSUFFICIENT_MEMORY: i32 = -32001;
const ERR_INVALID_MODEL: i32 = -32002;

// ============================================================================
// JSON-RPC Types (matching sidecar)
// ============================================================================

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    id: u64,
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn is_terminal(&self) -> bool {
        self.error.is_some()
            || self
                .result
                .as_ref()
                .and_then(|r| r.get("done"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    fn into_result(self) -> Result<Value, RpcFailure> {
        if let Some(error) = self.error {
            return Err(RpcFailure::Remote(error));
        }
        self.result
            .ok_or_else(|| RpcFailure::Transport("Empty sidecar response".to_string()))
    }
}

enum RpcFailure {
    /// Pipe broken or process gone
    Transport(String),
    Remote(JsonRpcError),
}

impl From<RpcFailure> for LlmError {
    fn from(failure: RpcFailure) -> Self {
        match failure {
            RpcFailure::Transport(msg) => LlmError::RuntimeFailure(format!("Sidecar transport: {}", msg)),
            RpcFailure::Remote(e) => match e.code {
                ERR_INSUFFICIENT_MEMORY => LlmError::ResourceExhausted(e.message),
                ERR_INVALID_MODEL => LlmError::InvalidModel(e.message),
                _ => LlmError::RuntimeFailure(e.message),
            },
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// Path to the sidecar binary; searched for when unset
    pub sidecar_path: Option<PathBuf>,
    /// How long the sidecar gets to acknowledge a shutdown request
    pub shutdown_grace: Duration,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            sidecar_path: None,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Reader = Box<dyn AsyncRead + Send + Unpin>;
type HookSlot = Arc<std::sync::Mutex<Option<ResetHook>>>;

/// One running sidecar process and the requests in flight on it
struct Connection {
    outgoing: mpsc::UnboundedSender<String>,
    pending: DashMap<u64, mpsc::UnboundedSender<JsonRpcResponse>>,
    next_id: AtomicU64,
    closed: CancellationToken,
    down: AtomicBool,
    child: std::sync::Mutex<Option<Child>>,
    hook: HookSlot,
}

impl Connection {
    fn open(reader: Reader, writer: Writer, child: Option<Child>, hook: HookSlot) -> Arc<Self> {
        let (outgoing, lines) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            outgoing,
            pending: DashMap::new(),
            next_id: AtomicU64::new(0),
            closed: CancellationToken::new(),
            down: AtomicBool::new(false),
            child: std::sync::Mutex::new(child),
            hook,
        });
        tokio::spawn(write_lines(Arc::clone(&conn), writer, lines));
        tokio::spawn(read_lines(Arc::clone(&conn), reader));
        conn
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn encode(&self, method: &str, params: Value) -> Result<(u64, String), RpcFailure> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| RpcFailure::Transport(format!("Failed to serialize request: {}", e)))?;
        line.push('\n');
        Ok((id, line))
    }

    /// Register a request and queue it for writing
    fn send(self: &Arc<Self>, method: &str, params: Value, cancel_on_drop: bool) -> Result<PendingRequest, RpcFailure> {
        if self.is_closed() {
            return Err(RpcFailure::Transport("sidecar is not running".to_string()));
        }
        let (id, line) = self.encode(method, params)?;
        let (tx, responses) = mpsc::unbounded_channel();
        self.pending.insert(id, tx);

        if self.outgoing.send(line).is_err() {
            self.pending.remove(&id);
            return Err(RpcFailure::Transport("sidecar writer has stopped".to_string()));
        }
        Ok(PendingRequest {
            conn: Arc::clone(self),
            id,
            responses,
            finished: false,
            cancel_on_drop,
        })
    }

    /// Ask the sidecar to stop a request; the acknowledgement is not awaited
    fn cancel_request(&self, request_id: u64) {
        let Ok((_, line)) = self.encode("cancel", serde_json::json!({ "id": request_id })) else {
            return;
        };
        if self.outgoing.send(line).is_ok() {
            log::debug!("Cancelling sidecar request {}", request_id);
        }
    }

    fn route(&self, line: &str) {
        let response: JsonRpcResponse = match serde_json::from_str(line) {
            Ok(response) => response,
            Err(e) => {
                log::debug!("Skipping unparsable sidecar line: {}", e);
                return;
            }
        };
        let id = response.id;
        let terminal = response.is_terminal();
        let delivered = match self.pending.get(&id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        };
        if terminal || !delivered {
            self.pending.remove(&id);
        }
        if !delivered {
            crate::perf_trace!("No receiver for sidecar message {}", id);
        }
    }

    /// The process died or the pipe broke; everything loaded in it is gone
    fn lost(&self, reason: &str) {
        if self.down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::warn!("Sidecar connection lost ({}); models loaded in it are gone", reason);
        self.closed.cancel();

        // Before waking the waiters, so they observe a registry without the lost models
        let hook = self.hook.lock().ok().and_then(|slot| slot.clone());
        if let Some(hook) = hook {
            hook();
        }
        self.teardown();
    }

    /// Deliberate close; the reset hook is not invoked
    fn close(&self) {
        self.down.store(true, Ordering::SeqCst);
        self.closed.cancel();
        self.teardown();
    }

    fn teardown(&self) {
        self.pending.clear();
        if let Ok(mut child) = self.child.lock() {
            if let Some(child) = child.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

async fn write_lines(conn: Arc<Connection>, mut writer: Writer, mut lines: mpsc::UnboundedReceiver<String>) {
    loop {
        let line = tokio::select! {
            biased;
            _ = conn.closed.cancelled() => return,
            line = lines.recv() => line,
        };
        let Some(line) = line else {
            return;
        };
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            conn.lost(&format!("write failed: {}", e));
            return;
        }
    }
}

async fn read_lines(conn: Arc<Connection>, reader: Reader) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let next = tokio::select! {
            biased;
            _ = conn.closed.cancelled() => return,
            next = lines.next_line() => next,
        };
        match next {
            Ok(Some(line)) => conn.route(&line),
            Ok(None) => {
                conn.lost("sidecar closed its output");
                return;
            }
            Err(e) => {
                conn.lost(&format!("read failed: {}", e));
                return;
            }
        }
    }
}

/// A request awaiting its response(s).
///
/// Dropping an unfinished completion sends `cancel` for it.
struct PendingRequest {
    conn: Arc<Connection>,
    id: u64,
    responses: mpsc::UnboundedReceiver<JsonRpcResponse>,
    finished: bool,
    cancel_on_drop: bool,
}

impl PendingRequest {
    async fn next(&mut self) -> Result<JsonRpcResponse, RpcFailure> {
        match self.responses.recv().await {
            Some(response) => {
                if response.is_terminal() {
                    self.finished = true;
                }
                Ok(response)
            }
            None => {
                self.finished = true;
                Err(RpcFailure::Transport("sidecar connection lost".to_string()))
            }
        }
    }

    /// Wait for a single-message reply
    async fn reply(mut self) -> Result<Value, RpcFailure> {
        let response = self.next().await?;
        self.finished = true;
        response.into_result()
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.conn.pending.remove(&self.id);
        if self.cancel_on_drop && !self.finished && !self.conn.is_closed() {
            self.conn.cancel_request(self.id);
        }
    }
}

// ============================================================================
// Runtime Implementation
// ============================================================================

pub struct SidecarRuntime {
    config: SidecarConfig,
    connection: Mutex<Option<Arc<Connection>>>,
    reset_hook: HookSlot,
}

impl SidecarRuntime {
    pub fn new(config: SidecarConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
            reset_hook: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Find the sidecar binary path
    fn find_sidecar_path(&self) -> Result<PathBuf, LlmError> {
        if let Some(ref path) = self.config.sidecar_path {
            if path.exists() {
                return Ok(path.clone());
            }
            log::warn!("Configured sidecar {} does not exist", path.display());
        }

        if let Ok(exe_path) = std::env::current_exe() {
            let exe_dir = exe_path.parent().unwrap_or(Path::new("."));

            let path = exe_dir.join(SIDECAR_NAME);
            if path.exists() {
                log::debug!("Found sidecar in exe dir: {}", path.display());
                return Ok(path);
            }

            // Dev builds: walk up to target/{debug,release}
            let mut current = exe_dir;
            for _ in 0..3 {
                let Some(parent) = current.parent() else {
                    break;
                };
                for profile in &["debug", "release"] {
                    let path = parent.join("target").join(profile).join(SIDECAR_NAME);
                    if path.exists() {
                        log::debug!("Found sidecar at: {}", path.display());
                        return Ok(path);
                    }
                }
                current = parent;
            }
        }

        which::which(SIDECAR_NAME).map_err(|_| {
            LlmError::RuntimeFailure(format!(
                "{} not found; set LOCAL_LLM_SIDECAR or put it on PATH",
                SIDECAR_NAME
            ))
        })
    }

    fn start(&self) -> Result<Arc<Connection>, LlmError> {
        let sidecar_path = self.find_sidecar_path()?;
        log::info!("Starting LLM sidecar: {}", sidecar_path.display());

        let mut cmd = Command::new(&sidecar_path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd
            .spawn()
            .map_err(|e| LlmError::RuntimeFailure(format!("Failed to start sidecar: {}", e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LlmError::RuntimeFailure("Failed to get sidecar stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LlmError::RuntimeFailure("Failed to get sidecar stdout".to_string()))?;

        Ok(Connection::open(
            Box::new(stdout),
            Box::new(stdin),
            Some(child),
            Arc::clone(&self.reset_hook),
        ))
    }

    /// The live connection, starting the sidecar if there is none
    async fn connection(&self) -> Result<Arc<Connection>, LlmError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref().filter(|c| !c.is_closed()) {
            return Ok(Arc::clone(conn));
        }
        let conn = self.start()?;
        *slot = Some(Arc::clone(&conn));
        log::info!("LLM sidecar started successfully");
        Ok(conn)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, LlmError> {
        let conn = self.connection().await?;
        Ok(conn.send(method, params, false)?.reply().await?)
    }

    /// Ask the sidecar to exit and release the process
    pub async fn shutdown(&self) {
        let Some(conn) = self.connection.lock().await.take() else {
            return;
        };
        // The process exiting is expected from here on
        conn.down.store(true, Ordering::SeqCst);
        if let Ok(request) = conn.send("shutdown", serde_json::json!({}), false) {
            let _ = tokio::time::timeout(self.config.shutdown_grace, request.reply()).await;
        }
        conn.close();
        log::info!("Sidecar runtime shut down");
    }

    #[cfg(test)]
    fn with_transport(reader: Reader, writer: Writer) -> Self {
        let reset_hook: HookSlot = Arc::new(std::sync::Mutex::new(None));
        let conn = Connection::open(reader, writer, None, Arc::clone(&reset_hook));
        Self {
            config: SidecarConfig::default(),
            connection: Mutex::new(Some(conn)),
            reset_hook,
        }
    }
}

impl Drop for SidecarRuntime {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.get_mut().take() {
            conn.close();
        }
    }
}

fn completion_params(session: SessionHandle, request: &CompletionRequest, stream: bool) -> Result<Value, LlmError> {
    let mut params = serde_json::json!({
        "session": session.0,
        "prompt": request.prompt,
        "max_tokens": request.max_tokens.unwrap_or(512),
        "stream": stream,
    });
    if let Some(temperature) = request.temperature {
        params["temperature"] = serde_json::json!(temperature);
    }
    if !request.tools.is_empty() {
        params["tools"] = serde_json::to_value(&request.tools)
            .map_err(|e| LlmError::InvalidRequest(format!("Failed to serialize tools: {}", e)))?;
    }
    Ok(params)
}

fn handle_from(result: &Value, field: &str) -> Result<u64, LlmError> {
    result
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| LlmError::RuntimeFailure(format!("Sidecar response lacks '{}'", field)))
}

#[async_trait]
impl InferenceRuntime for SidecarRuntime {
    fn runtime_name(&self) -> &'static str {
        "sidecar"
    }

    async fn load_model(&self, model_path: &Path, settings: &LoadSettings) -> Result<ModelHandle, LlmError> {
        let params = serde_json::json!({
            "model_path": model_path.to_string_lossy(),
            "gpu_layers": settings.gpu_layers,
            "context_size": settings.context_size,
            "batch_size": settings.batch_size,
        });
        let result = self.call("load_model", params).await?;
        Ok(ModelHandle(handle_from(&result, "model")?))
    }

    async fn unload_model(&self, model: ModelHandle) -> Result<(), LlmError> {
        self.call("unload_model", serde_json::json!({ "model": model.0 }))
            .await
            .map(|_| ())
    }

    async fn create_session(&self, model: ModelHandle) -> Result<SessionHandle, LlmError> {
        let result = self.call("create_session", serde_json::json!({ "model": model.0 })).await?;
        Ok(SessionHandle(handle_from(&result, "session")?))
    }

    async fn dispose_session(&self, session: SessionHandle) -> Result<(), LlmError> {
        self.call("dispose_session", serde_json::json!({ "session": session.0 }))
            .await
            .map(|_| ())
    }

    async fn set_history(&self, session: SessionHandle, messages: &[Message]) -> Result<(), LlmError> {
        let params = serde_json::json!({ "session": session.0, "messages": messages });
        self.call("set_history", params).await.map(|_| ())
    }

    async fn complete(
        &self,
        session: SessionHandle,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let params = completion_params(session, &request, false)?;
        let conn = self.connection().await?;
        // Dropping this future cancels the completion on the sidecar
        let result = conn.send("complete", params, true)?.reply().await?;

        Ok(CompletionResponse {
            content: result
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            completion_tokens: result
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .map(|n| n as u32),
            finish_reason: Some(
                result
                    .get("finish_reason")
                    .and_then(Value::as_str)
                    .unwrap_or("stop")
                    .to_string(),
            ),
        })
    }

    async fn complete_stream(
        &self,
        session: SessionHandle,
        request: CompletionRequest,
    ) -> Result<TokenStream, LlmError> {
        let params = completion_params(session, &request, true)?;
        let conn = self.connection().await?;
        let pending = conn.send("complete", params, true)?;

        let stream = futures_util::stream::unfold(pending, |mut pending| async move {
            if pending.finished {
                return None;
            }
            match next_token(&mut pending).await {
                Ok(Some(token)) => Some((Ok(token), pending)),
                Ok(None) => None,
                Err(e) => Some((Err(e), pending)),
            }
        });
        Ok(stream.boxed())
    }

    fn set_reset_hook(&self, hook: ResetHook) {
        if let Ok(mut slot) = self.reset_hook.lock() {
            *slot = Some(hook);
        }
    }
}

async fn next_token(pending: &mut PendingRequest) -> Result<Option<String>, LlmError> {
    loop {
        let response = pending.next().await?;
        let terminal = response.is_terminal();
        let result = response.into_result()?;

        match result.get("token").and_then(Value::as_str) {
            Some(token) if !token.is_empty() => {
                crate::perf_trace!("Sidecar token for request {}: {:?}", pending.id, token);
                return Ok(Some(token.to_string()));
            }
            _ if terminal => return Ok(None),
            _ => continue,
        }
    }
}
