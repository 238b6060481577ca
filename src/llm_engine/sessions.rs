//! Session Manager - native conversation sessions per (model, thread)
//!
//! Each thread session sits behind its own async mutex. Whoever holds the lock
//! owns the native session for the duration of a history update or a
//! generation, which serializes work per thread while leaving other threads
//! and models independent. Tokio's mutex is fair, so callers are served in
//! the order they queued.
//!
//! Requests without a thread get an ephemeral session, tracked the same way
//! so that unloading a model waits for and disposes those as well.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::provider::{InferenceRuntime, LlmError, Message, ModelHandle, SessionHandle};
use super::registry::{LoadedModelRuntime, ModelRegistry};

type ThreadKey = (String, String);

/// Native session state for one conversation thread
#[derive(Debug, Default)]
pub struct ThreadSession {
    session: Option<SessionHandle>,
    model: Option<ModelHandle>,
    /// Messages the native session currently holds; None when unknown
    applied: Option<Vec<Message>>,
}

impl ThreadSession {
    pub fn handle(&self) -> Option<SessionHandle> {
        self.session
    }

    pub fn applied_history(&self) -> Option<&[Message]> {
        self.applied.as_deref()
    }

    /// Record a finished turn that the runtime appended on its own
    pub fn record_turn(&mut self, prompt: Message, reply: Message) {
        if let Some(applied) = self.applied.as_mut() {
            applied.push(prompt);
            applied.push(reply);
        }
    }

    /// Forget what the session holds; the next update replays the full history
    pub fn invalidate_history(&mut self) {
        self.applied = None;
    }
}

pub type ThreadSessionGuard = OwnedMutexGuard<ThreadSession>;

type EphemeralSlot = Arc<Mutex<Option<SessionHandle>>>;

/// A session serving one request with no thread.
///
/// Hand it back with `SessionManager::release` when the request ends.
pub struct EphemeralSession {
    key: u64,
    handle: SessionHandle,
    slot: OwnedMutexGuard<Option<SessionHandle>>,
}

impl EphemeralSession {
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }
}

pub struct SessionManager {
    runtime: Arc<dyn InferenceRuntime>,
    registry: ModelRegistry,
    threads: DashMap<ThreadKey, Arc<Mutex<ThreadSession>>>,
    ephemeral: DashMap<u64, (String, EphemeralSlot)>,
    next_ephemeral: AtomicU64,
}

impl SessionManager {
    pub fn new(runtime: Arc<dyn InferenceRuntime>, registry: ModelRegistry) -> Self {
        Self {
            runtime,
            registry,
            threads: DashMap::new(),
            ephemeral: DashMap::new(),
            next_ephemeral: AtomicU64::new(0),
        }
    }

    pub async fn create_session(&self, model: &LoadedModelRuntime) -> Result<SessionHandle, LlmError> {
        let session = self.runtime.create_session(model.handle).await?;
        log::debug!("Created session {:?} for model {}", session, model.model_id);
        Ok(session)
    }

    /// Lock the thread's session, creating the native session on first use.
    ///
    /// Waits behind any earlier update or generation on the same thread.
    pub async fn acquire(&self, model_id: &str, thread_id: &str) -> Result<ThreadSessionGuard, LlmError> {
        let key = (model_id.to_string(), thread_id.to_string());
        let slot = Arc::clone(
            self.threads
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(ThreadSession::default())))
                .value(),
        );

        let mut guard = Arc::clone(&slot).lock_owned().await;

        // Re-check under the lock: an unload may have run while we waited
        let model = match self.registry.get(model_id) {
            Some(model) => model,
            None => {
                self.threads.remove_if(&key, |_, v| Arc::ptr_eq(v, &slot));
                return Err(LlmError::NotLoaded(model_id.to_string()));
            }
        };

        if guard.model != Some(model.handle) || guard.session.is_none() {
            if let Some(stale) = guard.session.take() {
                let _ = self.runtime.dispose_session(stale).await;
            }
            let session = self.create_session(&model).await?;
            guard.session = Some(session);
            guard.model = Some(model.handle);
            guard.applied = Some(Vec::new());
        }

        Ok(guard)
    }

    /// Make the native session hold exactly `messages`. Returns whether the
    /// runtime had to be updated.
    pub async fn update_history(&self, thread: &mut ThreadSession, messages: &[Message]) -> Result<bool, LlmError> {
        let session = thread
            .session
            .ok_or_else(|| LlmError::RuntimeFailure("thread has no native session".to_string()))?;

        if thread.applied.as_deref() == Some(messages) {
            return Ok(false);
        }

        // Drop the cached view first so a failed update forces a full replay
        thread.applied = None;
        self.runtime.set_history(session, messages).await?;
        thread.applied = Some(messages.to_vec());
        crate::perf_debug!("Applied {} history messages to session {:?}", messages.len(), session);
        Ok(true)
    }

    /// Session for a single request that keeps no thread state.
    ///
    /// The entry is registered before the registry is checked, so a
    /// concurrent unload either finds it or this call sees the model gone.
    pub async fn ephemeral(&self, model_id: &str, history: &[Message]) -> Result<EphemeralSession, LlmError> {
        let key = self.next_ephemeral.fetch_add(1, Ordering::Relaxed);
        let slot: EphemeralSlot = Arc::new(Mutex::new(None));
        let mut guard = Arc::clone(&slot).lock_owned().await;
        self.ephemeral.insert(key, (model_id.to_string(), slot));

        let Some(model) = self.registry.get(model_id) else {
            self.ephemeral.remove(&key);
            return Err(LlmError::NotLoaded(model_id.to_string()));
        };
        let handle = match self.create_session(&model).await {
            Ok(handle) => handle,
            Err(e) => {
                self.ephemeral.remove(&key);
                return Err(e);
            }
        };
        *guard = Some(handle);

        let session = EphemeralSession { key, handle, slot: guard };
        if !history.is_empty() {
            if let Err(e) = self.runtime.set_history(handle, history).await {
                self.release(session).await;
                return Err(e);
            }
        }
        Ok(session)
    }

    /// Dispose an ephemeral session unless an unload already did
    pub async fn release(&self, mut session: EphemeralSession) {
        if let Some(handle) = session.slot.take() {
            if let Err(e) = self.runtime.dispose_session(handle).await {
                log::warn!("Failed to dispose ephemeral session {:?}: {}", handle, e);
            }
        }
        self.ephemeral.remove(&session.key);
    }

    /// Dispose every session of a model, thread or ephemeral, waiting for
    /// in-flight work on each to release its lock.
    pub async fn dispose_model_sessions(&self, model_id: &str) -> usize {
        let keys: Vec<ThreadKey> = self
            .threads
            .iter()
            .filter(|e| e.key().0 == model_id)
            .map(|e| e.key().clone())
            .collect();

        let mut disposed = 0;
        for key in keys {
            let Some((_, slot)) = self.threads.remove(&key) else {
                continue;
            };
            let mut thread = slot.lock().await;
            if let Some(session) = thread.session.take() {
                if let Err(e) = self.runtime.dispose_session(session).await {
                    log::warn!("Failed to dispose session for thread {}: {}", key.1, e);
                }
                disposed += 1;
            }
            thread.applied = None;
            thread.model = None;
        }

        for key in self.ephemeral_keys(model_id) {
            let Some((_, (_, slot))) = self.ephemeral.remove(&key) else {
                continue;
            };
            let mut session = slot.lock().await;
            if let Some(handle) = session.take() {
                if let Err(e) = self.runtime.dispose_session(handle).await {
                    log::warn!("Failed to dispose ephemeral session {:?}: {}", handle, e);
                }
                disposed += 1;
            }
        }

        if disposed > 0 {
            log::info!("Disposed {} sessions of model {}", disposed, model_id);
        }
        disposed
    }

    /// Drop every session record of a model without calling the runtime,
    /// for when the runtime has already lost them
    pub fn forget_model(&self, model_id: &str) {
        self.threads.retain(|key, _| key.0 != model_id);
        self.ephemeral.retain(|_, (owner, _)| owner != model_id);
    }

    fn ephemeral_keys(&self, model_id: &str) -> Vec<u64> {
        self.ephemeral
            .iter()
            .filter(|e| e.value().0 == model_id)
            .map(|e| *e.key())
            .collect()
    }

    pub fn ephemeral_count(&self, model_id: &str) -> usize {
        self.ephemeral_keys(model_id).len()
    }

    pub fn thread_count(&self, model_id: &str) -> usize {
        self.threads.iter().filter(|e| e.key().0 == model_id).count()
    }
}
