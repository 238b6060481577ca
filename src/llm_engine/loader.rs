//! Model Loader - per-model load/unload state machine
//!
//! Unloaded -> Loading -> Loaded -> Unloading -> Unloaded, with Deleting as a
//! side state held while a model's file is removed. Loaded and Unloaded are
//! read from the registry; the transient states live in a per-id transition
//! table. A transition's work runs on its own task and every concurrent
//! caller awaits the same shared outcome, so each id sees at most one load or
//! unload at a time while other ids proceed independently.

use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};

use super::model_manager::gguf;
use super::model_manager::inventory::ModelInventory;
use super::model_manager::types::LocalModel;
use super::provider::{InferenceRuntime, LlmError, ResetHook};
use super::registry::{LoadedModelRuntime, ModelRegistry, ModelRuntimeInfo};
use super::sessions::SessionManager;
use super::settings::ModelSettingsService;
use super::task_registry::GenerationTaskRegistry;
use crate::hardware_detector::{GpuKind, HardwareProbe, HardwareSnapshot};

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T, LlmError>>>;

/// Lifecycle state of one model id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    Deleting,
}

#[derive(Clone)]
enum Transition {
    Loading(SharedOutcome<ModelRuntimeInfo>),
    Unloading(SharedOutcome<()>),
    Deleting,
}

enum Pending {
    Load(SharedOutcome<ModelRuntimeInfo>),
    Unload(SharedOutcome<()>),
}

struct LoaderInner {
    runtime: Arc<dyn InferenceRuntime>,
    registry: ModelRegistry,
    sessions: Arc<SessionManager>,
    tasks: Arc<GenerationTaskRegistry>,
    settings: Arc<ModelSettingsService>,
    inventory: Arc<ModelInventory>,
    probe: Arc<dyn HardwareProbe>,
    transitions: DashMap<String, Transition>,
}

pub struct ModelLoader {
    inner: Arc<LoaderInner>,
}

impl ModelLoader {
    pub fn new(
        runtime: Arc<dyn InferenceRuntime>,
        registry: ModelRegistry,
        sessions: Arc<SessionManager>,
        tasks: Arc<GenerationTaskRegistry>,
        settings: Arc<ModelSettingsService>,
        inventory: Arc<ModelInventory>,
        probe: Arc<dyn HardwareProbe>,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                runtime,
                registry,
                sessions,
                tasks,
                settings,
                inventory,
                probe,
                transitions: DashMap::new(),
            }),
        }
    }

    pub fn state(&self, model_id: &str) -> ModelState {
        match self.inner.transitions.get(model_id).as_deref() {
            Some(Transition::Loading(_)) => ModelState::Loading,
            Some(Transition::Unloading(_)) => ModelState::Unloading,
            Some(Transition::Deleting) => ModelState::Deleting,
            None if self.inner.registry.has(model_id) => ModelState::Loaded,
            None => ModelState::Unloaded,
        }
    }

    /// Load a model by id or filename.
    ///
    /// Already loaded is a no-op; a load in flight is joined. With a thread id
    /// the thread's session is created once the model is up.
    pub async fn load_model(&self, id_or_name: &str, thread_id: Option<&str>) -> Result<ModelRuntimeInfo, LlmError> {
        let model = self.inner.inventory.find_model(id_or_name)?;
        let info = self.load_resolved(model).await?;

        if let Some(thread_id) = thread_id {
            self.inner.sessions.acquire(&info.model_id, thread_id).await?;
        }
        Ok(info)
    }

    async fn load_resolved(&self, model: LocalModel) -> Result<ModelRuntimeInfo, LlmError> {
        loop {
            let pending = match self.inner.transitions.entry(model.id.clone()) {
                Entry::Occupied(entry) => match entry.get() {
                    Transition::Loading(outcome) => Pending::Load(outcome.clone()),
                    Transition::Unloading(outcome) => Pending::Unload(outcome.clone()),
                    Transition::Deleting => {
                        return Err(LlmError::AlreadyInProgress(format!("{} is being deleted", model.id)));
                    }
                },
                Entry::Vacant(slot) => {
                    if let Some(info) = self.inner.registry.get_model_runtime_info(&model.id) {
                        return Ok(info);
                    }
                    let inner = Arc::clone(&self.inner);
                    let target = model.clone();
                    let outcome = spawn_shared(async move { inner.run_load(target).await });
                    slot.insert(Transition::Loading(outcome.clone()));
                    Pending::Load(outcome)
                }
            };

            match pending {
                Pending::Load(outcome) => return outcome.await,
                // Wait out the unload, then load afresh
                Pending::Unload(outcome) => {
                    let _ = outcome.await;
                }
            }
        }
    }

    /// Unload a model, disposing every session derived from it first.
    ///
    /// Unloading a model that is not loaded is a no-op.
    pub async fn unload_model(&self, model_id: &str) -> Result<(), LlmError> {
        let model_id = self.canonical_id(model_id);
        loop {
            let pending = match self.inner.transitions.entry(model_id.clone()) {
                Entry::Occupied(entry) => match entry.get() {
                    Transition::Loading(outcome) => Pending::Load(outcome.clone()),
                    Transition::Unloading(outcome) => Pending::Unload(outcome.clone()),
                    Transition::Deleting => return Ok(()),
                },
                Entry::Vacant(slot) => {
                    if !self.inner.registry.has(&model_id) {
                        return Ok(());
                    }
                    let inner = Arc::clone(&self.inner);
                    let id = model_id.clone();
                    let outcome = spawn_shared(async move { inner.run_unload(id).await });
                    slot.insert(Transition::Unloading(outcome.clone()));
                    Pending::Unload(outcome)
                }
            };

            match pending {
                // Let the load settle, then unload what it produced
                Pending::Load(outcome) => {
                    let _ = outcome.await;
                }
                Pending::Unload(outcome) => return outcome.await,
            }
        }
    }

    /// Unload the model and hold it in `Deleting` until the guard drops.
    ///
    /// Loads attempted meanwhile fail with `AlreadyInProgress`.
    pub async fn prepare_model_for_deletion(&self, model_id: &str) -> Result<DeletionGuard, LlmError> {
        let model_id = self.canonical_id(model_id);
        loop {
            if let Err(e) = self.unload_model(&model_id).await {
                if self.inner.registry.has(&model_id) {
                    return Err(e);
                }
                log::warn!("Unload before deleting {} reported: {}", model_id, e);
            }

            match self.inner.transitions.entry(model_id.clone()) {
                Entry::Vacant(slot) if !self.inner.registry.has(&model_id) => {
                    slot.insert(Transition::Deleting);
                    return Ok(DeletionGuard {
                        inner: Arc::clone(&self.inner),
                        model_id,
                    });
                }
                Entry::Occupied(entry) if matches!(entry.get(), Transition::Deleting) => {
                    return Err(LlmError::AlreadyInProgress(format!("{} is already being deleted", model_id)));
                }
                // A load slipped in between; unload again
                _ => {}
            }
        }
    }

    /// Unload every loaded model
    pub async fn unload_all(&self) -> Vec<(String, LlmError)> {
        let mut failures = Vec::new();
        for model_id in self.inner.registry.ids() {
            if let Err(e) = self.unload_model(&model_id).await {
                log::error!("Failed to unload {} during shutdown: {}", model_id, e);
                failures.push((model_id, e));
            }
        }
        failures
    }

    /// Callback for a runtime that lost its state: every model it held is
    /// dropped from the registry without calling back into the runtime
    pub fn reset_hook(&self) -> ResetHook {
        let inner: Weak<LoaderInner> = Arc::downgrade(&self.inner);
        Arc::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.forget_all();
            }
        })
    }

    /// Registry and transition keys are model ids; map a filename onto its id
    pub fn canonical_id(&self, id_or_name: &str) -> String {
        if self.inner.registry.has(id_or_name) || self.inner.transitions.contains_key(id_or_name) {
            return id_or_name.to_string();
        }
        self.inner
            .inventory
            .find_model(id_or_name)
            .map(|m| m.id)
            .unwrap_or_else(|_| id_or_name.to_string())
    }
}

/// Holds a model id in `Deleting`; dropping it releases the id
pub struct DeletionGuard {
    inner: Arc<LoaderInner>,
    model_id: String,
}

impl DeletionGuard {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl Drop for DeletionGuard {
    fn drop(&mut self) {
        self.inner
            .transitions
            .remove_if(&self.model_id, |_, t| matches!(t, Transition::Deleting));
    }
}

impl LoaderInner {
    fn forget_all(&self) {
        for model_id in self.registry.ids() {
            if self.registry.remove(&model_id).is_some() {
                self.tasks.cancel_model(&model_id);
                self.sessions.forget_model(&model_id);
                log::warn!("Runtime reset; model {} is no longer loaded", model_id);
            }
        }
    }

    async fn run_load(self: Arc<Self>, model: LocalModel) -> Result<ModelRuntimeInfo, LlmError> {
        let result = self.load_into_registry(&model).await;
        self.transitions.remove(&model.id);
        match &result {
            Ok(info) => log::info!(
                "Loaded model {} in {}ms (gpu_layers={}, context={}, batch={})",
                info.model_id,
                info.load_time_ms,
                info.gpu_layers,
                info.context_size,
                info.batch_size
            ),
            Err(e) => log::error!("Failed to load model {}: {}", model.id, e),
        }
        result
    }

    async fn load_into_registry(&self, model: &LocalModel) -> Result<ModelRuntimeInfo, LlmError> {
        let settings = self.settings.settings_for_load(model)?;

        let path = model.path.clone();
        tokio::task::spawn_blocking(move || gguf::read_metadata(&path))
            .await
            .map_err(|e| LlmError::RuntimeFailure(format!("Model check task failed: {}", e)))??;

        let snapshot = self.probe.snapshot();
        check_resources(model, &snapshot)?;

        log::info!("Loading model {} from {}", model.id, model.path.display());
        let started = Instant::now();
        let handle = self.runtime.load_model(&model.path, &settings).await?;

        let record = LoadedModelRuntime {
            model_id: model.id.clone(),
            handle,
            model_path: model.path.clone(),
            settings,
            gpu_kind: snapshot.gpu_kind,
            runtime_name: self.runtime.runtime_name(),
            loaded_at: Utc::now(),
            load_duration: started.elapsed(),
        };
        let info = ModelRuntimeInfo::from(&record);
        self.registry.set(record);
        Ok(info)
    }

    async fn run_unload(self: Arc<Self>, model_id: String) -> Result<(), LlmError> {
        let result = self.unload_from_runtime(&model_id).await;
        self.transitions.remove(&model_id);
        result
    }

    async fn unload_from_runtime(&self, model_id: &str) -> Result<(), LlmError> {
        // Out of the registry first so no new session can attach
        let Some(loaded) = self.registry.remove(model_id) else {
            return Ok(());
        };

        let cancelled = self.tasks.cancel_model(model_id);
        let disposed = self.sessions.dispose_model_sessions(model_id).await;
        log::info!(
            "Unloading model {} ({} generations cancelled, {} sessions disposed)",
            model_id,
            cancelled,
            disposed
        );

        self.runtime.unload_model(loaded.handle).await
    }
}

/// Reject a model whose weights cannot fit in RAM plus dedicated VRAM
fn check_resources(model: &LocalModel, snapshot: &HardwareSnapshot) -> Result<(), LlmError> {
    if snapshot.total_ram == 0 {
        return Ok(());
    }
    // Metal memory is the system RAM already counted
    let vram = match snapshot.gpu_kind {
        GpuKind::Cuda | GpuKind::Vulkan => snapshot.vram_total.unwrap_or(0),
        GpuKind::Metal | GpuKind::None => 0,
    };
    let capacity = snapshot.total_ram.saturating_add(vram);
    if model.size_bytes > capacity {
        return Err(LlmError::ResourceExhausted(format!(
            "{} needs {} MB but only {} MB of RAM and VRAM exist",
            model.id,
            model.size_bytes / (1024 * 1024),
            capacity / (1024 * 1024)
        )));
    }
    Ok(())
}

fn spawn_shared<T, F>(work: F) -> SharedOutcome<T>
where
    T: Clone + Send + Sync + 'static,
    F: std::future::Future<Output = Result<T, LlmError>> + Send + 'static,
{
    let handle = tokio::spawn(work);
    async move {
        handle
            .await
            .unwrap_or_else(|e| Err(LlmError::RuntimeFailure(format!("Model task failed: {}", e))))
    }
    .boxed()
    .shared()
}
