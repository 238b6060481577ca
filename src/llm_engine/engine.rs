//! LLM Engine - the one entry point for local model work
//!
//! Owns the registry, download table, session table and task registry, and
//! wires the collaborators (runtime, settings store, hardware probe, catalog)
//! into the services that use them. Nothing here is global; dropping the
//! engine drops all of its state.

use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::database::DatabaseManager;
use crate::hardware_detector::{HardwareProbe, HardwareSnapshot, SystemHardwareProbe};
use crate::llm_engine::generator::{GenerateOptions, GenerationStream};
use crate::llm_engine::loader::{ModelLoader, ModelState};
use crate::llm_engine::model_manager::{
    AvailableModels, CompositeCatalog, ContextCalculator, CuratedCatalog, DownloadProgress, DownloaderConfig,
    HuggingFaceCatalog, LocalModel, ModelDiscovery, ModelDownloader, ModelInventory, ProgressCallback,
    RemoteCatalog, RemoteModelInfo,
};
use crate::llm_engine::provider::{CompletionResponse, InferenceRuntime, LlmError, Message};
use crate::llm_engine::providers::{SidecarConfig, SidecarRuntime};
use crate::llm_engine::registry::{ModelRegistry, ModelRuntimeInfo};
use crate::llm_engine::response::{ModelStatus, ResponseService};
use crate::llm_engine::sessions::SessionManager;
use crate::llm_engine::settings::{LoadSettings, ModelLoadingSettings, ModelSettings, ModelSettingsService, ModelSettingsStore};
use crate::llm_engine::task_registry::GenerationTaskRegistry;

const CATALOG_TIMEOUT: Duration = Duration::from_secs(20);

/// The main LLM engine
pub struct LlmEngine {
    config: EngineConfig,
    registry: ModelRegistry,
    inventory: Arc<ModelInventory>,
    probe: Arc<dyn HardwareProbe>,
    downloader: Arc<ModelDownloader>,
    discovery: ModelDiscovery,
    settings: Arc<ModelSettingsService>,
    loader: ModelLoader,
    responses: ResponseService,
}

impl LlmEngine {
    /// Build an engine from explicit collaborators
    pub fn new(
        config: EngineConfig,
        runtime: Arc<dyn InferenceRuntime>,
        store: Arc<dyn ModelSettingsStore>,
        probe: Arc<dyn HardwareProbe>,
        catalog: Arc<dyn RemoteCatalog>,
    ) -> Result<Self, LlmError> {
        let inventory = Arc::new(ModelInventory::new(config.models_dir.clone()));
        inventory.ensure_dir()?;

        let registry = ModelRegistry::new();
        let calculator = Arc::new(ContextCalculator::new());
        let downloader = Arc::new(ModelDownloader::new(
            catalog,
            DownloaderConfig {
                timeout: config.download_timeout,
                progress_interval: config.progress_interval,
            },
        )?);
        let discovery = ModelDiscovery::new(
            Arc::clone(&inventory),
            Arc::clone(&downloader),
            Arc::clone(&calculator),
            Arc::clone(&probe),
        );
        let settings = Arc::new(ModelSettingsService::new(
            registry.clone(),
            store,
            calculator,
            Arc::clone(&inventory),
            Arc::clone(&probe),
        ));
        let sessions = Arc::new(SessionManager::new(Arc::clone(&runtime), registry.clone()));
        let tasks = Arc::new(GenerationTaskRegistry::new());
        let loader = ModelLoader::new(
            Arc::clone(&runtime),
            registry.clone(),
            Arc::clone(&sessions),
            Arc::clone(&tasks),
            Arc::clone(&settings),
            Arc::clone(&inventory),
            Arc::clone(&probe),
        );
        runtime.set_reset_hook(loader.reset_hook());
        let runtime_name = runtime.runtime_name();
        let responses = ResponseService::new(runtime, registry.clone(), sessions, tasks, config.stream_buffer);

        log::info!(
            "LLM engine ready (models: {}, runtime: {})",
            config.models_dir.display(),
            runtime_name
        );

        Ok(Self {
            config,
            registry,
            inventory,
            probe,
            downloader,
            discovery,
            settings,
            loader,
            responses,
        })
    }

    /// Engine on the sidecar runtime, SQLite settings, the system hardware
    /// probe and the curated + HuggingFace catalogs
    pub fn with_defaults(config: EngineConfig) -> Result<Self, LlmError> {
        let store = DatabaseManager::new(config.database_path.clone())
            .map_err(|e| LlmError::Storage(format!("{:#}", e)))?;
        let runtime = SidecarRuntime::new(SidecarConfig {
            sidecar_path: config.sidecar_path.clone(),
            ..SidecarConfig::default()
        });
        let catalog = CompositeCatalog::new(vec![
            Arc::new(CuratedCatalog),
            Arc::new(HuggingFaceCatalog::new(CATALOG_TIMEOUT)?),
        ]);
        let probe = SystemHardwareProbe::new(config.hardware_cache_ttl);

        Self::new(
            config,
            Arc::new(runtime),
            Arc::new(store),
            Arc::new(probe),
            Arc::new(catalog),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn hardware_snapshot(&self) -> HardwareSnapshot {
        self.probe.snapshot()
    }

    // === Discovery ===

    /// Downloaded models with their hardware-safe context size
    pub async fn list_local_models(&self) -> Result<Vec<LocalModel>, LlmError> {
        self.discovery.get_local_models().await
    }

    /// Local models plus the remote catalog
    pub async fn get_available_models(&self) -> Result<AvailableModels, LlmError> {
        self.discovery.get_available_models().await
    }

    pub async fn search_models(&self, query: &str) -> Result<AvailableModels, LlmError> {
        self.discovery.search_models(query).await
    }

    // === Downloads ===

    /// Download a catalog model into the models directory
    pub async fn download_model(
        &self,
        info: RemoteModelInfo,
        on_progress: Option<ProgressCallback>,
    ) -> Result<LocalModel, LlmError> {
        self.inventory.ensure_dir()?;
        let destination = self.inventory.resolve_path(&info.filename)?;
        let filename = info.filename.clone();

        self.downloader.download_model(info, destination, on_progress).await?;
        self.inventory.find_model(&filename)
    }

    pub async fn cancel_download(&self, filename: &str) -> bool {
        self.downloader.cancel_download(filename)
    }

    pub async fn get_download_progress(&self, filename: &str) -> Option<DownloadProgress> {
        self.downloader.get_download_progress(filename)
    }

    pub async fn list_downloads(&self) -> Vec<DownloadProgress> {
        self.downloader.list_downloads()
    }

    /// Delete a model's file and persisted settings, unloading it first
    pub async fn delete_model(&self, model_id: &str) -> Result<LocalModel, LlmError> {
        let guard = self.loader.prepare_model_for_deletion(model_id).await?;
        let model = self.discovery.delete_model(guard.model_id())?;
        if let Err(e) = self.settings.forget_model(&model.id) {
            log::warn!("Deleted {} but could not drop its settings: {}", model.id, e);
        }
        log::info!("Deleted model {}", model.id);
        Ok(model)
    }

    // === Settings ===

    /// Effective settings: running > persisted > calculated
    pub async fn get_model_settings(&self, model_id: &str) -> Result<ModelSettings, LlmError> {
        self.settings.get_model_settings(model_id)
    }

    /// Persist overrides; a loaded model picks them up on its next load
    pub async fn set_model_settings(&self, model_id: &str, settings: ModelLoadingSettings) -> Result<(), LlmError> {
        self.settings.set_model_settings(model_id, settings)
    }

    pub async fn calculate_settings(
        &self,
        model_id: &str,
        overrides: ModelLoadingSettings,
    ) -> Result<LoadSettings, LlmError> {
        self.settings.calculate_settings(model_id, &overrides)
    }

    pub async fn delete_model_settings(&self, model_id: &str) -> Result<(), LlmError> {
        self.settings.delete_model_settings(model_id)
    }

    pub async fn get_model_runtime_info(&self, model_id: &str) -> Option<ModelRuntimeInfo> {
        self.settings.get_model_runtime_info(&self.loader.canonical_id(model_id))
    }

    /// Forget cached context sizes, e.g. after the hardware changed
    pub async fn clear_settings_cache(&self) {
        self.settings.clear_cache();
    }

    // === Lifecycle ===

    pub async fn load_model(&self, id_or_name: &str, thread_id: Option<&str>) -> Result<ModelRuntimeInfo, LlmError> {
        self.loader.load_model(id_or_name, thread_id).await
    }

    pub async fn unload_model(&self, model_id: &str) -> Result<(), LlmError> {
        self.loader.unload_model(model_id).await
    }

    pub async fn get_model_state(&self, model_id: &str) -> ModelState {
        self.loader.state(&self.loader.canonical_id(model_id))
    }

    pub async fn loaded_models(&self) -> Vec<ModelRuntimeInfo> {
        self.registry
            .ids()
            .iter()
            .filter_map(|id| self.registry.get_model_runtime_info(id))
            .collect()
    }

    // === Generation ===

    pub async fn update_session_history(
        &self,
        model_id: &str,
        thread_id: &str,
        messages: &[Message],
    ) -> Result<bool, LlmError> {
        let model_id = self.loader.canonical_id(model_id);
        self.responses.update_session_history(&model_id, thread_id, messages).await
    }

    pub async fn generate_response(
        &self,
        model_id: &str,
        messages: &[Message],
        options: GenerateOptions,
    ) -> Result<CompletionResponse, LlmError> {
        let model_id = self.loader.canonical_id(model_id);
        self.responses.generate_response(&model_id, messages, options).await
    }

    pub async fn generate_stream_response(
        &self,
        model_id: &str,
        messages: &[Message],
        options: GenerateOptions,
    ) -> Result<GenerationStream, LlmError> {
        let model_id = self.loader.canonical_id(model_id);
        self.responses.generate_stream_response(&model_id, messages, options).await
    }

    pub async fn get_model_status(&self, model_id: &str) -> ModelStatus {
        self.responses.get_model_status(&self.loader.canonical_id(model_id))
    }

    pub async fn cancel_generation(&self, request_id: &str) -> bool {
        self.responses.cancel_generation(request_id)
    }

    pub async fn cancel_thread(&self, thread_id: &str) -> usize {
        self.responses.cancel_thread(thread_id)
    }

    /// Cancel downloads and unload every model
    pub async fn shutdown(&self) -> Result<(), LlmError> {
        self.downloader.cancel_all();
        let failures = self.loader.unload_all().await;
        log::info!("LLM engine shut down");
        match failures.into_iter().next() {
            Some((_, e)) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_engine::testing::{
        ample_cpu_snapshot, remote_model, write_gguf_fixture, GgufFixture, ScriptedRuntime, StaticCatalog, StaticProbe,
    };
    use std::sync::atomic::Ordering;
    use tempfile::{tempdir, TempDir};

    fn engine(runtime: Arc<ScriptedRuntime>) -> (TempDir, LlmEngine) {
        let dir = tempdir().unwrap();
        let config = EngineConfig::rooted_at(dir.path());
        let store = DatabaseManager::new(config.database_path.clone()).unwrap();
        let engine = LlmEngine::new(
            config,
            runtime,
            Arc::new(store),
            Arc::new(StaticProbe::new(ample_cpu_snapshot())),
            Arc::new(StaticCatalog::new(Vec::new())),
        )
        .unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn test_new_creates_models_dir() {
        let (_dir, engine) = engine(Arc::new(ScriptedRuntime::new()));
        assert!(engine.config().models_dir.is_dir());
        assert!(engine.list_local_models().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_loaded_model_unloads_and_drops_settings() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (_dir, engine) = engine(runtime.clone());
        let path = engine.config().models_dir.join("alpha.gguf");
        write_gguf_fixture(&path, &GgufFixture::default()).unwrap();

        engine
            .set_model_settings("alpha", ModelLoadingSettings { gpu_layers: Some(4), ..Default::default() })
            .await
            .unwrap();
        engine.load_model("alpha", Some("t")).await.unwrap();

        let deleted = engine.delete_model("alpha").await.unwrap();
        assert_eq!(deleted.id, "alpha");
        assert!(!path.exists());
        assert_eq!(runtime.unloads.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.live_sessions(), 0);
        assert_eq!(engine.get_model_state("alpha").await, ModelState::Unloaded);
        assert!(matches!(engine.get_model_settings("alpha").await, Err(LlmError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_download_rejects_escaping_filename() {
        let (_dir, engine) = engine(Arc::new(ScriptedRuntime::new()));
        let info = remote_model("../evil.gguf", "http://127.0.0.1:1/evil.gguf");
        assert!(matches!(engine.download_model(info, None).await, Err(LlmError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_shutdown_unloads_everything() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (_dir, engine) = engine(runtime.clone());
        for name in ["a.gguf", "b.gguf"] {
            write_gguf_fixture(&engine.config().models_dir.join(name), &GgufFixture::default()).unwrap();
        }
        engine.load_model("a", None).await.unwrap();
        engine.load_model("b", None).await.unwrap();
        assert_eq!(engine.loaded_models().await.len(), 2);

        engine.shutdown().await.unwrap();
        assert!(engine.loaded_models().await.is_empty());
        assert_eq!(runtime.loaded_models(), 0);
    }
}
