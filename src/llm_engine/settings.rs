//! Model Settings Service
//!
//! Resolves the effective load settings for a model. Priority:
//! live runtime settings > persisted user settings > calculated defaults.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::model_manager::context::ContextCalculator;
use super::model_manager::inventory::ModelInventory;
use super::model_manager::types::LocalModel;
use super::provider::LlmError;
use super::registry::{ModelRegistry, ModelRuntimeInfo};
use crate::hardware_detector::HardwareProbe;

/// Sparse, user-facing load settings. Unset fields fall back to calculated values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLoadingSettings {
    pub gpu_layers: Option<u32>,
    pub context_size: Option<u32>,
    pub batch_size: Option<u32>,
}

impl ModelLoadingSettings {
    pub fn is_empty(&self) -> bool {
        self.gpu_layers.is_none() && self.context_size.is_none() && self.batch_size.is_none()
    }

    /// Fill unset fields from `defaults`
    pub fn merged_over(&self, defaults: &LoadSettings) -> LoadSettings {
        LoadSettings {
            gpu_layers: self.gpu_layers.unwrap_or(defaults.gpu_layers),
            context_size: self.context_size.unwrap_or(defaults.context_size),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
        }
    }
}

/// Fully-specified load settings handed to the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoadSettings {
    pub gpu_layers: u32,
    pub context_size: u32,
    pub batch_size: u32,
}

impl From<LoadSettings> for ModelLoadingSettings {
    fn from(s: LoadSettings) -> Self {
        Self {
            gpu_layers: Some(s.gpu_layers),
            context_size: Some(s.context_size),
            batch_size: Some(s.batch_size),
        }
    }
}

/// Where an effective setting came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsSource {
    Runtime,
    Persisted,
    Calculated,
}

/// Effective settings for a model and their origin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub model_id: String,
    pub settings: LoadSettings,
    pub source: SettingsSource,
}

/// Durable per-model settings storage
pub trait ModelSettingsStore: Send + Sync {
    fn load_model_settings(&self, model_id: &str) -> anyhow::Result<Option<ModelLoadingSettings>>;
    fn save_model_settings(&self, model_id: &str, settings: &ModelLoadingSettings) -> anyhow::Result<()>;
    fn delete_model_settings(&self, model_id: &str) -> anyhow::Result<()>;
}

pub struct ModelSettingsService {
    registry: ModelRegistry,
    store: Arc<dyn ModelSettingsStore>,
    calculator: Arc<ContextCalculator>,
    inventory: Arc<ModelInventory>,
    probe: Arc<dyn HardwareProbe>,
}

impl ModelSettingsService {
    pub fn new(
        registry: ModelRegistry,
        store: Arc<dyn ModelSettingsStore>,
        calculator: Arc<ContextCalculator>,
        inventory: Arc<ModelInventory>,
        probe: Arc<dyn HardwareProbe>,
    ) -> Self {
        Self {
            registry,
            store,
            calculator,
            inventory,
            probe,
        }
    }

    /// Effective settings for a model, by id or filename
    pub fn get_model_settings(&self, id_or_name: &str) -> Result<ModelSettings, LlmError> {
        if let Some(settings) = self.registry.runtime_settings(id_or_name) {
            return Ok(ModelSettings {
                model_id: id_or_name.to_string(),
                settings,
                source: SettingsSource::Runtime,
            });
        }

        let model = self.inventory.find_model(id_or_name)?;
        if let Some(settings) = self.registry.runtime_settings(&model.id) {
            return Ok(ModelSettings {
                model_id: model.id,
                settings,
                source: SettingsSource::Runtime,
            });
        }

        let persisted = self.persisted_settings(&model.id)?;
        let snapshot = self.probe.snapshot();
        let settings = self
            .calculator
            .calculate_optimal_settings(&model, &persisted.unwrap_or_default(), &snapshot);

        let source = match persisted {
            Some(p) if !p.is_empty() => SettingsSource::Persisted,
            _ => SettingsSource::Calculated,
        };

        Ok(ModelSettings {
            model_id: model.id,
            settings,
            source,
        })
    }

    /// Settings to apply on the next load: persisted overrides over calculated defaults
    pub fn settings_for_load(&self, model: &LocalModel) -> Result<LoadSettings, LlmError> {
        let persisted = self.persisted_settings(&model.id)?.unwrap_or_default();
        let snapshot = self.probe.snapshot();
        Ok(self.calculator.calculate_optimal_settings(model, &persisted, &snapshot))
    }

    /// Persist user overrides under the model's id. A running instance keeps
    /// its settings until reloaded.
    pub fn set_model_settings(&self, id_or_name: &str, settings: ModelLoadingSettings) -> Result<(), LlmError> {
        validate(&settings)?;
        let model = self.inventory.find_model(id_or_name)?;
        self.store
            .save_model_settings(&model.id, &settings)
            .map_err(|e| LlmError::Storage(format!("{:#}", e)))?;
        log::info!("Saved settings for model {}: {:?}", model.id, settings);
        Ok(())
    }

    /// Hardware-aware settings with optional user overrides, without persisting anything
    pub fn calculate_settings(
        &self,
        id_or_name: &str,
        overrides: &ModelLoadingSettings,
    ) -> Result<LoadSettings, LlmError> {
        let model = self.inventory.find_model(id_or_name)?;
        let snapshot = self.probe.snapshot();
        Ok(self.calculator.calculate_optimal_settings(&model, overrides, &snapshot))
    }

    /// Drop the persisted overrides of a downloaded model
    pub fn delete_model_settings(&self, id_or_name: &str) -> Result<(), LlmError> {
        let model = self.inventory.find_model(id_or_name)?;
        self.forget_model(&model.id)
    }

    /// Drop persisted overrides by model id, whether or not the file still exists
    pub fn forget_model(&self, model_id: &str) -> Result<(), LlmError> {
        self.store
            .delete_model_settings(model_id)
            .map_err(|e| LlmError::Storage(format!("{:#}", e)))
    }

    pub fn get_model_runtime_info(&self, model_id: &str) -> Option<ModelRuntimeInfo> {
        self.registry.get_model_runtime_info(model_id)
    }

    pub fn clear_cache(&self) {
        self.calculator.clear_cache();
    }

    fn persisted_settings(&self, model_id: &str) -> Result<Option<ModelLoadingSettings>, LlmError> {
        self.store
            .load_model_settings(model_id)
            .map_err(|e| LlmError::Storage(format!("{:#}", e)))
    }
}

fn validate(settings: &ModelLoadingSettings) -> Result<(), LlmError> {
    if settings.context_size == Some(0) {
        return Err(LlmError::InvalidRequest("context_size must be positive".to_string()));
    }
    if settings.batch_size == Some(0) {
        return Err(LlmError::InvalidRequest("batch_size must be positive".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use crate::llm_engine::testing::{ample_cpu_snapshot, write_gguf_fixture, GgufFixture, StaticProbe};
    use tempfile::{tempdir, TempDir};

    fn service_with_model(dir: &TempDir) -> (ModelSettingsService, ModelRegistry) {
        let models_dir = dir.path().join("models");
        std::fs::create_dir_all(&models_dir).unwrap();
        write_gguf_fixture(&models_dir.join("tiny-llama.Q4_K_M.gguf"), &GgufFixture::default()).unwrap();

        let db = DatabaseManager::new(dir.path().join("test.db")).unwrap();
        let registry = ModelRegistry::new();
        let service = ModelSettingsService::new(
            registry.clone(),
            Arc::new(db),
            Arc::new(ContextCalculator::new()),
            Arc::new(ModelInventory::new(models_dir)),
            Arc::new(StaticProbe::new(ample_cpu_snapshot())),
        );
        (service, registry)
    }

    #[test]
    fn test_persisted_overrides_only_specified_fields() {
        let dir = tempdir().unwrap();
        let (service, _) = service_with_model(&dir);

        let calculated = service.get_model_settings("tiny-llama.Q4_K_M").unwrap();
        assert_eq!(calculated.source, SettingsSource::Calculated);
        assert_eq!(
            calculated.settings,
            LoadSettings { gpu_layers: 0, context_size: 4096, batch_size: 512 }
        );

        service
            .set_model_settings(
                "tiny-llama.Q4_K_M",
                ModelLoadingSettings { gpu_layers: Some(10), ..Default::default() },
            )
            .unwrap();

        let resolved = service.get_model_settings("tiny-llama.Q4_K_M").unwrap();
        assert_eq!(resolved.source, SettingsSource::Persisted);
        assert_eq!(
            resolved.settings,
            LoadSettings { gpu_layers: 10, context_size: 4096, batch_size: 512 }
        );
    }

    #[test]
    fn test_runtime_settings_take_precedence() {
        let dir = tempdir().unwrap();
        let (service, registry) = service_with_model(&dir);

        service
            .set_model_settings(
                "tiny-llama.Q4_K_M",
                ModelLoadingSettings { context_size: Some(1024), ..Default::default() },
            )
            .unwrap();

        let live = LoadSettings { gpu_layers: 33, context_size: 2048, batch_size: 256 };
        registry.set(crate::llm_engine::testing::runtime_record("tiny-llama.Q4_K_M", live));

        let resolved = service.get_model_settings("tiny-llama.Q4_K_M").unwrap();
        assert_eq!(resolved.source, SettingsSource::Runtime);
        assert_eq!(resolved.settings, live);
    }

    #[test]
    fn test_unknown_model_is_not_found() {
        let dir = tempdir().unwrap();
        let (service, _) = service_with_model(&dir);
        assert!(matches!(service.get_model_settings("missing"), Err(LlmError::NotFound(_))));
        let saved = service.set_model_settings("missing", ModelLoadingSettings::default());
        assert!(matches!(saved, Err(LlmError::NotFound(_))));
        assert!(matches!(service.delete_model_settings("missing"), Err(LlmError::NotFound(_))));
    }

    #[test]
    fn test_filename_and_id_share_one_key() {
        let dir = tempdir().unwrap();
        let (service, registry) = service_with_model(&dir);

        service
            .set_model_settings(
                "tiny-llama.Q4_K_M.gguf",
                ModelLoadingSettings { gpu_layers: Some(7), ..Default::default() },
            )
            .unwrap();

        let by_id = service.get_model_settings("tiny-llama.Q4_K_M").unwrap();
        assert_eq!(by_id.model_id, "tiny-llama.Q4_K_M");
        assert_eq!(by_id.source, SettingsSource::Persisted);
        assert_eq!(by_id.settings.gpu_layers, 7);

        let model = ModelInventory::new(dir.path().join("models"))
            .find_model("tiny-llama.Q4_K_M")
            .unwrap();
        assert_eq!(service.settings_for_load(&model).unwrap().gpu_layers, 7);

        let live = LoadSettings { gpu_layers: 7, context_size: 2048, batch_size: 256 };
        registry.set(crate::llm_engine::testing::runtime_record("tiny-llama.Q4_K_M", live));
        let by_filename = service.get_model_settings("tiny-llama.Q4_K_M.gguf").unwrap();
        assert_eq!(by_filename.source, SettingsSource::Runtime);
        assert_eq!(by_filename.model_id, "tiny-llama.Q4_K_M");
        assert_eq!(by_filename.settings, live);

        service.delete_model_settings("tiny-llama.Q4_K_M.gguf").unwrap();
        registry.remove("tiny-llama.Q4_K_M");
        assert_eq!(
            service.get_model_settings("tiny-llama.Q4_K_M").unwrap().source,
            SettingsSource::Calculated
        );
    }

    #[test]
    fn test_rejects_zero_context() {
        let dir = tempdir().unwrap();
        let (service, _) = service_with_model(&dir);
        let result = service.set_model_settings(
            "tiny-llama.Q4_K_M",
            ModelLoadingSettings { context_size: Some(0), ..Default::default() },
        );
        assert!(matches!(result, Err(LlmError::InvalidRequest(_))));
    }
}
