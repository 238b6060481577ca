// Model settings models

use serde::{Deserialize, Serialize};

use crate::llm_engine::settings::ModelLoadingSettings;

/// Persisted load overrides for a specific model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettingsRecord {
    /// The model ID (file stem, e.g. "Llama-3.2-3B-Instruct-Q4_K_M")
    pub model_id: String,
    pub gpu_layers: Option<u32>,
    pub context_size: Option<u32>,
    pub batch_size: Option<u32>,
    /// When this record was created
    pub created_at: String,
    /// When this record was last updated
    pub updated_at: String,
}

impl ModelSettingsRecord {
    pub fn settings(&self) -> ModelLoadingSettings {
        ModelLoadingSettings {
            gpu_layers: self.gpu_layers,
            context_size: self.context_size,
            batch_size: self.batch_size,
        }
    }
}
