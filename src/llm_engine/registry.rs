//! Model Registry - in-memory record of loaded models
//!
//! One `LoadedModelRuntime` per model id. The registry does no I/O and no
//! coordination of its own; the loader decides who may write a key.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::provider::ModelHandle;
use super::settings::LoadSettings;
use crate::hardware_detector::GpuKind;

/// A model currently resident in the runtime
#[derive(Debug, Clone)]
pub struct LoadedModelRuntime {
    pub model_id: String,
    pub handle: ModelHandle,
    pub model_path: PathBuf,
    /// Settings actually applied at load time
    pub settings: LoadSettings,
    /// Accelerator reported by the hardware probe when the model was loaded
    pub gpu_kind: GpuKind,
    pub runtime_name: &'static str,
    pub loaded_at: DateTime<Utc>,
    pub load_duration: Duration,
}

/// Transport-safe view of a loaded model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRuntimeInfo {
    pub model_id: String,
    pub runtime: String,
    pub gpu_layers: u32,
    pub context_size: u32,
    pub batch_size: u32,
    pub gpu_type: GpuKind,
    pub gpu_accelerated: bool,
    pub loaded_at: DateTime<Utc>,
    pub load_time_ms: u64,
}

impl From<&LoadedModelRuntime> for ModelRuntimeInfo {
    fn from(rt: &LoadedModelRuntime) -> Self {
        let gpu_accelerated = rt.settings.gpu_layers > 0 && rt.gpu_kind != GpuKind::None;
        Self {
            model_id: rt.model_id.clone(),
            runtime: rt.runtime_name.to_string(),
            gpu_layers: rt.settings.gpu_layers,
            context_size: rt.settings.context_size,
            batch_size: rt.settings.batch_size,
            gpu_type: if gpu_accelerated { rt.gpu_kind } else { GpuKind::None },
            gpu_accelerated,
            loaded_at: rt.loaded_at,
            load_time_ms: rt.load_duration.as_millis() as u64,
        }
    }
}

/// Shared map of model id to runtime record; clones share the same map
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: Arc<DashMap<String, Arc<LoadedModelRuntime>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model_id: &str) -> Option<Arc<LoadedModelRuntime>> {
        self.models.get(model_id).map(|r| Arc::clone(r.value()))
    }

    /// Insert or replace the record for `runtime.model_id`
    pub fn set(&self, runtime: LoadedModelRuntime) -> Option<Arc<LoadedModelRuntime>> {
        self.models.insert(runtime.model_id.clone(), Arc::new(runtime))
    }

    pub fn remove(&self, model_id: &str) -> Option<Arc<LoadedModelRuntime>> {
        self.models.remove(model_id).map(|(_, rt)| rt)
    }

    pub fn has(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Settings applied to a loaded model
    pub fn runtime_settings(&self, model_id: &str) -> Option<LoadSettings> {
        self.models.get(model_id).map(|r| r.settings)
    }

    pub fn get_model_runtime_info(&self, model_id: &str) -> Option<ModelRuntimeInfo> {
        self.models.get(model_id).map(|r| ModelRuntimeInfo::from(r.value().as_ref()))
    }
}
