//! Model Discovery - local inventory, remote catalog and sizing in one view

use std::collections::HashSet;
use std::sync::Arc;

use super::context::ContextCalculator;
use super::downloader::ModelDownloader;
use super::inventory::ModelInventory;
use super::types::{AvailableModels, LocalModel, RemoteModelInfo};
use crate::hardware_detector::HardwareProbe;
use crate::llm_engine::provider::LlmError;

pub struct ModelDiscovery {
    inventory: Arc<ModelInventory>,
    downloader: Arc<ModelDownloader>,
    calculator: Arc<ContextCalculator>,
    probe: Arc<dyn HardwareProbe>,
}

impl ModelDiscovery {
    pub fn new(
        inventory: Arc<ModelInventory>,
        downloader: Arc<ModelDownloader>,
        calculator: Arc<ContextCalculator>,
        probe: Arc<dyn HardwareProbe>,
    ) -> Self {
        Self {
            inventory,
            downloader,
            calculator,
            probe,
        }
    }

    /// Local models with their hardware-safe context size
    pub async fn get_local_models(&self) -> Result<Vec<LocalModel>, LlmError> {
        let inventory = Arc::clone(&self.inventory);
        let calculator = Arc::clone(&self.calculator);
        let probe = Arc::clone(&self.probe);

        // Directory scan and header parsing are blocking file I/O
        tokio::task::spawn_blocking(move || {
            let snapshot = probe.snapshot();
            inventory.list_local_models(&|model: &LocalModel| {
                Some(calculator.calculate_safe_context_size(model, &snapshot))
            })
        })
        .await
        .map_err(|e| LlmError::RuntimeFailure(format!("Model scan task failed: {}", e)))?
    }

    /// Local scan and catalog listing, run concurrently
    pub async fn get_available_models(&self) -> Result<AvailableModels, LlmError> {
        let (local, remote) = tokio::join!(self.get_local_models(), self.downloader.get_available_models());
        let local = local?;
        let remote = mark_downloaded(remote, &local);
        log::debug!("Discovered {} local and {} remote models", local.len(), remote.len());
        Ok(AvailableModels { local, remote })
    }

    /// Case-insensitive substring match over local models plus a catalog search
    pub async fn search_models(&self, query: &str) -> Result<AvailableModels, LlmError> {
        let (local, remote) = tokio::join!(self.get_local_models(), self.downloader.search_models(query));
        let needle = query.trim().to_lowercase();
        let local: Vec<LocalModel> = local?
            .into_iter()
            .filter(|m| {
                needle.is_empty()
                    || m.display_name.to_lowercase().contains(&needle)
                    || m.filename.to_lowercase().contains(&needle)
            })
            .collect();
        let remote = mark_downloaded(remote, &local);
        Ok(AvailableModels { local, remote })
    }

    /// Delete a model's file. The caller must have unloaded it first.
    pub fn delete_model(&self, id: &str) -> Result<LocalModel, LlmError> {
        let model = self.inventory.find_model(id)?;
        self.inventory.delete_file(&model.path)?;
        self.calculator.clear_cache();
        Ok(model)
    }
}

fn mark_downloaded(remote: Vec<RemoteModelInfo>, local: &[LocalModel]) -> Vec<RemoteModelInfo> {
    let present: HashSet<String> = local.iter().map(|m| m.filename.to_lowercase()).collect();
    remote
        .into_iter()
        .map(|mut m| {
            m.catalog_metadata.is_downloaded = present.contains(&m.filename.to_lowercase());
            m
        })
        .collect()
}
