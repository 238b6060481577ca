//! Context Calculator - hardware-aware context window and offload sizing

use dashmap::DashMap;
use log::{debug, warn};

use super::types::LocalModel;
use crate::hardware_detector::HardwareSnapshot;
use crate::llm_engine::settings::{LoadSettings, ModelLoadingSettings};

const BYTES_PER_GIB: u64 = 1024 * 1024 * 1024;

/// Smallest context ever recommended (unless the model itself is smaller)
pub const MIN_CONTEXT_SIZE: u32 = 512;
/// Context used when hardware capacity is unknown
pub const FALLBACK_CONTEXT_SIZE: u32 = 2048;
/// Assumed trained context when the metadata does not say
pub const DEFAULT_TRAINED_CONTEXT: u32 = 4096;
pub const DEFAULT_BATCH_SIZE: u32 = 512;
pub const LARGE_BATCH_SIZE: u32 = 1024;

/// Context sizes are rounded down to this granularity
const CONTEXT_GRANULARITY: u32 = 256;
/// Compute scratch buffers can reach half the KV cache, so only half the budget goes to KV
const KV_BUDGET_FRACTION: f64 = 0.5;
/// Leave some VRAM for the driver and other applications
const VRAM_HEADROOM: f64 = 0.9;
/// Layer count assumed when the metadata does not say
const DEFAULT_LAYER_COUNT: u32 = 32;
/// VRAM needed before the larger batch size is used
const LARGE_BATCH_VRAM: u64 = 8 * BYTES_PER_GIB;

/// Computes load settings from model metadata and hardware, caching per
/// (model id, hardware signature)
#[derive(Default)]
pub struct ContextCalculator {
    cache: DashMap<(String, String), LoadSettings>,
}

impl ContextCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest context the hardware can hold for this model, capped by the trained length
    pub fn calculate_safe_context_size(&self, model: &LocalModel, snapshot: &HardwareSnapshot) -> u32 {
        self.calculated_defaults(model, snapshot).context_size
    }

    /// User overrides on top of calculated defaults.
    ///
    /// User fields win, except that context never exceeds the trained length.
    pub fn calculate_optimal_settings(
        &self,
        model: &LocalModel,
        user_settings: &ModelLoadingSettings,
        snapshot: &HardwareSnapshot,
    ) -> LoadSettings {
        let defaults = self.calculated_defaults(model, snapshot);
        let mut settings = user_settings.merged_over(&defaults);

        let trained = trained_context(model);
        if settings.context_size > trained {
            warn!(
                "Requested context {} for {} exceeds trained length {}, capping",
                settings.context_size, model.id, trained
            );
            settings.context_size = trained;
        }
        settings.context_size = settings.context_size.max(1);
        settings.batch_size = settings.batch_size.max(1);

        if user_settings.context_size.map_or(false, |c| c > defaults.context_size) {
            warn!(
                "Context {} for {} exceeds the hardware-safe size {}",
                settings.context_size, model.id, defaults.context_size
            );
        }

        settings
    }

    /// Invalidate every cached result
    pub fn clear_cache(&self) {
        let entries = self.cache.len();
        self.cache.clear();
        debug!("Cleared context calculator cache ({} entries)", entries);
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    fn calculated_defaults(&self, model: &LocalModel, snapshot: &HardwareSnapshot) -> LoadSettings {
        let key = (model.id.clone(), snapshot.signature());
        if let Some(hit) = self.cache.get(&key) {
            return *hit;
        }

        let gpu_layers = gpu_layers_for(model, snapshot);
        let context_size = context_for(model, snapshot, gpu_layers);
        let batch_size = batch_for(snapshot, gpu_layers).min(context_size);

        let settings = LoadSettings {
            gpu_layers,
            context_size,
            batch_size,
        };
        debug!("Calculated settings for {}: {:?}", model.id, settings);
        self.cache.insert(key, settings);
        settings
    }
}

fn trained_context(model: &LocalModel) -> u32 {
    model
        .trained_context_length
        .filter(|c| *c > 0)
        .unwrap_or(DEFAULT_TRAINED_CONTEXT)
}

fn layer_count(model: &LocalModel) -> u32 {
    model.block_count.filter(|b| *b > 0).unwrap_or(DEFAULT_LAYER_COUNT)
}

/// Rough KV bytes per token when the metadata is incomplete: ~32 KiB per GiB of weights
fn estimated_kv_bytes_per_token(model: &LocalModel) -> u64 {
    (model.size_bytes / BYTES_PER_GIB).max(1) * 32 * 1024
}

fn gpu_layers_for(model: &LocalModel, snapshot: &HardwareSnapshot) -> u32 {
    let vram = match snapshot.usable_vram() {
        Some(v) => (v as f64 * VRAM_HEADROOM) as u64,
        None => return 0,
    };
    let layers = layer_count(model);
    if model.size_bytes <= vram {
        return layers;
    }
    let per_layer = (model.size_bytes / layers as u64).max(1);
    ((vram / per_layer) as u32).min(layers)
}

fn context_for(model: &LocalModel, snapshot: &HardwareSnapshot, gpu_layers: u32) -> u32 {
    let trained = trained_context(model);
    let floor = MIN_CONTEXT_SIZE.min(trained);

    let vram = snapshot.usable_vram().unwrap_or(0);
    let ram = if snapshot.free_ram > 0 {
        snapshot.free_ram
    } else {
        snapshot.total_ram / 2
    };
    if ram == 0 && vram == 0 {
        // Nothing known about capacity
        return FALLBACK_CONTEXT_SIZE.min(trained);
    }

    let layers = layer_count(model) as u64;
    let gpu_bytes = model.size_bytes.saturating_mul(gpu_layers.min(layers as u32) as u64) / layers;
    let cpu_bytes = model.size_bytes - gpu_bytes;
    let budget = ram.saturating_sub(cpu_bytes) + vram.saturating_sub(gpu_bytes);
    let kv_budget = (budget as f64 * KV_BUDGET_FRACTION) as u64;

    let per_token = model
        .kv_bytes_per_token
        .filter(|b| *b > 0)
        .unwrap_or_else(|| estimated_kv_bytes_per_token(model));
    let memory_ctx = (kv_budget / per_token).min(u32::MAX as u64) as u32;

    let ctx = memory_ctx.min(trained);
    let rounded = if ctx >= CONTEXT_GRANULARITY {
        ctx / CONTEXT_GRANULARITY * CONTEXT_GRANULARITY
    } else {
        ctx
    };
    rounded.max(floor)
}

fn batch_for(snapshot: &HardwareSnapshot, gpu_layers: u32) -> u32 {
    match snapshot.usable_vram() {
        Some(vram) if gpu_layers > 0 && vram >= LARGE_BATCH_VRAM => LARGE_BATCH_SIZE,
        _ => DEFAULT_BATCH_SIZE,
    }
}
