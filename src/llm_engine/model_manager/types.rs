//! Model Manager Types

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A GGUF model file found in the models directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalModel {
    /// Stable identifier derived from the filename (file stem)
    pub id: String,
    pub filename: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Quantization label (e.g. "Q4_K_M")
    pub quantization: Option<String>,
    /// Context length the model was trained with, from GGUF metadata
    pub trained_context_length: Option<u32>,
    /// Layer count, from GGUF metadata
    pub block_count: Option<u32>,
    /// Bytes of KV cache per context token, when metadata allows computing it
    pub kv_bytes_per_token: Option<u64>,
    /// Context size the hardware can afford, filled by the caller's resolver
    pub safe_context_size: Option<u32>,
    /// Human-readable name
    pub display_name: String,
}

/// A model offered by the remote catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteModelInfo {
    pub filename: String,
    /// Download URL
    pub url: String,
    pub size_bytes: u64,
    pub quantization: Option<String>,
    /// Expected SHA256 hash
    pub sha256: Option<String>,
    pub catalog_metadata: CatalogMetadata,
}

/// Descriptive catalog fields
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogMetadata {
    pub name: String,
    pub description: Option<String>,
    /// HuggingFace repository ID (e.g., "bartowski/Llama-3.2-3B-Instruct-GGUF")
    pub repo: Option<String>,
    pub context_length: Option<u32>,
    pub recommended_for: Vec<String>,
    /// Whether the file is already present locally
    pub is_downloaded: bool,
}

/// Local and remote models together
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvailableModels {
    pub local: Vec<LocalModel>,
    pub remote: Vec<RemoteModelInfo>,
}

/// Download progress snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadProgress {
    pub filename: String,
    pub bytes_received: u64,
    pub total_bytes: u64,
    /// 0.0 ..= 1.0, 0.0 while the total is unknown
    pub fraction: f32,
    /// Smoothed transfer rate in bytes per second
    pub speed_bps: f64,
    /// Human-readable speed (e.g. "12.4 MB/s")
    pub speed_label: String,
    pub status: DownloadStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Active,
    Verifying,
    Cancelled,
    Completed,
    Failed(String),
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Cancelled | DownloadStatus::Completed | DownloadStatus::Failed(_)
        )
    }
}
