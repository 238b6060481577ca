//! LLM Model Manager
//!
//! Finds, describes and downloads GGUF models for local inference.
//!
//! Module structure:
//! - types.rs: LocalModel, RemoteModelInfo, DownloadProgress
//! - gguf.rs: GGUF header/metadata reader
//! - inventory.rs: Models directory scanning and file operations
//! - context.rs: Hardware-aware context and offload sizing
//! - catalog.rs: Curated and HuggingFace catalogs
//! - downloader.rs: Single-flight, cancellable downloads
//! - discovery.rs: Local + remote model views

pub mod types;
pub mod gguf;
pub mod inventory;
pub mod context;
pub mod catalog;
pub mod downloader;
pub mod discovery;

pub use types::{AvailableModels, CatalogMetadata, DownloadProgress, DownloadStatus, LocalModel, RemoteModelInfo};
pub use inventory::ModelInventory;
pub use context::ContextCalculator;
pub use catalog::{CompositeCatalog, CuratedCatalog, HuggingFaceCatalog, RemoteCatalog};
pub use downloader::{DownloaderConfig, ModelDownloader, ProgressCallback};
pub use discovery::ModelDiscovery;
