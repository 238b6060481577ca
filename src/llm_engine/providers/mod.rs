//! Inference runtime implementations
//!
//! Each runtime implements the InferenceRuntime trait for a specific backend

pub mod sidecar_runtime;

pub use sidecar_runtime::{SidecarConfig, SidecarRuntime};
