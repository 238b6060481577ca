// local-llm - local GGUF model orchestration
//
// Finds, downloads, sizes, loads and runs GGUF models on the local machine:
// - Model inventory, remote catalog and single-flight downloads
// - Hardware-aware context and GPU offload settings
// - Per-model load/unload state machine and per-thread sessions
// - Blocking and streaming generation with cancellation

// Performance logging macros - exported for use by other modules
#[macro_use]
pub mod macros;

pub mod config;
pub mod database;
pub mod hardware_detector;
pub mod llm_engine;

pub use config::EngineConfig;
pub use llm_engine::{LlmEngine, LlmError};

/// Install env_logger on stderr (reads RUST_LOG, defaults to info).
///
/// Safe to call more than once; only the first call installs a logger.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
