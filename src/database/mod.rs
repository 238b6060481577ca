// Database module for local-llm
// Provides SQLite persistence for per-model load settings

pub mod manager;
pub mod migrations;
pub mod models;
pub mod model_settings_repo;

pub use manager::DatabaseManager;
pub use models::*;
