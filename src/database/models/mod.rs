// Database models - Re-exports all domain-specific models
//
// - model_settings.rs: Persisted per-model load overrides

mod model_settings;

pub use model_settings::ModelSettingsRecord;
