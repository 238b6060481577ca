// Model settings repository for local-llm
// Handles CRUD operations for persisted per-model load overrides

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::models::ModelSettingsRecord;
use super::DatabaseManager;
use crate::llm_engine::settings::{ModelLoadingSettings, ModelSettingsStore};

impl DatabaseManager {
    /// Get the persisted record for a specific model
    /// Returns None if the user never configured this model
    pub fn get_model_settings_record(&self, model_id: &str) -> Result<Option<ModelSettingsRecord>> {
        self.with_connection(|conn| get_record_impl(conn, model_id))
    }

    /// Get all persisted model settings
    pub fn get_all_model_settings(&self) -> Result<Vec<ModelSettingsRecord>> {
        self.with_connection(get_all_impl)
    }

    /// Upsert the overrides for a model (create or replace)
    pub fn upsert_model_settings(&self, model_id: &str, settings: &ModelLoadingSettings) -> Result<()> {
        self.with_connection(|conn| upsert_impl(conn, model_id, settings))
    }

    /// Delete the overrides for a model
    pub fn remove_model_settings(&self, model_id: &str) -> Result<()> {
        self.with_connection(|conn| delete_impl(conn, model_id))
    }
}

impl ModelSettingsStore for DatabaseManager {
    fn load_model_settings(&self, model_id: &str) -> Result<Option<ModelLoadingSettings>> {
        Ok(self.get_model_settings_record(model_id)?.map(|r| r.settings()))
    }

    fn save_model_settings(&self, model_id: &str, settings: &ModelLoadingSettings) -> Result<()> {
        self.upsert_model_settings(model_id, settings)
    }

    fn delete_model_settings(&self, model_id: &str) -> Result<()> {
        self.remove_model_settings(model_id)
    }
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelSettingsRecord> {
    Ok(ModelSettingsRecord {
        model_id: row.get(0)?,
        gpu_layers: row.get(1)?,
        context_size: row.get(2)?,
        batch_size: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn get_record_impl(conn: &Connection, model_id: &str) -> Result<Option<ModelSettingsRecord>> {
    let mut stmt = conn.prepare(
        "SELECT model_id, gpu_layers, context_size, batch_size, created_at, updated_at
         FROM model_settings WHERE model_id = ?"
    ).context("Failed to prepare get_model_settings query")?;

    stmt.query_row(params![model_id], map_row)
        .optional()
        .context("Failed to get model settings")
}

fn get_all_impl(conn: &Connection) -> Result<Vec<ModelSettingsRecord>> {
    let mut stmt = conn.prepare(
        "SELECT model_id, gpu_layers, context_size, batch_size, created_at, updated_at
         FROM model_settings ORDER BY model_id"
    ).context("Failed to prepare get_all_model_settings query")?;

    let records = stmt.query_map([], map_row)
        .context("Failed to query model settings")?;

    records.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to collect model settings")
}

fn upsert_impl(conn: &Connection, model_id: &str, settings: &ModelLoadingSettings) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO model_settings (model_id, gpu_layers, context_size, batch_size, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, datetime('now'), datetime('now'))
        ON CONFLICT(model_id) DO UPDATE SET
            gpu_layers = excluded.gpu_layers,
            context_size = excluded.context_size,
            batch_size = excluded.batch_size,
            updated_at = datetime('now')
        "#,
        params![model_id, settings.gpu_layers, settings.context_size, settings.batch_size],
    ).context("Failed to upsert model settings")?;

    Ok(())
}

fn delete_impl(conn: &Connection, model_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM model_settings WHERE model_id = ?",
        params![model_id],
    ).context("Failed to delete model settings")?;

    Ok(())
}
