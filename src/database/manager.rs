//! SQLite store behind the per-model settings.
//!
//! A single connection guarded by a mutex; settings writes are rare and
//! small, so there is no pool.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use super::migrations;

/// Another process holding the file gets this long before writes fail
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DatabaseManager {
    conn: Mutex<Connection>,
    /// None for an in-memory store
    location: Option<PathBuf>,
}

impl DatabaseManager {
    /// Open (or create) the settings file at `db_path` and bring its schema up to date
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create settings directory {}", parent.display()))?;
        }

        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open settings database {}", db_path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;

        Self::prepare(conn, Some(db_path))
    }

    /// Settings that live only as long as the manager
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory settings database")?;
        Self::prepare(conn, None)
    }

    fn prepare(conn: Connection, location: Option<PathBuf>) -> Result<Self> {
        migrations::run_migrations(&conn)
            .context("Failed to migrate settings schema")?;

        match &location {
            Some(path) => log::info!("Model settings stored in {}", path.display()),
            None => log::debug!("Model settings kept in memory"),
        }

        Ok(Self {
            conn: Mutex::new(conn),
            location,
        })
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock()
            .map_err(|e| anyhow::anyhow!("Settings database lock poisoned: {}", e))?;
        f(&conn)
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    pub fn schema_version(&self) -> Result<i32> {
        self.with_connection(|conn| {
            Ok(conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))?)
        })
    }
}
