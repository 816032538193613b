//! Local SQLite store for The Small Inventory.
//!
//! Uses rusqlite with WAL mode. Holds the metric cache, the per-collection
//! mutation log and per-metric invalidations used for staleness checks,
//! and the latest ledger inconsistency findings.

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{InventoryError, Result};

/// Shared handle to the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection, mapping a poisoned lock to a cache error.
    pub fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| InventoryError::Cache(format!("db lock poisoned: {e}")))
    }
}

/// Current schema version. Bump when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: i32 = 3;

const DB_FILE_NAME: &str = "inventory.db";

/// Initialize the database at `{data_dir}/inventory.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. The file only holds derived data, so on
/// corruption or open failure it is deleted and reopened once.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| InventoryError::Cache(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path).map_err(|e| {
                InventoryError::Cache(format!("Database open failed after retry: {e}"))
            })?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open an in-memory database with the full schema. Used by tests and by
/// callers that want a throwaway cache.
pub fn open_in_memory() -> Result<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> std::result::Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Highest applied schema version, 0 for a fresh database.
pub fn schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| InventoryError::Cache(format!("create schema_version: {e}")))?;

    let current = schema_version(conn);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: metric cache and collection mutation log.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- serialized ReconciledMetric per metric key
        CREATE TABLE IF NOT EXISTS metric_cache (
            metric_key TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            computed_at TEXT NOT NULL,
            is_stale INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- last known mutation per backend collection
        CREATE TABLE IF NOT EXISTS collection_mutations (
            collection TEXT PRIMARY KEY,
            mutated_at TEXT NOT NULL,
            event_count INTEGER NOT NULL DEFAULT 0
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        InventoryError::Cache(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1 (metric_cache, collection_mutations)");
    Ok(())
}

/// Migration v2: latest ledger inconsistency findings.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS stock_inconsistencies (
            item_id TEXT PRIMARY KEY,
            item_name TEXT NOT NULL,
            stored_total REAL NOT NULL,
            expected_total REAL NOT NULL,
            matched_resale INTEGER NOT NULL DEFAULT 0,
            detected_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_stock_inconsistencies_detected
            ON stock_inconsistencies(detected_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        InventoryError::Cache(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2 (stock_inconsistencies)");
    Ok(())
}

/// Migration v3: last explicit invalidation per metric, kept apart from
/// `metric_cache` so an invalidation survives a store that was already in
/// flight.
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metric_invalidations (
            metric_key TEXT PRIMARY KEY,
            invalidated_at TEXT NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        InventoryError::Cache(format!("migration v3: {e}"))
    })?;

    info!("Applied migration v3 (metric_invalidations)");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
