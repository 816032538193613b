//! Diagnostics for The Small Inventory.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Cache health**: schema version, metric cache entries, change log and
//!   stored inconsistency findings
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files.

use rusqlite::Connection;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::db::{self, DbState};
use crate::error::Result;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix of the daily rolling log.
pub const LOG_FILE_PREFIX: &str = "inventory.log";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Cache health
// ---------------------------------------------------------------------------

/// Summarize the local store for the `check` command.
pub fn get_cache_health(db: &DbState) -> Result<Value> {
    let conn = db.lock()?;

    let schema_version = db::schema_version(&conn);
    let (entries, stale) = metric_cache_counts(&conn)?;
    let mutations = collection_mutations(&conn)?;
    let inconsistencies: i64 =
        conn.query_row("SELECT COUNT(*) FROM stock_inconsistencies", [], |row| {
            row.get(0)
        })?;
    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);

    Ok(json!({
        "schemaVersion": schema_version,
        "dbPath": db.db_path.display().to_string(),
        "dbSizeBytes": db_size,
        "metricCache": { "entries": entries, "stale": stale },
        "collectionMutations": mutations,
        "inconsistencies": inconsistencies,
    }))
}

fn metric_cache_counts(conn: &Connection) -> Result<(i64, i64)> {
    let counts = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(is_stale), 0) FROM metric_cache",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(counts)
}

fn collection_mutations(conn: &Connection) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT collection, mutated_at, event_count
         FROM collection_mutations
         ORDER BY collection",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(json!({
            "collection": row.get::<_, String>(0)?,
            "mutatedAt": row.get::<_, String>(1)?,
            "eventCount": row.get::<_, i64>(2)?,
        }))
    })?;
    let mutations = rows.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(mutations)
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Prune old log files in `log_dir`, keeping only the most recent
/// `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Sort newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}
