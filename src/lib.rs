//! The Small Inventory - stock valuation core
//!
//! Reconciles the stock ledger and the resale-product catalog stored in the
//! hosted backend into one canonical inventory value, caches dashboard
//! metrics locally, and keeps them fresh as change notifications arrive.
//!
//! Layering (leaf to root): [`backend`] / [`api`] -> [`data_manager`] ->
//! [`reconcile`] -> [`cache`] (+ [`metrics`], [`sync`]) -> [`display`].

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod backend;
pub mod cache;
pub mod config;
pub mod data_manager;
pub mod db;
pub mod diagnostics;
pub mod display;
pub mod error;
pub mod metrics;
pub mod models;
pub mod reconcile;
pub mod storage;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{BackendClient, Collection};
pub use cache::MetricCache;
pub use config::InventoryConfig;
pub use data_manager::DataManager;
pub use error::{InventoryError, Result};
pub use metrics::Metric;
pub use models::{MetricSource, ReconciledMetric};
pub use reconcile::{reconcile_stock_value, StockValuation};

// ---------------------------------------------------------------------------
// JSON row helpers
// ---------------------------------------------------------------------------

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Numeric field lookup. PostgREST serializes `numeric` columns as strings
/// in some configurations, so numeric strings are accepted too. Absent and
/// null fields are `Ok(None)`; any other value that is not a finite number
/// is rejected with a reason naming the field.
pub(crate) fn try_value_f64(
    v: &serde_json::Value,
    key: &str,
) -> std::result::Result<Option<f64>, String> {
    let parsed = match v.get(key) {
        None | Some(serde_json::Value::Null) => return Ok(None),
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    match parsed {
        Some(f) if f.is_finite() => Ok(Some(f)),
        _ => Err(format!("{key} is not a number: {}", v[key])),
    }
}

/// Identifier lookup accepting string, integer and uuid-like ids.
pub(crate) fn value_id(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match v.get(*key) {
            Some(serde_json::Value::Number(n)) => return Some(n.to_string()),
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => {
                return Some(s.trim().to_string())
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Initialize structured logging (console + daily rolling file in `log_dir`).
///
/// The returned guard flushes the file writer on drop and must be kept alive
/// for the lifetime of the process.
pub fn init_logging(log_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,the_small_inventory_lib=debug"));

    diagnostics::prune_old_logs(log_dir);
    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_try_value_f64_accepts_numbers_and_numeric_strings() {
        let row = json!({ "a": 1.5, "b": " 2.25 ", "d": null });
        assert_eq!(try_value_f64(&row, "a"), Ok(Some(1.5)));
        assert_eq!(try_value_f64(&row, "b"), Ok(Some(2.25)));
        assert_eq!(try_value_f64(&row, "d"), Ok(None));
        assert_eq!(try_value_f64(&row, "missing"), Ok(None));
    }

    #[test]
    fn test_try_value_f64_rejects_present_non_numbers() {
        let row = json!({ "comma": "10,0", "word": "abc", "blank": " ", "flag": true });
        for key in ["comma", "word", "blank", "flag"] {
            let err = try_value_f64(&row, key).unwrap_err();
            assert!(err.starts_with(key), "{err}");
        }
    }

    #[test]
    fn test_value_id_normalizes_numbers() {
        let row = json!({ "id": 42, "uuid": " 9f1c ", "empty": "" });
        assert_eq!(value_id(&row, &["id"]), Some("42".to_string()));
        assert_eq!(value_id(&row, &["uuid"]), Some("9f1c".to_string()));
        assert_eq!(value_id(&row, &["empty"]), None);
    }

    #[test]
    fn test_value_str_skips_blank_values() {
        let row = json!({ "name": "  ", "alt": "Pneu" });
        assert_eq!(value_str(&row, &["name", "alt"]), Some("Pneu".to_string()));
    }
}
