//! Background sync for The Small Inventory.
//!
//! Two long-running tasks keep the metric cache honest:
//!
//! - the change listener consumes realtime change events in arrival order
//!   and forwards each one to [`MetricCache::on_change_notification`];
//! - the refresh loop periodically calls `get_or_compute` for the dashboard
//!   metrics, which recomputes only what a notification made stale.
//!
//! Both stop when their `CancellationToken` is cancelled.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendClient;
use crate::cache::MetricCache;
use crate::error::{InventoryError, Result};
use crate::metrics::Metric;
use crate::models::{MetricSource, ReconciledMetric};
use crate::value_str;

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// One row-level change reported by the backend's realtime feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    /// Collection name as reported; untracked names are ignored downstream.
    pub collection: String,
    pub kind: ChangeKind,
    /// New row for inserts and updates, old row for deletes, when present.
    pub record: Option<Value>,
}

impl ChangeEvent {
    pub fn new(collection: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            collection: collection.into(),
            kind,
            record: None,
        }
    }

    /// Parse a realtime payload. Accepts both the `table`/`type`/`record`
    /// and the `collection`/`eventType`/`new` spellings.
    pub fn from_realtime_payload(payload: &Value) -> Result<Self> {
        let collection = value_str(payload, &["table", "collection"]).ok_or_else(|| {
            InventoryError::InvalidInput("change payload has no table".into())
        })?;
        let raw_kind = value_str(payload, &["type", "eventType"]).ok_or_else(|| {
            InventoryError::InvalidInput("change payload has no event type".into())
        })?;
        let kind = ChangeKind::parse(&raw_kind).ok_or_else(|| {
            InventoryError::InvalidInput(format!("unknown change type '{raw_kind}'"))
        })?;

        let pick = |keys: &[&str]| {
            keys.iter()
                .filter_map(|k| payload.get(*k))
                .find(|v| v.is_object())
                .cloned()
        };
        let record = match kind {
            ChangeKind::Delete => pick(&["old_record", "old"]),
            _ => pick(&["record", "new"]),
        };

        Ok(Self {
            collection,
            kind,
            record,
        })
    }
}

// ---------------------------------------------------------------------------
// Change listener
// ---------------------------------------------------------------------------

/// Spawn the change listener. Events are applied one at a time in the order
/// they were sent. The task ends when `cancel` fires or every sender is
/// dropped.
pub fn start_change_listener<B: BackendClient + 'static>(
    cache: Arc<MetricCache<B>>,
    mut events: mpsc::Receiver<ChangeEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Change listener started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            debug!(collection = %event.collection, kind = ?event.kind, "change received");
            if let Err(e) = cache.on_change_notification(&event.collection) {
                warn!(collection = %event.collection, "Failed to apply change notification: {e}");
            }
        }
        info!("Change listener stopped");
    })
}

// ---------------------------------------------------------------------------
// Refresh loop
// ---------------------------------------------------------------------------

/// Outcome of one refresh pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RefreshReport {
    pub values: Vec<ReconciledMetric>,
    pub recomputed: usize,
    pub failed: Vec<(String, String)>,
}

/// Bring every metric in `metrics` up to date. Failures are collected, not
/// propagated, so one unreachable source does not block the others.
pub async fn refresh_once<B: BackendClient>(
    cache: &MetricCache<B>,
    metrics: &[Metric],
) -> RefreshReport {
    let mut report = RefreshReport::default();
    for metric in metrics {
        match cache.get_or_compute(metric.key()).await {
            Ok(value) => {
                if value.source == MetricSource::Computed {
                    report.recomputed += 1;
                }
                report.values.push(value);
            }
            Err(e) => {
                warn!(metric = %metric, "Refresh failed: {e}");
                report.failed.push((metric.key().to_string(), e.to_string()));
            }
        }
    }
    report
}

/// Spawn the periodic refresh loop. The first pass runs immediately.
pub fn start_refresh_loop<B: BackendClient + 'static>(
    cache: Arc<MetricCache<B>>,
    metrics: Vec<Metric>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Refresh loop started (interval: {}s)", interval.as_secs());
        loop {
            let report = refresh_once(&cache, &metrics).await;
            if report.recomputed > 0 || !report.failed.is_empty() {
                info!(
                    recomputed = report.recomputed,
                    failed = report.failed.len(),
                    "Refresh cycle complete"
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Refresh loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Collection;
    use crate::data_manager::DataManager;
    use crate::db;
    use crate::testing::{debt_row, resale_row, stock_row, MockBackend};
    use serde_json::json;

    fn cache_over(backend: MockBackend) -> (Arc<MetricCache<MockBackend>>, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let db = Arc::new(db::open_in_memory().expect("in-memory db"));
        let cache = MetricCache::new(DataManager::new(Arc::clone(&backend)), db, 0.01);
        (Arc::new(cache), backend)
    }

    fn shop() -> MockBackend {
        let backend = MockBackend::with_rows(
            vec![stock_row("s1", "Pneu A", "product", 5.0, 50.0)],
            vec![resale_row("p1", "Pneu A", Some(5.0), Some(50.0))],
        );
        backend.insert_row(Collection::Debts, debt_row("d1", 100.0, 0.0));
        backend
    }

    #[test]
    fn test_parse_supabase_style_payload() {
        let payload = json!({
            "schema": "public",
            "table": "stock_items",
            "type": "UPDATE",
            "record": { "item_id": "s1", "quantity": 4 },
            "old_record": { "item_id": "s1" }
        });
        let event = ChangeEvent::from_realtime_payload(&payload).unwrap();
        assert_eq!(event.collection, "stock_items");
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.record.unwrap()["quantity"], json!(4));
    }

    #[test]
    fn test_parse_event_type_spelling_and_delete_record() {
        let payload = json!({
            "collection": "debts",
            "eventType": "delete",
            "new": {},
            "old": { "id": "d1" }
        });
        let event = ChangeEvent::from_realtime_payload(&payload).unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
        assert_eq!(event.record, Some(json!({ "id": "d1" })));
    }

    #[test]
    fn test_parse_rejects_incomplete_payloads() {
        assert!(ChangeEvent::from_realtime_payload(&json!({ "type": "INSERT" })).is_err());
        assert!(ChangeEvent::from_realtime_payload(&json!({ "table": "debts" })).is_err());
        assert!(matches!(
            ChangeEvent::from_realtime_payload(&json!({ "table": "debts", "type": "TRUNCATE" })),
            Err(InventoryError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_listener_applies_events_and_stops_when_channel_closes() {
        let (cache, backend) = cache_over(shop());
        cache.get_or_compute("total_stock_value").await.unwrap();
        cache.get_or_compute("outstanding_debt").await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let handle = start_change_listener(Arc::clone(&cache), rx, CancellationToken::new());
        tx.send(ChangeEvent::new("suppliers", ChangeKind::Insert))
            .await
            .unwrap();
        tx.send(ChangeEvent::new("resale_products", ChangeKind::Update))
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        let total = cache.get_or_compute("total_stock_value").await.unwrap();
        assert_eq!(total.source, MetricSource::Computed);
        let debt = cache.get_or_compute("outstanding_debt").await.unwrap();
        assert_eq!(debt.source, MetricSource::Cached);
        assert_eq!(backend.select_count(Collection::Debts), 1);
    }

    #[tokio::test]
    async fn test_listener_stops_on_cancel() {
        let (cache, _) = cache_over(shop());
        let (_tx, rx) = mpsc::channel::<ChangeEvent>(1);
        let cancel = CancellationToken::new();
        let handle = start_change_listener(cache, rx, cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_refresh_once_recomputes_only_stale_metrics() {
        let (cache, _) = cache_over(shop());
        let first = refresh_once(&cache, &Metric::ALL).await;
        assert_eq!(first.recomputed, 4);
        assert!(first.failed.is_empty());

        cache.on_change_notification("debts").unwrap();
        let second = refresh_once(&cache, &Metric::ALL).await;
        assert_eq!(second.recomputed, 1);
        assert_eq!(second.values.len(), 4);
    }

    #[tokio::test]
    async fn test_refresh_once_collects_failures() {
        let (cache, backend) = cache_over(shop());
        backend.set_failing(true);
        let report = refresh_once(&cache, &[Metric::OutstandingDebt]).await;
        assert!(report.values.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "outstanding_debt");
    }

    #[tokio::test]
    async fn test_refresh_loop_runs_until_cancelled() {
        let (cache, backend) = cache_over(shop());
        let cancel = CancellationToken::new();
        let handle = start_refresh_loop(
            Arc::clone(&cache),
            vec![Metric::TotalStockValue],
            Duration::from_millis(20),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("refresh loop should stop")
            .unwrap();

        // Later passes were served from the cache.
        assert_eq!(backend.select_count(Collection::StockItems), 1);
        assert!(cache.last_known(Metric::TotalStockValue).unwrap().is_some());
    }
}
