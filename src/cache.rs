//! Metric cache layer for The Small Inventory.
//!
//! Owns every [`ReconciledMetric`] the dashboard shows. Values live in the
//! local SQLite `metric_cache` table; freshness is decided from the stale flag
//! plus the `collection_mutations` log, so a change notification invalidates
//! exactly the metrics whose dependency set contains the changed collection.
//! Explicit invalidations are timestamped in `metric_invalidations`, so one
//! issued while a recomputation is loading still leaves its result stale.
//!
//! Concurrent requests for the same metric share one in-flight computation:
//! the first caller (the leader) computes and broadcasts, later callers
//! subscribe to the leader's channel and observe the same value and
//! timestamp.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::backend::{BackendClient, Collection};
use crate::data_manager::DataManager;
use crate::db::DbState;
use crate::error::{InventoryError, Result};
use crate::metrics::{self, Metric};
use crate::models::{
    Debt, DebtPatch, MetricSource, ReconciledMetric, StockItemPatch, StockRecord,
};
use crate::reconcile::{reconcile_stock_value, Inconsistency, StockValuation};

type InFlightSender = broadcast::Sender<Result<ReconciledMetric>>;

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_stored_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| InventoryError::Cache(format!("bad stored timestamp '{raw}': {e}")))
}

/// One `metric_cache` row as seen by diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntryStatus {
    pub metric_key: String,
    pub value: f64,
    pub computed_at: DateTime<Utc>,
    pub is_stale: bool,
    /// Not stale and newer than every recorded mutation of its sources.
    pub is_fresh: bool,
}

/// Role a caller takes for one metric computation.
enum Role<'a, B: BackendClient> {
    Leader(InFlightSlot<'a, B>),
    Waiter(broadcast::Receiver<Result<ReconciledMetric>>),
}

/// Leader's claim on the in-flight map. Dropping it without completing
/// (e.g. the leader's task was cancelled) frees the slot, which closes the
/// channel for every waiter.
struct InFlightSlot<'a, B: BackendClient> {
    cache: &'a MetricCache<B>,
    metric: Metric,
    completed: bool,
}

impl<B: BackendClient> InFlightSlot<'_, B> {
    fn complete(mut self, result: &Result<ReconciledMetric>) {
        self.completed = true;
        let sender = match self.cache.in_flight.lock() {
            Ok(mut map) => map.remove(&self.metric),
            Err(e) => {
                warn!(metric = %self.metric, "in-flight map lock poisoned: {e}");
                None
            }
        };
        if let Some(sender) = sender {
            // No receivers is fine: nobody joined this computation.
            let _ = sender.send(result.clone());
        }
    }
}

impl<B: BackendClient> Drop for InFlightSlot<'_, B> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Ok(mut map) = self.cache.in_flight.lock() {
            map.remove(&self.metric);
        }
        warn!(metric = %self.metric, "metric computation abandoned before completion");
    }
}

pub struct MetricCache<B: BackendClient> {
    data: DataManager<B>,
    db: Arc<DbState>,
    tolerance: f64,
    in_flight: Mutex<HashMap<Metric, InFlightSender>>,
}

impl<B: BackendClient> MetricCache<B> {
    pub fn new(data: DataManager<B>, db: Arc<DbState>, tolerance: f64) -> Self {
        Self {
            data,
            db,
            tolerance,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn data(&self) -> &DataManager<B> {
        &self.data
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Return the cached metric when fresh, otherwise recompute and store it.
    pub async fn get_or_compute(&self, metric_key: &str) -> Result<ReconciledMetric> {
        let metric = Metric::from_key(metric_key)?;
        if let Some(cached) = self.fresh_entry(metric)? {
            debug!(metric = %metric, "metric cache hit");
            return Ok(cached.with_source(MetricSource::Cached));
        }
        self.compute_shared(metric, true).await
    }

    /// Force a recomputation regardless of freshness.
    pub async fn recompute(&self, metric_key: &str) -> Result<ReconciledMetric> {
        let metric = Metric::from_key(metric_key)?;
        self.compute_shared(metric, false).await
    }

    /// Like [`get_or_compute`](Self::get_or_compute), but when recomputation
    /// fails the last stored value is returned with `source = Stale`. Errors
    /// only when no value was ever stored.
    pub async fn get_or_last_known(&self, metric_key: &str) -> Result<ReconciledMetric> {
        let metric = Metric::from_key(metric_key)?;
        match self.get_or_compute(metric_key).await {
            Ok(value) => Ok(value),
            Err(err) => match self.last_known(metric)? {
                Some(last) => {
                    warn!(
                        metric = %metric,
                        computed_at = %last.computed_at,
                        error = %err,
                        "serving last known value"
                    );
                    Ok(last.with_source(MetricSource::Stale))
                }
                None => Err(err),
            },
        }
    }

    /// Last stored value for `metric`, fresh or not, without touching the
    /// backend.
    pub fn last_known(&self, metric: Metric) -> Result<Option<ReconciledMetric>> {
        let conn = self.db.lock()?;
        let Some(entry) = read_entry(&conn, metric)? else {
            return Ok(None);
        };
        let source = if entry.is_fresh {
            MetricSource::Cached
        } else {
            MetricSource::Stale
        };
        Ok(Some(entry.metric.with_source(source)))
    }

    fn fresh_entry(&self, metric: Metric) -> Result<Option<ReconciledMetric>> {
        Ok(self
            .last_known(metric)?
            .filter(|m| m.source == MetricSource::Cached))
    }

    // -----------------------------------------------------------------------
    // Invalidation
    // -----------------------------------------------------------------------

    /// Mark a metric stale. Returns whether an entry existed.
    ///
    /// The invalidation time is recorded even when no entry exists yet, so a
    /// computation already loading stores its result as stale.
    pub fn invalidate(&self, metric_key: &str) -> Result<bool> {
        let metric = Metric::from_key(metric_key)?;
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO metric_invalidations (metric_key, invalidated_at)
             VALUES (?1, ?2)
             ON CONFLICT(metric_key) DO UPDATE SET invalidated_at = excluded.invalidated_at",
            params![metric.key(), timestamp(Utc::now())],
        )?;
        let changed = mark_stale(&tx, metric)?;
        tx.commit()?;
        debug!(metric = %metric, existed = changed, "metric invalidated");
        Ok(changed)
    }

    /// Record that `collection_name` changed and mark every dependent metric
    /// stale. Unknown collections are ignored. Returns the affected metrics.
    pub fn on_change_notification(&self, collection_name: &str) -> Result<Vec<Metric>> {
        let Some(collection) = Collection::parse(collection_name) else {
            debug!(collection = collection_name, "ignoring change on untracked collection");
            return Ok(Vec::new());
        };

        let affected: Vec<Metric> = Metric::ALL
            .into_iter()
            .filter(|m| m.depends_on(collection))
            .collect();

        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO collection_mutations (collection, mutated_at, event_count)
             VALUES (?1, ?2, 1)
             ON CONFLICT(collection) DO UPDATE SET
                mutated_at = excluded.mutated_at,
                event_count = event_count + 1",
            params![collection.table_name(), timestamp(Utc::now())],
        )?;
        for metric in &affected {
            mark_stale(&tx, *metric)?;
        }
        tx.commit()?;

        info!(
            collection = %collection,
            affected = ?affected.iter().map(Metric::key).collect::<Vec<_>>(),
            "change notification applied"
        );
        Ok(affected)
    }

    // -----------------------------------------------------------------------
    // Computation
    // -----------------------------------------------------------------------

    fn claim(&self, metric: Metric) -> Result<Role<'_, B>> {
        let mut map = self
            .in_flight
            .lock()
            .map_err(|e| InventoryError::Cache(format!("in-flight map lock poisoned: {e}")))?;
        if let Some(sender) = map.get(&metric) {
            return Ok(Role::Waiter(sender.subscribe()));
        }
        let (sender, _) = broadcast::channel(1);
        map.insert(metric, sender);
        Ok(Role::Leader(InFlightSlot {
            cache: self,
            metric,
            completed: false,
        }))
    }

    async fn compute_shared(
        &self,
        metric: Metric,
        accept_fresh: bool,
    ) -> Result<ReconciledMetric> {
        match self.claim(metric)? {
            Role::Waiter(mut receiver) => {
                debug!(metric = %metric, "joining in-flight computation");
                match receiver.recv().await {
                    Ok(result) => result,
                    Err(_) => Err(InventoryError::BackendUnavailable(format!(
                        "computation of {metric} was abandoned"
                    ))),
                }
            }
            Role::Leader(slot) => {
                // A previous leader may have stored a value between our
                // freshness check and the claim.
                let result = match self.fresh_entry(metric) {
                    Ok(Some(cached)) if accept_fresh => {
                        Ok(cached.with_source(MetricSource::Cached))
                    }
                    Ok(_) => self.compute_and_store(metric).await,
                    Err(e) => Err(e),
                };
                slot.complete(&result);
                result
            }
        }
    }

    async fn compute_and_store(&self, metric: Metric) -> Result<ReconciledMetric> {
        // Taken before loading so a mutation recorded mid-load marks the
        // stored result stale on the next read.
        let computed_at = Utc::now();
        let computation = metrics::compute(metric, &self.data, self.tolerance)
            .await
            .map_err(|e| {
                warn!(metric = %metric, error = %e, "metric recomputation failed, cache left as is");
                e
            })?;

        if let Some(valuation) = &computation.valuation {
            self.record_inconsistencies(valuation, computed_at)?;
        }

        let result = ReconciledMetric {
            metric_key: metric.key().to_string(),
            value: computation.value,
            computed_at,
            source: MetricSource::Computed,
        };
        self.store(&result)?;
        info!(metric = %metric, value = result.value, "metric recomputed");
        Ok(result)
    }

    fn store(&self, metric: &ReconciledMetric) -> Result<()> {
        let data = serde_json::to_string(metric)?;
        let conn = self.db.lock()?;
        // An invalidation at or after computed_at arrived while loading.
        let invalidated = last_invalidation(&conn, &metric.metric_key)?
            .is_some_and(|at| at >= metric.computed_at);
        if invalidated {
            debug!(metric = %metric.metric_key, "invalidated during load, storing as stale");
        }
        conn.execute(
            "INSERT INTO metric_cache (metric_key, data, computed_at, is_stale, updated_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))
             ON CONFLICT(metric_key) DO UPDATE SET
                data = excluded.data,
                computed_at = excluded.computed_at,
                is_stale = excluded.is_stale,
                updated_at = excluded.updated_at",
            params![
                metric.metric_key,
                data,
                timestamp(metric.computed_at),
                invalidated
            ],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inconsistency log
    // -----------------------------------------------------------------------

    /// Run a reconciliation pass directly, recording its findings. The
    /// metric entries are not touched.
    pub async fn valuation(&self) -> Result<StockValuation> {
        let detected_at = Utc::now();
        let snapshot = self.data.load_stock_snapshot().await?;
        let valuation = reconcile_stock_value(
            &snapshot.stock_items,
            &snapshot.resale_products,
            self.tolerance,
        );
        self.record_inconsistencies(&valuation, detected_at)?;
        Ok(valuation)
    }

    /// Replace the stored findings with those of the latest pass.
    fn record_inconsistencies(
        &self,
        valuation: &StockValuation,
        detected_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM stock_inconsistencies", [])?;
        for finding in &valuation.inconsistencies {
            tx.execute(
                "INSERT INTO stock_inconsistencies
                    (item_id, item_name, stored_total, expected_total, matched_resale, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(item_id) DO UPDATE SET
                    item_name = excluded.item_name,
                    stored_total = excluded.stored_total,
                    expected_total = excluded.expected_total,
                    matched_resale = excluded.matched_resale,
                    detected_at = excluded.detected_at",
                params![
                    finding.item_id,
                    finding.item_name,
                    finding.stored_total,
                    finding.expected_total,
                    finding.matched,
                    timestamp(detected_at),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Findings persisted by the latest reconciliation pass.
    pub fn recent_inconsistencies(&self) -> Result<Vec<Inconsistency>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT item_id, item_name, stored_total, expected_total, matched_resale
             FROM stock_inconsistencies
             ORDER BY item_name, item_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Inconsistency {
                item_id: row.get(0)?,
                item_name: row.get(1)?,
                stored_total: row.get(2)?,
                expected_total: row.get(3)?,
                matched: row.get(4)?,
            })
        })?;
        let findings = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(findings)
    }

    /// Every stored metric entry with its freshness.
    pub fn status(&self) -> Result<Vec<CacheEntryStatus>> {
        let conn = self.db.lock()?;
        let mut entries = Vec::new();
        for metric in Metric::ALL {
            if let Some(entry) = read_entry(&conn, metric)? {
                entries.push(CacheEntryStatus {
                    metric_key: entry.metric.metric_key,
                    value: entry.metric.value,
                    computed_at: entry.metric.computed_at,
                    is_stale: entry.is_stale,
                    is_fresh: entry.is_fresh,
                });
            }
        }
        Ok(entries)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub async fn update_stock_item(
        &self,
        id: &str,
        patch: &StockItemPatch,
    ) -> Result<StockRecord> {
        let record = self.data.update_stock_item(id, patch).await?;
        self.on_change_notification(Collection::StockItems.table_name())?;
        Ok(record)
    }

    pub async fn repair_stock_total(&self, record: &StockRecord) -> Result<StockRecord> {
        let repaired = self.data.repair_stock_total(record).await?;
        self.on_change_notification(Collection::StockItems.table_name())?;
        Ok(repaired)
    }

    pub async fn update_debt(&self, id: &str, patch: &DebtPatch) -> Result<Debt> {
        let debt = self.data.update_debt(id, patch).await?;
        self.on_change_notification(Collection::Debts.table_name())?;
        Ok(debt)
    }

    pub async fn register_debt_payment(&self, debt: &Debt, amount: f64) -> Result<Debt> {
        let updated = self.data.register_debt_payment(debt, amount).await?;
        self.on_change_notification(Collection::Debts.table_name())?;
        Ok(updated)
    }
}

/// A stored `metric_cache` row with its freshness resolved.
struct StoredEntry {
    metric: ReconciledMetric,
    is_stale: bool,
    is_fresh: bool,
}

fn read_entry(conn: &Connection, metric: Metric) -> Result<Option<StoredEntry>> {
    let row = conn
        .query_row(
            "SELECT data, is_stale FROM metric_cache WHERE metric_key = ?1",
            params![metric.key()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
        )
        .optional()?;
    let Some((data, is_stale)) = row else {
        return Ok(None);
    };
    let stored: ReconciledMetric = serde_json::from_str(&data)?;
    let is_fresh = !is_stale && newer_than_mutations(conn, metric, stored.computed_at)?;
    Ok(Some(StoredEntry {
        metric: stored,
        is_stale,
        is_fresh,
    }))
}

fn mark_stale(conn: &Connection, metric: Metric) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE metric_cache SET is_stale = 1, updated_at = datetime('now') WHERE metric_key = ?1",
        params![metric.key()],
    )?;
    Ok(changed > 0)
}

fn last_invalidation(conn: &Connection, metric_key: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT invalidated_at FROM metric_invalidations WHERE metric_key = ?1",
            params![metric_key],
            |row| row.get(0),
        )
        .optional()?;
    raw.as_deref().map(parse_stored_timestamp).transpose()
}

fn last_mutation(conn: &Connection, collection: Collection) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT mutated_at FROM collection_mutations WHERE collection = ?1",
            params![collection.table_name()],
            |row| row.get(0),
        )
        .optional()?;
    raw.as_deref().map(parse_stored_timestamp).transpose()
}

/// `computed_at` must be strictly newer than the last mutation of every
/// dependency collection.
fn newer_than_mutations(
    conn: &Connection,
    metric: Metric,
    computed_at: DateTime<Utc>,
) -> Result<bool> {
    for collection in metric.dependencies() {
        if let Some(mutated_at) = last_mutation(conn, *collection)? {
            if computed_at <= mutated_at {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::testing::{debt_row, resale_row, stock_row, MockBackend};
    use serde_json::json;
    use std::time::Duration;

    const TOTAL: &str = "total_stock_value";
    const DEBT: &str = "outstanding_debt";

    fn cache_over(backend: MockBackend) -> (Arc<MetricCache<MockBackend>>, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let db = Arc::new(db::open_in_memory().expect("in-memory db"));
        let cache = MetricCache::new(DataManager::new(Arc::clone(&backend)), db, 0.01);
        (Arc::new(cache), backend)
    }

    fn shop() -> MockBackend {
        let backend = MockBackend::with_rows(
            vec![
                stock_row("s1", "Pneu A", "product", 5.0, 50.0),
                stock_row("s2", "Pneu B", "product", 10.0, 55.0),
            ],
            vec![
                resale_row("p1", "Pneu A", Some(5.0), Some(50.0)),
                resale_row("p2", "Pneu B", Some(10.0), Some(55.0)),
            ],
        );
        backend.insert_row(Collection::Debts, debt_row("d1", 1000.0, 200.0));
        backend
    }

    #[tokio::test]
    async fn test_get_or_compute_is_idempotent_without_second_read() {
        let (cache, backend) = cache_over(shop());
        let first = cache.get_or_compute(TOTAL).await.unwrap();
        assert_eq!(first.source, MetricSource::Computed);
        assert_eq!(first.value, 800.0);

        let second = cache.get_or_compute(TOTAL).await.unwrap();
        assert_eq!(second.source, MetricSource::Cached);
        assert_eq!(second.value, first.value);
        assert_eq!(second.computed_at, first.computed_at);
        assert_eq!(backend.select_count(Collection::StockItems), 1);
        assert_eq!(backend.select_count(Collection::ResaleProducts), 1);
    }

    #[tokio::test]
    async fn test_failed_recompute_leaves_stored_metric_untouched() {
        let (cache, backend) = cache_over(shop());
        let first = cache.get_or_compute(TOTAL).await.unwrap();
        assert!(cache.invalidate(TOTAL).unwrap());

        backend.set_failing(true);
        let err = cache.get_or_compute(TOTAL).await.unwrap_err();
        assert!(matches!(err, InventoryError::BackendUnavailable(_)));

        let stored = cache.last_known(Metric::TotalStockValue).unwrap().unwrap();
        assert_eq!(stored.value, first.value);
        assert_eq!(stored.computed_at, first.computed_at);
        // Still stale: the failure neither cleared nor refreshed the entry.
        assert_eq!(stored.source, MetricSource::Stale);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_backend_pass() {
        let backend = shop();
        backend.set_latency(Duration::from_millis(100));
        let (cache, backend) = cache_over(backend);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..5 {
            let cache = Arc::clone(&cache);
            tasks.spawn(async move { cache.get_or_compute(TOTAL).await });
        }
        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.unwrap().unwrap());
        }

        assert_eq!(results.len(), 5);
        for r in &results {
            assert_eq!(r.value, 800.0);
            assert_eq!(r.computed_at, results[0].computed_at);
        }
        assert_eq!(backend.select_count(Collection::StockItems), 1);
        assert_eq!(backend.total_selects(), 2);
    }

    #[tokio::test]
    async fn test_recompute_always_reads_backend() {
        let (cache, backend) = cache_over(shop());
        cache.get_or_compute(TOTAL).await.unwrap();
        backend.set_field(Collection::StockItems, "s1", "quantity", json!(6.0));
        let refreshed = cache.recompute(TOTAL).await.unwrap();
        assert_eq!(refreshed.source, MetricSource::Computed);
        assert_eq!(refreshed.value, 850.0);
        assert_eq!(backend.select_count(Collection::StockItems), 2);
    }

    #[tokio::test]
    async fn test_notification_only_invalidates_dependents() {
        let (cache, backend) = cache_over(shop());
        cache.get_or_compute(TOTAL).await.unwrap();
        cache.get_or_compute(DEBT).await.unwrap();

        let affected = cache.on_change_notification("debts").unwrap();
        assert_eq!(affected, vec![Metric::OutstandingDebt]);

        let total = cache.get_or_compute(TOTAL).await.unwrap();
        assert_eq!(total.source, MetricSource::Cached);
        let debt = cache.get_or_compute(DEBT).await.unwrap();
        assert_eq!(debt.source, MetricSource::Computed);
        assert_eq!(debt.value, 800.0);
        assert_eq!(backend.select_count(Collection::StockItems), 1);
        assert_eq!(backend.select_count(Collection::Debts), 2);
    }

    #[tokio::test]
    async fn test_invalidate_then_read_recomputes_once() {
        let (cache, backend) = cache_over(shop());
        cache.get_or_compute(TOTAL).await.unwrap();
        assert!(cache.invalidate(TOTAL).unwrap());
        let recomputed = cache.get_or_compute(TOTAL).await.unwrap();
        assert_eq!(recomputed.source, MetricSource::Computed);
        let again = cache.get_or_compute(TOTAL).await.unwrap();
        assert_eq!(again.source, MetricSource::Cached);
        assert_eq!(backend.select_count(Collection::StockItems), 2);
    }

    #[tokio::test]
    async fn test_invalidate_during_recompute_is_not_lost() {
        let (cache, backend) = cache_over(shop());
        cache.get_or_compute(TOTAL).await.unwrap();
        backend.set_latency(Duration::from_millis(200));

        let pass = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.recompute(TOTAL).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.invalidate(TOTAL).unwrap());

        let finished = pass.await.unwrap().unwrap();
        assert_eq!(finished.source, MetricSource::Computed);
        let stored = cache.last_known(Metric::TotalStockValue).unwrap().unwrap();
        assert_eq!(stored.source, MetricSource::Stale);

        let next = cache.get_or_compute(TOTAL).await.unwrap();
        assert_eq!(next.source, MetricSource::Computed);
        assert!(next.computed_at > finished.computed_at);
        assert_eq!(backend.select_count(Collection::StockItems), 3);
    }

    #[tokio::test]
    async fn test_notification_during_load_leaves_result_stale() {
        let backend = shop();
        backend.set_latency(Duration::from_millis(200));
        let (cache, backend) = cache_over(backend);

        let pass = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_or_compute(TOTAL).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let affected = cache.on_change_notification("stock_items").unwrap();
        assert_eq!(
            affected,
            vec![
                Metric::TotalStockValue,
                Metric::ResaleStockValue,
                Metric::NonResaleStockValue
            ]
        );

        let first = pass.await.unwrap().unwrap();
        assert_eq!(first.source, MetricSource::Computed);
        let next = cache.get_or_compute(TOTAL).await.unwrap();
        assert_eq!(next.source, MetricSource::Computed);
        assert!(next.computed_at > first.computed_at);
        assert_eq!(backend.select_count(Collection::StockItems), 2);
    }

    #[tokio::test]
    async fn test_unparseable_stock_row_fails_instead_of_reading_zero() {
        let mut row = stock_row("s2", "Pneu B", "product", 10.0, 55.0);
        row["quantity"] = json!("10,0");
        let (cache, _) = cache_over(MockBackend::with_rows(vec![row], vec![]));

        let err = cache.get_or_compute(TOTAL).await.unwrap_err();
        assert!(matches!(err, InventoryError::InvalidRecord { .. }));
        assert!(cache.last_known(Metric::TotalStockValue).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_notification_for_unknown_collection_is_ignored() {
        let (cache, _) = cache_over(shop());
        cache.get_or_compute(TOTAL).await.unwrap();
        assert!(cache.on_change_notification("suppliers").unwrap().is_empty());
        let again = cache.get_or_compute(TOTAL).await.unwrap();
        assert_eq!(again.source, MetricSource::Cached);
    }

    #[tokio::test]
    async fn test_notification_is_idempotent() {
        let (cache, backend) = cache_over(shop());
        cache.get_or_compute(TOTAL).await.unwrap();
        cache.on_change_notification("public.stock_items").unwrap();
        cache.on_change_notification("stock_items").unwrap();
        cache.get_or_compute(TOTAL).await.unwrap();
        assert_eq!(backend.select_count(Collection::StockItems), 2);
    }

    #[tokio::test]
    async fn test_invalidate_reports_missing_entry() {
        let (cache, _) = cache_over(shop());
        assert!(!cache.invalidate(TOTAL).unwrap());
        assert!(matches!(
            cache.invalidate("nope"),
            Err(InventoryError::UnknownMetric(_))
        ));
    }

    #[tokio::test]
    async fn test_last_known_value_served_as_stale_on_failure() {
        let (cache, backend) = cache_over(shop());
        let first = cache.get_or_compute(TOTAL).await.unwrap();
        cache.on_change_notification("stock_items").unwrap();
        backend.set_failing(true);

        let shown = cache.get_or_last_known(TOTAL).await.unwrap();
        assert_eq!(shown.source, MetricSource::Stale);
        assert_eq!(shown.value, first.value);
        assert_eq!(shown.computed_at, first.computed_at);

        let err = cache.get_or_last_known(DEBT).await.unwrap_err();
        assert!(matches!(err, InventoryError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_abandoned_leader_releases_waiters() {
        let backend = shop();
        backend.set_latency(Duration::from_millis(300));
        let (cache, _) = cache_over(backend);

        let leader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_or_compute(TOTAL).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_or_compute(TOTAL).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        leader.abort();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, InventoryError::BackendUnavailable(_)));
        assert!(cache.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inconsistencies_are_persisted_and_cleared_by_repair() {
        let mut drifted = stock_row("s9", "Câmara de ar", "product", 10.0, 65.0);
        drifted["total_value"] = json!(600.0);
        let (cache, _) = cache_over(MockBackend::with_rows(vec![drifted], vec![]));

        let total = cache.get_or_compute(TOTAL).await.unwrap();
        assert_eq!(total.value, 650.0);
        let findings = cache.recent_inconsistencies().unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].item_id, "s9");
        assert_eq!(findings[0].stored_total, 600.0);

        let record = cache.data().load_stock_items().await.unwrap().remove(0);
        cache.repair_stock_total(&record).await.unwrap();
        let after = cache.get_or_compute(TOTAL).await.unwrap();
        assert_eq!(after.source, MetricSource::Computed);
        assert!(cache.recent_inconsistencies().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_debt_payment_invalidates_outstanding_debt() {
        let (cache, _) = cache_over(shop());
        assert_eq!(cache.get_or_compute(DEBT).await.unwrap().value, 800.0);
        let debt = cache.data().load_debts().await.unwrap().remove(0);
        cache.register_debt_payment(&debt, 300.0).await.unwrap();
        let after = cache.get_or_compute(DEBT).await.unwrap();
        assert_eq!(after.source, MetricSource::Computed);
        assert_eq!(after.value, 500.0);
    }

    #[tokio::test]
    async fn test_status_reports_freshness() {
        let (cache, _) = cache_over(shop());
        cache.get_or_compute(TOTAL).await.unwrap();
        cache.get_or_compute(DEBT).await.unwrap();
        cache.invalidate(DEBT).unwrap();
        let status = cache.status().unwrap();
        assert_eq!(status.len(), 2);
        let total = status.iter().find(|s| s.metric_key == TOTAL).unwrap();
        assert!(total.is_fresh && !total.is_stale);
        let debt = status.iter().find(|s| s.metric_key == DEBT).unwrap();
        assert!(!debt.is_fresh && debt.is_stale);
    }
}
