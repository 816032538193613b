//! Data access layer.
//!
//! Loads raw backend rows and turns them into typed records. No caching is
//! done here: every call reflects current backend state. A row that cannot
//! be parsed fails the whole load, since dropping it would quietly
//! understate any total computed from the result.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{BackendClient, Collection};
use crate::error::{InventoryError, Result};
use crate::models::{Debt, DebtPatch, ResaleProduct, StockItemPatch, StockRecord};

/// Both reconciliation sources, loaded back to back.
#[derive(Debug, Clone, PartialEq)]
pub struct StockSnapshot {
    pub stock_items: Vec<StockRecord>,
    pub resale_products: Vec<ResaleProduct>,
}

pub struct DataManager<B: BackendClient> {
    backend: Arc<B>,
}

impl<B: BackendClient> Clone for DataManager<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

fn parse_rows<T>(
    collection: Collection,
    rows: &[Value],
    parse: impl Fn(&Value) -> Result<T>,
) -> Result<Vec<T>> {
    rows.iter()
        .enumerate()
        .map(|(index, row)| {
            parse(row).map_err(|e| {
                warn!(collection = %collection, index, error = %e, "rejecting unparseable row");
                e
            })
        })
        .collect()
}

impl<B: BackendClient> DataManager<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Load the stock ledger in the backend's stable order.
    pub async fn load_stock_items(&self) -> Result<Vec<StockRecord>> {
        let rows = self.backend.select(Collection::StockItems).await?;
        let items = parse_rows(Collection::StockItems, &rows, StockRecord::from_row)?;
        debug!(count = items.len(), "loaded stock items");
        Ok(items)
    }

    /// Load the resale-product catalog.
    pub async fn load_resale_products(&self) -> Result<Vec<ResaleProduct>> {
        let rows = self.backend.select(Collection::ResaleProducts).await?;
        let products = parse_rows(Collection::ResaleProducts, &rows, ResaleProduct::from_row)?;
        debug!(count = products.len(), "loaded resale products");
        Ok(products)
    }

    /// Load both reconciliation sources behind a join barrier. Either failure
    /// fails the snapshot; no partial snapshot is ever returned.
    pub async fn load_stock_snapshot(&self) -> Result<StockSnapshot> {
        let (stock_items, resale_products) =
            tokio::try_join!(self.load_stock_items(), self.load_resale_products())?;
        Ok(StockSnapshot {
            stock_items,
            resale_products,
        })
    }

    pub async fn load_debts(&self) -> Result<Vec<Debt>> {
        let rows = self.backend.select(Collection::Debts).await?;
        let debts = parse_rows(Collection::Debts, &rows, Debt::from_row)?;
        debug!(count = debts.len(), "loaded debts");
        Ok(debts)
    }

    /// Apply a partial update to a ledger row and return the updated record.
    pub async fn update_stock_item(
        &self,
        id: &str,
        patch: &StockItemPatch,
    ) -> Result<StockRecord> {
        if patch.is_empty() {
            return Err(InventoryError::InvalidInput(
                "stock item patch has no fields".into(),
            ));
        }
        let wire = patch.to_wire(Utc::now())?;
        let row = self
            .backend
            .update(Collection::StockItems, id, &wire)
            .await?
            .ok_or_else(|| not_found(Collection::StockItems, id))?;
        let record = StockRecord::from_row(&row)?;
        info!(item_id = %record.item_id, item = %record.item_name, "stock item updated");
        Ok(record)
    }

    /// Rewrite a drifted `total_value` to `quantity * unit_cost`.
    pub async fn repair_stock_total(&self, record: &StockRecord) -> Result<StockRecord> {
        let expected = record.expected_value();
        info!(
            item_id = %record.item_id,
            stored = record.total_value,
            expected,
            "repairing stock total"
        );
        let patch = StockItemPatch {
            total_value: Some(expected),
            ..Default::default()
        };
        self.update_stock_item(&record.item_id, &patch).await
    }

    pub async fn update_debt(&self, id: &str, patch: &DebtPatch) -> Result<Debt> {
        let wire = patch.to_wire(Utc::now())?;
        let row = self
            .backend
            .update(Collection::Debts, id, &wire)
            .await?
            .ok_or_else(|| not_found(Collection::Debts, id))?;
        let debt = Debt::from_row(&row)?;
        info!(
            debt_id = %debt.id,
            remaining = debt.remaining_amount,
            status = debt.status.as_str(),
            "debt updated"
        );
        Ok(debt)
    }

    /// Record a payment against `debt` by direct update of its paid and
    /// remaining amounts.
    pub async fn register_debt_payment(&self, debt: &Debt, amount: f64) -> Result<Debt> {
        let patch = debt.payment_patch(amount)?;
        self.update_debt(&debt.id, &patch).await
    }
}

fn not_found(collection: Collection, id: &str) -> InventoryError {
    InventoryError::NotFound {
        collection: collection.table_name().to_string(),
        id: id.to_string(),
    }
}
