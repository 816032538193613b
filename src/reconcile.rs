//! Stock value reconciliation.
//!
//! Merges the stock ledger (`stock_items`) and the resale-product catalog
//! (`resale_products`) into one canonical inventory value. The two sources
//! overlap and routinely disagree, so the precedence is fixed:
//!
//! - a matching ledger row's `quantity` always wins over the catalog's
//!   `current_stock`;
//! - a positive catalog `purchase_price` wins over the ledger's `unit_cost`,
//!   which is only a fallback when the catalog price is zero or absent;
//! - ledger rows no resale product claims are valued at
//!   `quantity * unit_cost` as-is.
//!
//! Negative quantities and prices are passed through unclamped. Clamping
//! would hide real inventory errors that the inconsistency findings are meant
//! to surface.

use serde::Serialize;
use std::collections::HashSet;

use crate::error::{InventoryError, Result};
use crate::models::{ResaleProduct, StockRecord};

/// Default tolerance for `total_value` vs `quantity * unit_cost`.
pub const DEFAULT_CONSISTENCY_TOLERANCE: f64 = 0.01;

/// Which source supplied the stock figure of a resale line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantitySource {
    Ledger,
    Catalog,
}

/// Which source supplied the unit price of a resale line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Catalog,
    Ledger,
    /// Neither source had a usable price; the line is valued at zero.
    Missing,
}

/// Valuation of one resale product after applying the precedence rules.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResaleLine {
    pub product_id: String,
    pub product_name: String,
    pub matched_item_id: Option<String>,
    pub stock: f64,
    pub price: f64,
    pub value: f64,
    pub quantity_source: QuantitySource,
    pub price_source: PriceSource,
}

/// A ledger row whose stored total disagrees with `quantity * unit_cost`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inconsistency {
    pub item_id: String,
    pub item_name: String,
    pub stored_total: f64,
    pub expected_total: f64,
    /// Whether a resale product was matched to this row.
    pub matched: bool,
}

impl Inconsistency {
    pub fn difference(&self) -> f64 {
        self.stored_total - self.expected_total
    }
}

impl From<&Inconsistency> for InventoryError {
    fn from(finding: &Inconsistency) -> Self {
        InventoryError::DataInconsistency {
            item: format!("{} ({})", finding.item_name, finding.item_id),
            stored: finding.stored_total,
            expected: finding.expected_total,
        }
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StockValuation {
    pub resale_lines: Vec<ResaleLine>,
    pub resale_total: f64,
    pub non_resale_total: f64,
    pub total: f64,
    pub matched_item_ids: Vec<String>,
    pub inconsistencies: Vec<Inconsistency>,
}

impl StockValuation {
    /// Fail with the first inconsistency, for callers that must not proceed
    /// on drifted ledger data.
    pub fn ensure_consistent(&self) -> Result<()> {
        match self.inconsistencies.first() {
            Some(finding) => Err(finding.into()),
            None => Ok(()),
        }
    }
}

/// First ledger row (in load order) matching the product by name or id.
fn find_match<'a>(
    stock: &'a [StockRecord],
    product: &ResaleProduct,
) -> Option<(usize, &'a StockRecord)> {
    stock
        .iter()
        .enumerate()
        .find(|(_, s)| s.item_name == product.name || s.item_id == product.id)
}

/// Value one resale product against the ledger.
fn value_resale_product(product: &ResaleProduct, matched: Option<&StockRecord>) -> ResaleLine {
    let catalog_stock = product.stock();
    let catalog_price = product.price();

    let (stock, quantity_source) = match matched {
        Some(s) => (s.quantity, QuantitySource::Ledger),
        None => (catalog_stock, QuantitySource::Catalog),
    };

    let (price, price_source) = if catalog_price > 0.0 {
        (catalog_price, PriceSource::Catalog)
    } else {
        match matched {
            Some(s) => (s.unit_cost, PriceSource::Ledger),
            None => (0.0, PriceSource::Missing),
        }
    };

    ResaleLine {
        product_id: product.id.clone(),
        product_name: product.name.clone(),
        matched_item_id: matched.map(|s| s.item_id.clone()),
        stock,
        price,
        value: stock * price,
        quantity_source,
        price_source,
    }
}

/// Compute the canonical stock value from a snapshot of both sources.
///
/// Pure: the same inputs always produce the same valuation.
pub fn reconcile_stock_value(
    stock: &[StockRecord],
    resale: &[ResaleProduct],
    tolerance: f64,
) -> StockValuation {
    let mut matched_rows: HashSet<usize> = HashSet::new();
    let mut resale_lines = Vec::with_capacity(resale.len());
    let mut resale_total = 0.0;

    for product in resale {
        let matched = find_match(stock, product);
        if let Some((index, _)) = matched {
            matched_rows.insert(index);
        }
        let line = value_resale_product(product, matched.map(|(_, s)| s));
        resale_total += line.value;
        resale_lines.push(line);
    }

    let mut non_resale_total = 0.0;
    let mut inconsistencies = Vec::new();
    let mut matched_item_ids = Vec::with_capacity(matched_rows.len());

    for (index, record) in stock.iter().enumerate() {
        let matched = matched_rows.contains(&index);
        if matched {
            matched_item_ids.push(record.item_id.clone());
        } else {
            non_resale_total += record.expected_value();
        }
        if !record.is_consistent(tolerance) {
            inconsistencies.push(Inconsistency {
                item_id: record.item_id.clone(),
                item_name: record.item_name.clone(),
                stored_total: record.total_value,
                expected_total: record.expected_value(),
                matched,
            });
        }
    }

    StockValuation {
        resale_lines,
        resale_total,
        non_resale_total,
        total: non_resale_total + resale_total,
        matched_item_ids,
        inconsistencies,
    }
}
