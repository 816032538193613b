//! Dashboard metric registry: stable keys, dependency sets and how each
//! metric is computed from a fresh backend read.

use serde::Serialize;
use tracing::warn;

use crate::backend::{BackendClient, Collection};
use crate::data_manager::DataManager;
use crate::error::{InventoryError, Result};
use crate::reconcile::{reconcile_stock_value, StockValuation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Non-resale ledger value plus reconciled resale value.
    TotalStockValue,
    ResaleStockValue,
    NonResaleStockValue,
    /// Sum of `remaining_amount` over debts that are not paid.
    OutstandingDebt,
}

const STOCK_SOURCES: &[Collection] = &[Collection::StockItems, Collection::ResaleProducts];
const DEBT_SOURCES: &[Collection] = &[Collection::Debts];

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::TotalStockValue,
        Metric::ResaleStockValue,
        Metric::NonResaleStockValue,
        Metric::OutstandingDebt,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Metric::TotalStockValue => "total_stock_value",
            Metric::ResaleStockValue => "resale_stock_value",
            Metric::NonResaleStockValue => "non_resale_stock_value",
            Metric::OutstandingDebt => "outstanding_debt",
        }
    }

    pub fn from_key(key: &str) -> Result<Self> {
        Metric::ALL
            .into_iter()
            .find(|m| m.key() == key.trim())
            .ok_or_else(|| InventoryError::UnknownMetric(key.to_string()))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Metric::TotalStockValue => "Total stock value",
            Metric::ResaleStockValue => "Resale stock value",
            Metric::NonResaleStockValue => "Raw material & product value",
            Metric::OutstandingDebt => "Outstanding debt",
        }
    }

    /// Collections whose changes make this metric stale.
    pub fn dependencies(&self) -> &'static [Collection] {
        match self {
            Metric::TotalStockValue | Metric::ResaleStockValue | Metric::NonResaleStockValue => {
                STOCK_SOURCES
            }
            Metric::OutstandingDebt => DEBT_SOURCES,
        }
    }

    pub fn depends_on(&self, collection: Collection) -> bool {
        self.dependencies().contains(&collection)
    }

    /// This metric's share of a stock valuation; `None` for metrics that are
    /// not derived from one.
    pub fn stock_share(&self, valuation: &StockValuation) -> Option<f64> {
        match self {
            Metric::TotalStockValue => Some(valuation.total),
            Metric::ResaleStockValue => Some(valuation.resale_total),
            Metric::NonResaleStockValue => Some(valuation.non_resale_total),
            Metric::OutstandingDebt => None,
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Outcome of computing one metric from the backend.
#[derive(Debug, Clone)]
pub struct MetricComputation {
    pub value: f64,
    /// Present for stock metrics; carries the inconsistency findings.
    pub valuation: Option<StockValuation>,
}

/// Compute `metric` from a fresh read of its dependencies.
pub async fn compute<B: BackendClient>(
    metric: Metric,
    data: &DataManager<B>,
    tolerance: f64,
) -> Result<MetricComputation> {
    match metric {
        Metric::TotalStockValue | Metric::ResaleStockValue | Metric::NonResaleStockValue => {
            let snapshot = data.load_stock_snapshot().await?;
            let valuation = reconcile_stock_value(
                &snapshot.stock_items,
                &snapshot.resale_products,
                tolerance,
            );
            for finding in &valuation.inconsistencies {
                warn!(
                    item_id = %finding.item_id,
                    item = %finding.item_name,
                    stored = finding.stored_total,
                    expected = finding.expected_total,
                    matched_resale = finding.matched,
                    "stock ledger total disagrees with quantity x unit cost"
                );
            }
            let value = metric.stock_share(&valuation).ok_or_else(|| {
                InventoryError::UnknownMetric(format!("{metric} is not a stock metric"))
            })?;
            Ok(MetricComputation {
                value,
                valuation: Some(valuation),
            })
        }
        Metric::OutstandingDebt => {
            let debts = data.load_debts().await?;
            let value = debts
                .iter()
                .filter(|d| !d.is_settled())
                .map(|d| d.remaining_amount)
                .sum();
            Ok(MetricComputation {
                value,
                valuation: None,
            })
        }
    }
}
