//! Typed records loaded from the backend, the patches sent back to it, and
//! the reconciled metric owned by the cache layer.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::Collection;
use crate::error::{InventoryError, Result};
use crate::{try_value_f64, value_id, value_str};

/// Remaining debt at or below this amount counts as settled.
const DEBT_SETTLED_EPSILON: f64 = 0.005;

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Parse the timestamp shapes PostgREST emits (`timestamptz` as RFC 3339,
/// `timestamp` without zone, or a space-separated variant). Zone-less values
/// are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(trimmed).map(|dt| dt.date_naive()))
}

fn required_id(row: &Value, collection: Collection, key: &str) -> Result<String> {
    value_id(row, &[key]).ok_or_else(|| InventoryError::InvalidRecord {
        collection: collection.table_name().to_string(),
        reason: format!("missing {key}"),
    })
}

/// Absent or null numbers are `None`; a present value that does not parse
/// rejects the whole row rather than reading as zero.
fn number(row: &Value, collection: Collection, key: &str) -> Result<Option<f64>> {
    try_value_f64(row, key).map_err(|reason| InventoryError::InvalidRecord {
        collection: collection.table_name().to_string(),
        reason,
    })
}

fn required_str(row: &Value, collection: Collection, key: &str) -> Result<String> {
    value_str(row, &[key]).ok_or_else(|| InventoryError::InvalidRecord {
        collection: collection.table_name().to_string(),
        reason: format!("missing {key}"),
    })
}

// ---------------------------------------------------------------------------
// Stock ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    RawMaterial,
    Product,
    FinalProduct,
}

impl ItemType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "raw_material" => Some(ItemType::RawMaterial),
            "product" => Some(ItemType::Product),
            "final_product" => Some(ItemType::FinalProduct),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::RawMaterial => "raw_material",
            ItemType::Product => "product",
            ItemType::FinalProduct => "final_product",
        }
    }
}

/// One row of the `stock_items` ledger.
///
/// `total_value` is stored independently by the backend and can drift from
/// `quantity * unit_cost`; see [`StockRecord::is_consistent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockRecord {
    pub item_id: String,
    pub item_name: String,
    pub item_type: ItemType,
    pub quantity: f64,
    pub unit_cost: f64,
    pub total_value: f64,
    pub min_level: Option<f64>,
    pub max_level: Option<f64>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl StockRecord {
    pub fn from_row(row: &Value) -> Result<Self> {
        let collection = Collection::StockItems;
        let item_id = required_id(row, collection, "item_id")?;
        let item_name = required_str(row, collection, "item_name")?;
        let raw_type = value_str(row, &["item_type"]).unwrap_or_default();
        let item_type = ItemType::parse(&raw_type).ok_or_else(|| InventoryError::InvalidRecord {
            collection: collection.table_name().to_string(),
            reason: format!("item {item_id} has unknown item_type '{raw_type}'"),
        })?;
        let quantity = number(row, collection, "quantity")?.unwrap_or(0.0);
        let unit_cost = number(row, collection, "unit_cost")?.unwrap_or(0.0);
        let total_value = number(row, collection, "total_value")?.unwrap_or(quantity * unit_cost);

        Ok(Self {
            item_id,
            item_name,
            item_type,
            quantity,
            unit_cost,
            total_value,
            min_level: number(row, collection, "min_level")?,
            max_level: number(row, collection, "max_level")?,
            last_updated: value_str(row, &["last_updated"]).and_then(|s| parse_timestamp(&s)),
        })
    }

    /// `quantity * unit_cost`, the value the ledger row should carry.
    pub fn expected_value(&self) -> f64 {
        self.quantity * self.unit_cost
    }

    pub fn is_consistent(&self, tolerance: f64) -> bool {
        (self.total_value - self.expected_value()).abs() <= tolerance
    }
}

/// Partial update for a `stock_items` row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StockItemPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_level: Option<f64>,
}

impl StockItemPatch {
    pub fn is_empty(&self) -> bool {
        self.quantity.is_none()
            && self.unit_cost.is_none()
            && self.total_value.is_none()
            && self.min_level.is_none()
            && self.max_level.is_none()
    }

    /// Serialize for the wire, stamping `last_updated`.
    pub fn to_wire(&self, now: DateTime<Utc>) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(ref mut map) = value {
            map.insert("last_updated".into(), Value::String(now.to_rfc3339()));
        }
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Resale catalog
// ---------------------------------------------------------------------------

/// One row of the `resale_products` catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResaleProduct {
    pub id: String,
    pub name: String,
    pub current_stock: Option<f64>,
    pub purchase_price: Option<f64>,
    pub unit: Option<String>,
}

impl ResaleProduct {
    pub fn from_row(row: &Value) -> Result<Self> {
        let collection = Collection::ResaleProducts;
        Ok(Self {
            id: required_id(row, collection, "id")?,
            name: required_str(row, collection, "name")?,
            current_stock: number(row, collection, "current_stock")?,
            purchase_price: number(row, collection, "purchase_price")?,
            unit: value_str(row, &["unit"]),
        })
    }

    /// Catalog stock, 0 when absent.
    pub fn stock(&self) -> f64 {
        self.current_stock.unwrap_or(0.0)
    }

    /// Catalog purchase price, 0 when absent.
    pub fn price(&self) -> f64 {
        self.purchase_price.unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// Debts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebtStatus {
    Pending,
    Partial,
    Paid,
    Overdue,
}

impl DebtStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "paid" | "settled" => DebtStatus::Paid,
            "partial" | "partially_paid" => DebtStatus::Partial,
            "overdue" | "late" => DebtStatus::Overdue,
            _ => DebtStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DebtStatus::Pending => "pending",
            DebtStatus::Partial => "partial",
            DebtStatus::Paid => "paid",
            DebtStatus::Overdue => "overdue",
        }
    }
}

/// One row of the `debts` collection. Paid and remaining amounts are
/// maintained by direct update, never derived on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Debt {
    pub id: String,
    pub description: String,
    pub total_amount: f64,
    pub paid_amount: f64,
    pub remaining_amount: f64,
    pub due_date: Option<NaiveDate>,
    pub status: DebtStatus,
    pub category: Option<String>,
    pub creditor: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Debt {
    pub fn from_row(row: &Value) -> Result<Self> {
        let collection = Collection::Debts;
        let total_amount = number(row, collection, "total_amount")?.unwrap_or(0.0);
        let paid_amount = number(row, collection, "paid_amount")?.unwrap_or(0.0);
        Ok(Self {
            id: required_id(row, collection, "id")?,
            description: value_str(row, &["description"]).unwrap_or_default(),
            total_amount,
            paid_amount,
            remaining_amount: number(row, collection, "remaining_amount")?
                .unwrap_or(total_amount - paid_amount),
            due_date: value_str(row, &["due_date"]).and_then(|s| parse_date(&s)),
            status: DebtStatus::parse(&value_str(row, &["status"]).unwrap_or_default()),
            category: value_str(row, &["category"]),
            creditor: value_str(row, &["creditor"]),
            created_at: value_str(row, &["created_at"]).and_then(|s| parse_timestamp(&s)),
            updated_at: value_str(row, &["updated_at"]).and_then(|s| parse_timestamp(&s)),
        })
    }

    pub fn is_settled(&self) -> bool {
        self.status == DebtStatus::Paid
    }

    /// Build the direct-update patch that records a payment of `amount`.
    pub fn payment_patch(&self, amount: f64) -> Result<DebtPatch> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(InventoryError::InvalidInput(format!(
                "payment amount must be positive, got {amount}"
            )));
        }
        let paid_amount = self.paid_amount + amount;
        let remaining_amount = self.total_amount - paid_amount;
        let status = if remaining_amount <= DEBT_SETTLED_EPSILON {
            DebtStatus::Paid
        } else {
            DebtStatus::Partial
        };
        Ok(DebtPatch {
            paid_amount: Some(paid_amount),
            remaining_amount: Some(remaining_amount.max(0.0)),
            status: Some(status),
            due_date: None,
        })
    }
}

/// Partial update for a `debts` row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DebtPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DebtStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
}

impl DebtPatch {
    pub fn to_wire(&self, now: DateTime<Utc>) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(ref mut map) = value {
            map.insert("updated_at".into(), Value::String(now.to_rfc3339()));
        }
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Reconciled metric
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSource {
    /// Freshly computed by this call (or the in-flight call it joined).
    Computed,
    /// Served from the cache without touching the backend.
    Cached,
    /// Last known good value whose sources have changed or could not be read.
    Stale,
}

/// A metric value owned by the cache layer. Replaced whole on every
/// recomputation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledMetric {
    pub metric_key: String,
    pub value: f64,
    pub computed_at: DateTime<Utc>,
    pub source: MetricSource,
}

impl ReconciledMetric {
    pub fn with_source(mut self, source: MetricSource) -> Self {
        self.source = source;
        self
    }
}
