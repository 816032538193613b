//! In-memory backend used by unit tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::{BackendClient, Collection};
use crate::error::{InventoryError, Result};

/// Backend double with per-collection rows, call counters, failure
/// injection and optional latency.
#[derive(Default)]
pub struct MockBackend {
    rows: Mutex<HashMap<Collection, Vec<Value>>>,
    selects: Mutex<HashMap<Collection, usize>>,
    updates: AtomicUsize,
    failing: AtomicBool,
    latency_ms: AtomicUsize,
}

impl MockBackend {
    pub fn with_rows(stock_items: Vec<Value>, resale_products: Vec<Value>) -> Self {
        let backend = Self::default();
        {
            let mut rows = backend.rows.lock().unwrap();
            rows.insert(Collection::StockItems, stock_items);
            rows.insert(Collection::ResaleProducts, resale_products);
        }
        backend
    }

    pub fn insert_row(&self, collection: Collection, row: Value) {
        self.rows
            .lock()
            .unwrap()
            .entry(collection)
            .or_default()
            .push(row);
    }

    /// Overwrite a field of the row whose key column equals `id`, bypassing
    /// the update counter (simulates an external writer).
    pub fn set_field(&self, collection: Collection, id: &str, field: &str, value: Value) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows
            .get_mut(&collection)
            .and_then(|rows| rows.iter_mut().find(|r| row_key(r, collection) == id))
        {
            row[field] = value;
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn select_count(&self, collection: Collection) -> usize {
        self.selects
            .lock()
            .unwrap()
            .get(&collection)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_selects(&self) -> usize {
        self.selects.lock().unwrap().values().sum()
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        }
    }

    fn check_failing(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(InventoryError::BackendUnavailable(
                "Cannot reach backend at http://mock".into(),
            ));
        }
        Ok(())
    }
}

fn row_key(row: &Value, collection: Collection) -> String {
    match row.get(collection.key_column()) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl BackendClient for MockBackend {
    async fn select(&self, collection: Collection) -> Result<Vec<Value>> {
        *self.selects.lock().unwrap().entry(collection).or_insert(0) += 1;
        self.simulate_latency().await;
        self.check_failing()?;
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: &Value,
    ) -> Result<Option<Value>> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_failing()?;
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows
            .get_mut(&collection)
            .and_then(|rows| rows.iter_mut().find(|r| row_key(r, collection) == id))
        else {
            return Ok(None);
        };
        if let (Value::Object(target), Value::Object(fields)) = (row, patch) {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
            return Ok(Some(Value::Object(target.clone())));
        }
        Ok(None)
    }
}

pub fn stock_row(id: &str, name: &str, item_type: &str, quantity: f64, unit_cost: f64) -> Value {
    json!({
        "item_id": id,
        "item_name": name,
        "item_type": item_type,
        "quantity": quantity,
        "unit_cost": unit_cost,
        "total_value": quantity * unit_cost,
        "min_level": null,
        "max_level": null,
        "last_updated": "2024-03-01T10:00:00+00:00"
    })
}

pub fn resale_row(id: &str, name: &str, stock: Option<f64>, price: Option<f64>) -> Value {
    json!({
        "id": id,
        "name": name,
        "current_stock": stock,
        "purchase_price": price,
        "unit": "un"
    })
}

pub fn debt_row(id: &str, total: f64, paid: f64) -> Value {
    json!({
        "id": id,
        "description": format!("Debt {id}"),
        "total_amount": total,
        "paid_amount": paid,
        "remaining_amount": total - paid,
        "due_date": "2024-06-30",
        "status": if paid > 0.0 { "partial" } else { "pending" },
        "category": "fornecedor",
        "creditor": "Distribuidora Sul",
        "created_at": "2024-01-10T09:00:00+00:00",
        "updated_at": null
    })
}
