//! Backend client seam.
//!
//! The hosted backend is a black box exposing named collections. Everything
//! above this module talks to it through [`BackendClient`], which keeps the
//! data access layer testable against an in-memory backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Collections consumed from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    StockItems,
    ResaleProducts,
    Debts,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::StockItems,
        Collection::ResaleProducts,
        Collection::Debts,
    ];

    /// Table name on the backend.
    pub fn table_name(&self) -> &'static str {
        match self {
            Collection::StockItems => "stock_items",
            Collection::ResaleProducts => "resale_products",
            Collection::Debts => "debts",
        }
    }

    /// Column used to address a single row in updates.
    pub fn key_column(&self) -> &'static str {
        match self {
            Collection::StockItems => "item_id",
            Collection::ResaleProducts | Collection::Debts => "id",
        }
    }

    /// PostgREST `order` clause giving a stable load order within a session.
    pub fn default_order(&self) -> &'static str {
        match self {
            Collection::StockItems => "item_name.asc,item_id.asc",
            Collection::ResaleProducts => "name.asc,id.asc",
            Collection::Debts => "due_date.asc.nullslast,id.asc",
        }
    }

    /// Resolve a collection from its table name. Accepts schema-qualified
    /// names (`public.stock_items`) as sent by realtime payloads.
    pub fn parse(name: &str) -> Option<Self> {
        let trimmed = name.trim();
        let bare = trimmed.rsplit('.').next().unwrap_or(trimmed);
        let bare = bare.to_ascii_lowercase();
        Collection::ALL
            .into_iter()
            .find(|c| c.table_name() == bare)
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Record read/update operations against named collections.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Load every row of `collection` in its default order.
    async fn select(&self, collection: Collection) -> Result<Vec<Value>>;

    /// Apply a partial update to the row whose key column equals `id`.
    /// Returns `Ok(None)` when no row matched.
    async fn update(&self, collection: Collection, id: &str, patch: &Value)
        -> Result<Option<Value>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_schema_qualified_names() {
        assert_eq!(
            Collection::parse("public.stock_items"),
            Some(Collection::StockItems)
        );
        assert_eq!(
            Collection::parse(" Resale_Products "),
            Some(Collection::ResaleProducts)
        );
        assert_eq!(Collection::parse("debts"), Some(Collection::Debts));
        assert_eq!(Collection::parse("orders"), None);
    }

    #[test]
    fn test_table_names_round_trip_through_parse() {
        for collection in Collection::ALL {
            assert_eq!(Collection::parse(collection.table_name()), Some(collection));
        }
    }
}
