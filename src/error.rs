//! Error taxonomy shared by the data access, reconciliation and cache layers.

use thiserror::Error;

/// Errors surfaced by the inventory core.
///
/// Variants are `Clone` so a single recomputation result can be broadcast to
/// every caller waiting on the same in-flight metric.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InventoryError {
    /// Network or service failure talking to the hosted backend. Retryable by
    /// the caller; never retried inside the core.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A referenced record is absent (e.g. a PATCH matched no row).
    #[error("{collection} record not found: {id}")]
    NotFound { collection: String, id: String },

    /// A ledger row whose stored total disagrees with quantity x unit cost.
    #[error("Data inconsistency for {item}: stored total {stored:.2}, quantity x unit cost {expected:.2}")]
    DataInconsistency {
        item: String,
        stored: f64,
        expected: f64,
    },

    /// A backend row that could not be parsed into its typed record.
    #[error("Invalid {collection} record: {reason}")]
    InvalidRecord { collection: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    /// Local SQLite cache or serialization failure.
    #[error("Local cache error: {0}")]
    Cache(String),

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, InventoryError>;

impl InventoryError {
    /// Whether the caller may reasonably retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, InventoryError::BackendUnavailable(_))
    }
}

impl From<rusqlite::Error> for InventoryError {
    fn from(err: rusqlite::Error) -> Self {
        InventoryError::Cache(err.to_string())
    }
}

impl From<serde_json::Error> for InventoryError {
    fn from(err: serde_json::Error) -> Self {
        InventoryError::Cache(format!("serialization: {err}"))
    }
}
