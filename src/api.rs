//! Hosted backend REST client.
//!
//! Talks PostgREST (`/rest/v1/{table}`) with the project's anon key. Used for
//! connectivity testing, collection loads and partial row updates.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backend::{BackendClient, Collection};
use crate::error::{InventoryError, Result};

/// Default timeout for API requests (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity test.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend project URL:
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_backend_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }

    // Strip trailing slashes again (in case "/rest/v1/" was present)
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

/// Decode a connection string: either raw JSON or (url-safe) base64 of JSON
/// shaped `{ "url": ..., "key": ... }`.
fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

pub fn extract_anon_key_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("key")
                .or_else(|| v.get("anonKey"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_url_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("url")
                .and_then(Value::as_str)
                .map(normalize_backend_url)
        })
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach backend at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid backend URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Anon key is invalid or expired".to_string(),
        403 => "Access to collection denied by row-level security".to_string(),
        404 => "Backend collection not found".to_string(),
        s if s >= 500 => format!("Backend server error (HTTP {s})"),
        s => format!("Unexpected response from backend (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// Connectivity test
// ---------------------------------------------------------------------------

/// Result of a connectivity test.
#[derive(Debug, serde::Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// PostgREST client
// ---------------------------------------------------------------------------

/// PostgREST client for one hosted project.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    anon_key: String,
    http: Client,
}

impl SupabaseClient {
    pub fn new(url: &str, anon_key: &str, timeout: Duration) -> Result<Self> {
        let base_url = normalize_backend_url(url);
        if base_url.is_empty() {
            return Err(InventoryError::Config("backend URL is empty".into()));
        }
        let anon_key = anon_key.trim().to_string();
        if anon_key.is_empty() {
            return Err(InventoryError::Config("anon key is empty".into()));
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InventoryError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url,
            anon_key,
            http,
        })
    }

    pub fn from_config(config: &crate::config::InventoryConfig) -> Result<Self> {
        Self::new(
            &config.backend_url,
            &config.anon_key,
            config.request_timeout,
        )
    }

    /// `{base}/rest/v1/{table}` with the given query pairs.
    fn table_url(&self, table: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/rest/v1/{table}", self.base_url))
            .map_err(|e| InventoryError::Config(format!("Invalid backend URL: {e}")))?;
        {
            let mut qp = url.query_pairs_mut();
            for (k, v) in query {
                qp.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.anon_key))
            .header("Content-Type", "application/json")
    }

    /// Send a request and parse the JSON body, mapping transport and status
    /// failures to `BackendUnavailable`.
    async fn send(&self, req: RequestBuilder) -> Result<Value> {
        let resp = req
            .send()
            .await
            .map_err(|e| InventoryError::BackendUnavailable(friendly_error(&self.base_url, &e)))?;
        let status = resp.status();

        if !status.is_success() {
            // Preserve PostgREST error details for diagnostics.
            let body_text = resp.text().await.unwrap_or_default();
            let detail = match serde_json::from_str::<Value>(&body_text) {
                Ok(json) => json
                    .get("message")
                    .or_else(|| json.get("error"))
                    .and_then(Value::as_str)
                    .map(|m| format!("{} (HTTP {}): {m}", status_error(status), status.as_u16()))
                    .unwrap_or_else(|| format!("{} (HTTP {})", status_error(status), status.as_u16())),
                Err(_) if !body_text.trim().is_empty() => format!(
                    "{} (HTTP {}): {}",
                    status_error(status),
                    status.as_u16(),
                    body_text.trim()
                ),
                Err(_) => format!("{} (HTTP {})", status_error(status), status.as_u16()),
            };
            return Err(InventoryError::BackendUnavailable(detail));
        }

        // Return the JSON body, or null for empty 204 responses.
        let body_text = resp
            .text()
            .await
            .map_err(|e| InventoryError::BackendUnavailable(friendly_error(&self.base_url, &e)))?;
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| {
            InventoryError::BackendUnavailable(format!("Invalid JSON from backend: {e}"))
        })
    }

    /// Lightweight health check against the REST root.
    pub async fn test_connectivity(&self) -> ConnectivityResult {
        let url = format!("{}/rest/v1/", self.base_url);
        let start = Instant::now();

        let resp = match self
            .authorize(self.http.get(&url))
            .timeout(CONNECTIVITY_TIMEOUT)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some(friendly_error(&self.base_url, &e)),
                };
            }
        };

        let latency = start.elapsed().as_millis() as u64;
        let status = resp.status();

        if status.is_success() {
            info!(latency_ms = latency, "connectivity test passed");
            ConnectivityResult {
                success: true,
                latency_ms: Some(latency),
                error: None,
            }
        } else {
            ConnectivityResult {
                success: false,
                latency_ms: Some(latency),
                error: Some(status_error(status)),
            }
        }
    }
}

#[async_trait]
impl BackendClient for SupabaseClient {
    async fn select(&self, collection: Collection) -> Result<Vec<Value>> {
        let url = self.table_url(
            collection.table_name(),
            &[
                ("select", "*".to_string()),
                ("order", collection.default_order().to_string()),
            ],
        )?;
        let started = Instant::now();
        let body = self.send(self.authorize(self.http.get(url))).await?;
        match body {
            Value::Array(rows) => {
                debug!(
                    collection = %collection,
                    rows = rows.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "backend select"
                );
                Ok(rows)
            }
            Value::Null => Ok(Vec::new()),
            other => {
                warn!(collection = %collection, "backend select returned a non-array body");
                Err(InventoryError::BackendUnavailable(format!(
                    "Expected an array from {collection}, got {}",
                    json_kind(&other)
                )))
            }
        }
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: &Value,
    ) -> Result<Option<Value>> {
        let url = self.table_url(
            collection.table_name(),
            &[(collection.key_column(), format!("eq.{id}"))],
        )?;
        let req = self
            .authorize(self.http.patch(url))
            .header("Prefer", "return=representation")
            .json(patch);
        let body = self.send(req).await?;
        debug!(collection = %collection, id, "backend update");
        Ok(match body {
            Value::Array(mut rows) => {
                if rows.is_empty() {
                    None
                } else {
                    Some(rows.swap_remove(0))
                }
            }
            Value::Object(_) => Some(body),
            _ => None,
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
