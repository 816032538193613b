//! Runtime configuration.
//!
//! Resolution order per field: environment variable, then the OS keyring
//! (see [`crate::storage`]), then the connection string. Tunables fall back
//! to defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::api;
use crate::display::Locale;
use crate::error::{InventoryError, Result};
use crate::reconcile::DEFAULT_CONSISTENCY_TOLERANCE;
use crate::storage;

pub const ENV_SUPABASE_URL: &str = "SMALL_INVENTORY_SUPABASE_URL";
pub const ENV_SUPABASE_ANON_KEY: &str = "SMALL_INVENTORY_SUPABASE_ANON_KEY";
pub const ENV_CONNECTION_STRING: &str = "SMALL_INVENTORY_CONNECTION_STRING";
pub const ENV_DATA_DIR: &str = "SMALL_INVENTORY_DATA_DIR";
pub const ENV_LOCALE: &str = "SMALL_INVENTORY_LOCALE";
pub const ENV_REFRESH_SECS: &str = "SMALL_INVENTORY_REFRESH_SECS";
pub const ENV_TIMEOUT_SECS: &str = "SMALL_INVENTORY_TIMEOUT_SECS";
pub const ENV_TOLERANCE: &str = "SMALL_INVENTORY_TOLERANCE";

const DEFAULT_REFRESH_SECS: u64 = 60;
const MIN_REFRESH_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct InventoryConfig {
    pub backend_url: String,
    pub anon_key: String,
    pub data_dir: PathBuf,
    pub locale: Locale,
    pub refresh_interval: Duration,
    pub request_timeout: Duration,
    pub consistency_tolerance: f64,
}

impl InventoryConfig {
    /// Resolve from the process environment and the OS keyring.
    pub fn resolve() -> Result<Self> {
        Self::from_sources(
            |name| std::env::var(name).ok(),
            storage::get_credential,
        )
    }

    /// Resolve from explicit lookups. `env` is keyed by environment variable
    /// name, `credentials` by keyring key.
    pub fn from_sources<E, C>(env: E, credentials: C) -> Result<Self>
    where
        E: Fn(&str) -> Option<String>,
        C: Fn(&str) -> Option<String>,
    {
        let env = |name: &str| env(name).filter(|v| !v.trim().is_empty());
        let connection_string = env(ENV_CONNECTION_STRING);

        let backend_url = env(ENV_SUPABASE_URL)
            .or_else(|| credentials(storage::KEY_SUPABASE_URL))
            .or_else(|| {
                connection_string
                    .as_deref()
                    .and_then(api::extract_url_from_connection_string)
            })
            .map(|url| api::normalize_backend_url(&url))
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                InventoryError::Config(format!(
                    "missing backend URL (set {ENV_SUPABASE_URL} or run `small-inventory login`)"
                ))
            })?;

        let anon_key = env(ENV_SUPABASE_ANON_KEY)
            .or_else(|| credentials(storage::KEY_SUPABASE_ANON_KEY))
            .or_else(|| {
                connection_string
                    .as_deref()
                    .and_then(api::extract_anon_key_from_connection_string)
            })
            .map(|key| key.trim().to_string())
            .ok_or_else(|| {
                InventoryError::Config(format!(
                    "missing anon key (set {ENV_SUPABASE_ANON_KEY} or run `small-inventory login`)"
                ))
            })?;

        let data_dir = env(ENV_DATA_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let locale = match env(ENV_LOCALE) {
            Some(raw) => Locale::parse(&raw).ok_or_else(|| {
                InventoryError::Config(format!("{ENV_LOCALE}: unsupported locale '{raw}'"))
            })?,
            None => Locale::default(),
        };

        let refresh_secs = parse_number::<u64>(&env, ENV_REFRESH_SECS)?
            .unwrap_or(DEFAULT_REFRESH_SECS)
            .max(MIN_REFRESH_SECS);
        let timeout = parse_number::<u64>(&env, ENV_TIMEOUT_SECS)?
            .map(Duration::from_secs)
            .unwrap_or(api::DEFAULT_TIMEOUT);
        let tolerance = parse_number::<f64>(&env, ENV_TOLERANCE)?
            .unwrap_or(DEFAULT_CONSISTENCY_TOLERANCE);
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(InventoryError::Config(format!(
                "{ENV_TOLERANCE}: must be a non-negative number"
            )));
        }

        Ok(Self {
            backend_url,
            anon_key,
            data_dir,
            locale,
            refresh_interval: Duration::from_secs(refresh_secs),
            request_timeout: timeout,
            consistency_tolerance: tolerance,
        })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn parse_number<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    match env(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| InventoryError::Config(format!("{name}: invalid number '{raw}'"))),
        None => Ok(None),
    }
}

/// Platform data directory for the local cache and logs.
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("com.thesmall.inventory")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn none(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_env_takes_precedence_over_keyring() {
        let config = InventoryConfig::from_sources(
            lookup(&[
                (ENV_SUPABASE_URL, "env.supabase.co"),
                (ENV_SUPABASE_ANON_KEY, "env-key"),
                (ENV_DATA_DIR, "/tmp/inv"),
            ]),
            lookup(&[
                (storage::KEY_SUPABASE_URL, "https://keyring.supabase.co"),
                (storage::KEY_SUPABASE_ANON_KEY, "keyring-key"),
            ]),
        )
        .unwrap();
        assert_eq!(config.backend_url, "https://env.supabase.co");
        assert_eq!(config.anon_key, "env-key");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/inv"));
        assert_eq!(config.locale, Locale::PtBr);
        assert_eq!(config.refresh_interval, Duration::from_secs(60));
        assert_eq!(config.consistency_tolerance, DEFAULT_CONSISTENCY_TOLERANCE);
    }

    #[test]
    fn test_keyring_then_connection_string_fallback() {
        let config = InventoryConfig::from_sources(
            lookup(&[(
                ENV_CONNECTION_STRING,
                r#"{"url":"cs.supabase.co","key":"cs-key"}"#,
            )]),
            lookup(&[(storage::KEY_SUPABASE_URL, "https://keyring.supabase.co")]),
        )
        .unwrap();
        assert_eq!(config.backend_url, "https://keyring.supabase.co");
        assert_eq!(config.anon_key, "cs-key");
    }

    #[test]
    fn test_missing_credentials_is_config_error() {
        let err = InventoryConfig::from_sources(none, none).unwrap_err();
        assert!(matches!(err, InventoryError::Config(ref m) if m.contains("backend URL")));
    }

    #[test]
    fn test_tunables_are_validated() {
        let base = [
            (ENV_SUPABASE_URL, "x.supabase.co"),
            (ENV_SUPABASE_ANON_KEY, "k"),
        ];

        let mut pairs = base.to_vec();
        pairs.push((ENV_REFRESH_SECS, "1"));
        pairs.push((ENV_LOCALE, "en-US"));
        let config = InventoryConfig::from_sources(lookup(&pairs), none).unwrap();
        assert_eq!(config.refresh_interval, Duration::from_secs(MIN_REFRESH_SECS));
        assert_eq!(config.locale, Locale::EnUs);

        let mut pairs = base.to_vec();
        pairs.push((ENV_TOLERANCE, "-1"));
        assert!(InventoryConfig::from_sources(lookup(&pairs), none).is_err());

        let mut pairs = base.to_vec();
        pairs.push((ENV_TIMEOUT_SECS, "soon"));
        assert!(InventoryConfig::from_sources(lookup(&pairs), none).is_err());

        let mut pairs = base.to_vec();
        pairs.push((ENV_LOCALE, "tlh"));
        assert!(InventoryConfig::from_sources(lookup(&pairs), none).is_err());
    }

    #[test]
    #[serial]
    fn test_resolve_reads_process_environment() {
        std::env::set_var(ENV_SUPABASE_URL, "proc.supabase.co");
        std::env::set_var(ENV_SUPABASE_ANON_KEY, "proc-key");
        std::env::set_var(ENV_TOLERANCE, "0.5");
        let config = InventoryConfig::resolve();
        std::env::remove_var(ENV_SUPABASE_URL);
        std::env::remove_var(ENV_SUPABASE_ANON_KEY);
        std::env::remove_var(ENV_TOLERANCE);

        let config = config.unwrap();
        assert_eq!(config.backend_url, "https://proc.supabase.co");
        assert_eq!(config.anon_key, "proc-key");
        assert_eq!(config.consistency_tolerance, 0.5);
    }

    #[test]
    fn test_default_data_dir_is_stable() {
        let d1 = default_data_dir();
        let d2 = default_data_dir();
        assert_eq!(d1, d2);
        assert!(d1.to_string_lossy().contains("com.thesmall.inventory"));
    }
}
