//! Backend credential storage using the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Holds the hosted backend URL and its
//! anon key so operators do not keep them in shell profiles.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{InventoryError, Result};

const SERVICE_NAME: &str = "the-small-inventory";

// Credential keys
pub const KEY_SUPABASE_URL: &str = "supabase_url";
pub const KEY_SUPABASE_ANON_KEY: &str = "supabase_anon_key";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_SUPABASE_URL, KEY_SUPABASE_ANON_KEY];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw).filter(|v| !v.trim().is_empty()),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(keyring_error)?;
    entry.set_password(value).map_err(keyring_error)?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(keyring_error)?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(keyring_error(e)),
    }
}

fn keyring_error(err: keyring::Error) -> InventoryError {
    InventoryError::Config(format!("keyring: {err}"))
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Persist backend credentials. The URL is normalized before storage.
pub fn store_backend_credentials(url: &str, anon_key: &str) -> Result<()> {
    let normalized = crate::api::normalize_backend_url(url);
    if normalized.is_empty() {
        return Err(InventoryError::Config("backend URL is empty".into()));
    }
    if anon_key.trim().is_empty() {
        return Err(InventoryError::Config("anon key is empty".into()));
    }
    set_credential(KEY_SUPABASE_URL, &normalized)?;
    set_credential(KEY_SUPABASE_ANON_KEY, anon_key.trim())?;
    info!(url = %normalized, "Stored backend credentials");
    Ok(())
}

/// Remove every stored credential.
pub fn clear_credentials() -> Result<()> {
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    info!("Cleared backend credentials");
    Ok(())
}

/// Stored configuration as JSON with the anon key masked.
pub fn get_masked_config() -> Value {
    serde_json::json!({
        "supabase_url": get_credential(KEY_SUPABASE_URL),
        "supabase_anon_key": get_credential(KEY_SUPABASE_ANON_KEY).map(|k| mask_secret(&k)),
    })
}

/// Keep only the last four characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return "unset".to_string();
    }
    let suffix: String = trimmed
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<char>>()
        .into_iter()
        .rev()
        .collect();
    format!("***{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret_keeps_last_four() {
        assert_eq!(mask_secret("eyJhbGciOi.abcd1234"), "***1234");
        assert_eq!(mask_secret("ab"), "***ab");
        assert_eq!(mask_secret("   "), "unset");
    }
}
