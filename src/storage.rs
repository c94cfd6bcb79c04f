//! Kiosk credentials in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Environment variables always win over
//! stored values; see [`crate::config`].

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::normalize_supabase_url;
use crate::error::{Error, Result};

const SERVICE_NAME: &str = "wild-beans";

pub const KEY_SUPABASE_URL: &str = "supabase_url";
pub const KEY_SUPABASE_ANON_KEY: &str = "supabase_anon_key";
pub const KEY_ADMIN_SECRET: &str = "admin_secret";

const ALL_KEYS: &[&str] = &[KEY_SUPABASE_URL, KEY_SUPABASE_ANON_KEY, KEY_ADMIN_SECRET];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Returns `None` when the entry does not exist or the platform store is
/// unavailable.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| Error::Config(e.to_string()))?;
    entry
        .set_password(value)
        .map_err(|e| Error::Config(format!("could not store {key}: {e}")))
}

/// Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| Error::Config(e.to_string()))?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(Error::Config(format!("could not delete {key}: {e}"))),
    }
}

pub fn is_configured() -> bool {
    get_credential(KEY_SUPABASE_URL).is_some() && get_credential(KEY_SUPABASE_ANON_KEY).is_some()
}

pub fn factory_reset() -> Result<()> {
    info!("deleting all stored credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

/// Decoded kiosk provisioning string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioning {
    pub url: String,
    pub key: String,
    pub secret: Option<String>,
}

fn decode_payload(raw: &str) -> Option<Value> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(raw.trim())
            .or_else(|_| serde_json::from_str::<Value>(&compact))
            .ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let standard = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        standard,
        "=".repeat((4 - standard.len() % 4) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

/// Accepts `{"url","key","secret"?}` as JSON or URL-safe base64 of JSON.
pub fn decode_provisioning(raw: &str) -> Result<Provisioning> {
    let payload = decode_payload(raw)
        .ok_or_else(|| Error::Config("Provisioning string is not valid JSON or base64".into()))?;
    let field = |name: &str| {
        payload
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let url = field("url").ok_or_else(|| Error::Config("Provisioning is missing url".into()))?;
    let key = field("key").ok_or_else(|| Error::Config("Provisioning is missing key".into()))?;
    Ok(Provisioning {
        url: normalize_supabase_url(&url),
        key,
        secret: field("secret"),
    })
}

/// Store a provisioning string in one step.
pub fn provision(raw: &str) -> Result<Provisioning> {
    let provisioning = decode_provisioning(raw)?;
    set_credential(KEY_SUPABASE_URL, &provisioning.url)?;
    set_credential(KEY_SUPABASE_ANON_KEY, &provisioning.key)?;
    if let Some(secret) = provisioning.secret.as_deref() {
        set_credential(KEY_ADMIN_SECRET, secret)?;
    }
    info!(url = %provisioning.url, "kiosk provisioned");
    Ok(provisioning)
}
